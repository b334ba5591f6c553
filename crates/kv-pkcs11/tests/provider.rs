use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CKA_CLASS, CKA_ID, CKA_LABEL,
    CKA_MODULUS, CKA_MODULUS_BITS, CKA_PRIVATE_EXPONENT, CKA_PUBLIC_EXPONENT, CKA_VALUE,
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKG_MGF1_SHA256, CKM_RSA_PKCS, CKM_RSA_PKCS_KEY_PAIR_GEN,
    CKM_RSA_PKCS_OAEP, CKM_SHA256, CKO_PRIVATE_KEY, CKR_DEVICE_ERROR, CKR_FUNCTION_FAILED,
    CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID, CKS_RO_PUBLIC_SESSION,
    CKS_RW_USER_FUNCTIONS,
};
use kv_core::{
    Backend, MemoryTokenSource, MemoryVault, ProviderConfig, RetryConfig, VaultError, VaultOp,
};
use kv_pkcs11::{
    AttributeLookup, InitArgs, KeyPairHandles, MechanismSpec, Output, Pkcs11Error, Pkcs11Result,
    Provider, SLOT_ID, Template,
};
use rsa::{BigUint, Oaep, RsaPublicKey};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const KEY1: &str = "https://vault.example/keys/key1";
const KEY2: &str = "https://vault.example/keys/key2";
const MODULUS_LEN: usize = 128;
const CLIENT_PIN: &[u8] = b"clientid=app-1;secret=s3cret";

struct Harness {
    provider: Provider,
    vault: Arc<MemoryVault>,
    tokens: Arc<MemoryTokenSource>,
}

fn config() -> ProviderConfig {
    let mut config = ProviderConfig::default();
    config.vault.key_size = 1024;
    config.retry = RetryConfig {
        initial_interval_ms: 1,
        multiplier: 1.0,
        max_interval_ms: 1,
        max_elapsed_ms: 2_000,
        max_attempts: 3,
    };
    config
}

fn harness() -> Harness {
    let vault = Arc::new(MemoryVault::new(1024));
    let tokens = Arc::new(MemoryTokenSource::new());
    tokens.register_client("app-1", "s3cret");
    let provider = Provider::new(Backend::memory(vault.clone(), tokens.clone()), &config());
    provider
        .initialize(InitArgs::os_locking())
        .expect("initialize");
    Harness {
        provider,
        vault,
        tokens,
    }
}

impl Harness {
    fn open(&self) -> CK_SESSION_HANDLE {
        self.provider
            .open_session(SLOT_ID, CKF_SERIAL_SESSION | CKF_RW_SESSION)
            .expect("open session")
    }

    fn logged_in(&self) -> CK_SESSION_HANDLE {
        let session = self.open();
        self.provider.login(session, b"").expect("login");
        session
    }

    fn generate(&self, session: CK_SESSION_HANDLE, id: &str) -> Pkcs11Result<KeyPairHandles> {
        self.provider.generate_key_pair(
            session,
            &MechanismSpec::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
            &Template::new().with(CKA_ID, id.as_bytes()),
            &Template::new(),
        )
    }

    fn encrypt_all(&self, session: CK_SESSION_HANDLE, plaintext: &[u8]) -> Vec<u8> {
        match self
            .provider
            .encrypt(session, plaintext, Some(MODULUS_LEN))
            .expect("encrypt")
        {
            Output::Written(ciphertext) => ciphertext.to_vec(),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn decrypt_all(&self, session: CK_SESSION_HANDLE, ciphertext: &[u8]) -> Vec<u8> {
        match self
            .provider
            .decrypt(session, ciphertext, Some(MODULUS_LEN))
            .expect("decrypt")
        {
            Output::Written(plaintext) => plaintext.to_vec(),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn lookup(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kind: CK_ATTRIBUTE_TYPE,
    ) -> AttributeLookup {
        self.provider
            .attribute_values(session, object, &[kind])
            .expect("attributes")
            .remove(0)
    }
}

fn oaep() -> MechanismSpec {
    MechanismSpec::new(CKM_RSA_PKCS_OAEP)
}

fn sample() -> Vec<u8> {
    (0u8..16).collect()
}

#[test]
fn key_operations_before_login_are_refused() {
    let h = harness();
    let owner = h.logged_in();
    let keys = h.generate(owner, KEY1).expect("generate");
    let session = h.open();

    assert_eq!(h.generate(session, KEY2), Err(Pkcs11Error::UserNotLoggedIn));
    assert_eq!(
        h.provider.encrypt_init(session, &oaep(), keys.public),
        Err(Pkcs11Error::UserNotLoggedIn)
    );
    assert_eq!(
        h.provider.decrypt_init(session, &oaep(), keys.private),
        Err(Pkcs11Error::UserNotLoggedIn)
    );
    assert_eq!(h.provider.object_count(), Ok(2));
    assert_eq!(h.vault.calls(VaultOp::Create), 1);
}

#[test]
fn missing_identifier_allocates_nothing() {
    let h = harness();
    let session = h.logged_in();
    let result = h.provider.generate_key_pair(
        session,
        &MechanismSpec::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
        &Template::new().with(CKA_LABEL, "no id"),
        &Template::new(),
    );
    assert_eq!(result, Err(Pkcs11Error::TemplateIncomplete));
    assert_eq!(h.provider.object_count(), Ok(0));
    assert_eq!(h.vault.calls(VaultOp::Create), 0);
}

#[test]
fn identifier_must_be_a_key_url() {
    let h = harness();
    let session = h.logged_in();
    assert!(matches!(
        h.generate(session, "key1"),
        Err(Pkcs11Error::ArgumentsBad(_))
    ));
    assert!(matches!(
        h.generate(session, "https://vault.example/secrets/key1"),
        Err(Pkcs11Error::ArgumentsBad(_))
    ));
    assert_eq!(h.provider.object_count(), Ok(0));
}

#[test]
fn generation_is_idempotent_on_the_identifier() {
    let h = harness();
    let session = h.logged_in();
    let first = h.generate(session, KEY1).expect("first");
    let second = h.generate(session, KEY1).expect("second");

    let handles = [first.public, first.private, second.public, second.private];
    assert!(handles.iter().all(|handle| *handle != 0));
    for (i, a) in handles.iter().enumerate() {
        for b in &handles[i + 1..] {
            assert_ne!(a, b);
        }
    }
    assert_eq!(h.vault.keys_generated(), 1);
    assert_eq!(
        h.lookup(session, first.public, CKA_MODULUS),
        h.lookup(session, second.private, CKA_MODULUS)
    );
    assert_eq!(
        h.lookup(session, second.public, CKA_ID),
        AttributeLookup::Value(KEY1.as_bytes().to_vec())
    );

    // Ciphertext from the first pair decrypts under the second.
    h.provider
        .encrypt_init(session, &oaep(), first.public)
        .expect("encrypt init");
    let ciphertext = h.encrypt_all(session, &sample());
    h.provider
        .decrypt_init(session, &oaep(), second.private)
        .expect("decrypt init");
    assert_eq!(h.decrypt_all(session, &ciphertext), sample());
}

#[test]
fn generation_after_finalize_binds_the_same_key() {
    let h = harness();
    let session = h.logged_in();
    h.generate(session, KEY1).expect("generate");
    h.provider.finalize().expect("finalize");
    h.provider
        .initialize(InitArgs::os_locking())
        .expect("initialize");

    let session = h.logged_in();
    h.generate(session, KEY1).expect("regenerate");
    assert_eq!(h.vault.keys_generated(), 1);
}

#[test]
fn only_supported_mechanisms_are_accepted() {
    let h = harness();
    let session = h.logged_in();
    let result = h.provider.generate_key_pair(
        session,
        &MechanismSpec::new(CKM_RSA_PKCS_OAEP),
        &Template::new().with(CKA_ID, KEY1),
        &Template::new(),
    );
    assert_eq!(result, Err(Pkcs11Error::MechanismInvalid));

    let keys = h.generate(session, KEY1).expect("generate");
    assert_eq!(
        h.provider
            .encrypt_init(session, &MechanismSpec::new(CKM_RSA_PKCS), keys.public),
        Err(Pkcs11Error::MechanismInvalid)
    );
    assert!(matches!(
        h.provider.encrypt_init(
            session,
            &MechanismSpec::oaep(CKM_SHA256, cryptoki_sys::CKG_MGF1_SHA1),
            keys.public
        ),
        Err(Pkcs11Error::MechanismParamInvalid(_))
    ));
}

#[test]
fn operations_need_a_key_of_the_right_class() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    assert_eq!(
        h.provider.encrypt_init(session, &oaep(), keys.private),
        Err(Pkcs11Error::KeyHandleInvalid)
    );
    assert_eq!(
        h.provider.decrypt_init(session, &oaep(), keys.public),
        Err(Pkcs11Error::KeyHandleInvalid)
    );
    assert_eq!(
        h.provider.encrypt_init(session, &oaep(), 0x7fff_ffff),
        Err(Pkcs11Error::KeyHandleInvalid)
    );
}

#[test]
fn steps_without_init_fail() {
    let h = harness();
    let session = h.logged_in();
    assert_eq!(
        h.provider.encrypt(session, &sample(), Some(MODULUS_LEN)),
        Err(Pkcs11Error::OperationNotInitialized)
    );
    assert_eq!(
        h.provider.decrypt(session, &[0; MODULUS_LEN], None),
        Err(Pkcs11Error::OperationNotInitialized)
    );
}

#[test]
fn second_init_is_operation_active() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");
    assert_eq!(
        h.provider.encrypt_init(session, &oaep(), keys.public),
        Err(Pkcs11Error::OperationActive)
    );
    assert_eq!(
        h.provider.decrypt_init(session, &oaep(), keys.private),
        Err(Pkcs11Error::OperationActive)
    );
    // Still the encrypt operation.
    assert_eq!(h.encrypt_all(session, &sample()).len(), MODULUS_LEN);
}

#[test]
fn undersized_buffer_keeps_the_operation() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");

    assert_eq!(
        h.provider.encrypt(session, &sample(), None),
        Ok(Output::SizeRequired(MODULUS_LEN))
    );
    assert_eq!(
        h.provider.encrypt(session, &sample(), Some(16)),
        Err(Pkcs11Error::BufferTooSmall {
            required: MODULUS_LEN
        })
    );
    assert_eq!(h.vault.calls(VaultOp::Encrypt), 0);

    assert_eq!(h.encrypt_all(session, &sample()).len(), MODULUS_LEN);
    assert_eq!(h.vault.calls(VaultOp::Encrypt), 1);
    assert_eq!(
        h.provider.encrypt(session, &sample(), Some(MODULUS_LEN)),
        Err(Pkcs11Error::OperationNotInitialized)
    );
}

#[test]
fn oversized_plaintext_keeps_the_operation() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");

    // k - 2*20 - 2 for SHA-1.
    let limit = MODULUS_LEN - 42;
    assert_eq!(
        h.provider.encrypt(session, &vec![7; limit + 1], Some(MODULUS_LEN)),
        Err(Pkcs11Error::DataLenInvalid)
    );
    assert_eq!(h.encrypt_all(session, &vec![7; limit]).len(), MODULUS_LEN);
}

#[test]
fn round_trip_with_both_oaep_hashes() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    let sha256 = MechanismSpec::oaep(CKM_SHA256, CKG_MGF1_SHA256);

    for mechanism in [oaep(), sha256] {
        for plaintext in [Vec::new(), sample(), vec![0xa5; MODULUS_LEN - 66]] {
            h.provider
                .encrypt_init(session, &mechanism, keys.public)
                .expect("encrypt init");
            let ciphertext = h.encrypt_all(session, &plaintext);
            assert_eq!(ciphertext.len(), MODULUS_LEN);

            h.provider
                .decrypt_init(session, &mechanism, keys.private)
                .expect("decrypt init");
            assert_eq!(h.decrypt_all(session, &ciphertext), plaintext);
        }
    }
}

#[test]
fn public_attributes_encrypt_for_the_vault_key() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    let value = |kind| match h.lookup(session, keys.public, kind) {
        AttributeLookup::Value(bytes) => bytes,
        other => panic!("unexpected {other:?}"),
    };
    let public = RsaPublicKey::new(
        BigUint::from_bytes_be(&value(CKA_MODULUS)),
        BigUint::from_bytes_be(&value(CKA_PUBLIC_EXPONENT)),
    )
    .expect("public key");
    let ciphertext = public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), &sample())
        .expect("local encrypt");

    h.provider
        .decrypt_init(session, &oaep(), keys.private)
        .expect("decrypt init");
    assert_eq!(h.decrypt_all(session, &ciphertext), sample());
}

#[test]
fn decrypt_size_negotiation_uses_one_remote_call() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("encrypt init");
    let ciphertext = h.encrypt_all(session, &sample());

    h.provider
        .decrypt_init(session, &oaep(), keys.private)
        .expect("decrypt init");
    assert_eq!(
        h.provider.decrypt(session, &ciphertext, None),
        Ok(Output::SizeRequired(16))
    );
    assert_eq!(
        h.provider.decrypt(session, &ciphertext, Some(4)),
        Err(Pkcs11Error::BufferTooSmall { required: 16 })
    );
    assert_eq!(h.decrypt_all(session, &ciphertext), sample());
    assert_eq!(h.vault.calls(VaultOp::Decrypt), 1);
}

#[test]
fn ciphertext_of_the_wrong_length_is_rejected() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .decrypt_init(session, &oaep(), keys.private)
        .expect("decrypt init");
    assert_eq!(
        h.provider.decrypt(session, &[1; 64], Some(MODULUS_LEN)),
        Err(Pkcs11Error::EncryptedDataLenInvalid)
    );
    assert_eq!(h.vault.calls(VaultOp::Decrypt), 0);

    // The operation survives; garbage of the right length reaches the vault.
    assert!(matches!(
        h.provider.decrypt(session, &[1; MODULUS_LEN], Some(MODULUS_LEN)),
        Err(Pkcs11Error::ArgumentsBad(_))
    ));
    assert_eq!(
        h.provider.decrypt(session, &[1; MODULUS_LEN], Some(MODULUS_LEN)),
        Err(Pkcs11Error::OperationNotInitialized)
    );
}

#[test]
fn closing_a_session_discards_its_operation() {
    let h = harness();
    let first = h.logged_in();
    let keys = h.generate(first, KEY1).expect("generate");
    h.provider
        .encrypt_init(first, &oaep(), keys.public)
        .expect("init");
    h.provider.close_session(first).expect("close");

    assert_eq!(
        h.provider.encrypt(first, &sample(), Some(MODULUS_LEN)),
        Err(Pkcs11Error::SessionHandleInvalid)
    );
    assert_eq!(
        h.provider.close_session(first),
        Err(Pkcs11Error::SessionHandleInvalid)
    );

    let second = h.logged_in();
    h.provider
        .encrypt_init(second, &oaep(), keys.public)
        .expect("objects outlive the session that created them");
}

#[test]
fn transient_failures_are_retried() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.vault.fail_next(VaultOp::Encrypt, VaultError::RateLimited);
    h.vault.fail_next(
        VaultOp::Encrypt,
        VaultError::Server {
            status: 503,
            message: "busy".into(),
        },
    );
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");
    assert_eq!(h.encrypt_all(session, &sample()).len(), MODULUS_LEN);
    assert_eq!(h.vault.calls(VaultOp::Encrypt), 3);
}

#[test]
fn exhausted_retries_map_and_clear_the_operation() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");

    let cases = [
        (vec![VaultError::RateLimited; 3], CKR_DEVICE_ERROR),
        (vec![VaultError::Timeout("slow".into()); 3], CKR_FUNCTION_FAILED),
        (
            vec![VaultError::Forbidden("policy".into())],
            CKR_KEY_FUNCTION_NOT_PERMITTED,
        ),
        (
            vec![VaultError::KeyNotFound(KEY1.into())],
            CKR_KEY_HANDLE_INVALID,
        ),
    ];
    for (failures, expected) in cases {
        for failure in failures {
            h.vault.fail_next(VaultOp::Encrypt, failure);
        }
        h.provider
            .encrypt_init(session, &oaep(), keys.public)
            .expect("init");
        let err = h
            .provider
            .encrypt(session, &sample(), Some(MODULUS_LEN))
            .expect_err("remote failure");
        assert_eq!(err.rv(), expected, "unexpected {err:?}");
        // The operation is gone, so the caller can start over.
        assert_eq!(
            h.provider.encrypt(session, &sample(), Some(MODULUS_LEN)),
            Err(Pkcs11Error::OperationNotInitialized)
        );
    }
}

#[test]
fn rejected_token_is_refreshed_once() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    assert_eq!(h.tokens.acquisitions(), 1);

    h.vault
        .fail_next(VaultOp::Encrypt, VaultError::Unauthorized("expired".into()));
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");
    assert_eq!(h.encrypt_all(session, &sample()).len(), MODULUS_LEN);
    assert_eq!(h.tokens.acquisitions(), 2);

    h.vault
        .fail_next(VaultOp::Encrypt, VaultError::Unauthorized("expired".into()));
    h.vault
        .fail_next(VaultOp::Encrypt, VaultError::Unauthorized("still".into()));
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");
    assert!(matches!(
        h.provider.encrypt(session, &sample(), Some(MODULUS_LEN)),
        Err(Pkcs11Error::NotAuthorized(_))
    ));
}

#[test]
fn login_validates_and_resolves_the_credential() {
    let h = harness();
    let session = h.open();

    assert!(matches!(
        h.provider.login(session, b"user=app-1"),
        Err(Pkcs11Error::CredentialFormatInvalid(_))
    ));
    assert!(matches!(
        h.provider.login(session, b"clientid=app-1;secret=wrong"),
        Err(Pkcs11Error::AuthenticationFailed(_))
    ));
    assert!(matches!(
        h.provider.login(session, b"clientid=ghost;secret=x"),
        Err(Pkcs11Error::AuthenticationFailed(_))
    ));
    assert_eq!(
        h.provider.session_info(session).map(|info| info.state),
        Ok(cryptoki_sys::CKS_RW_PUBLIC_SESSION)
    );

    h.provider.login(session, CLIENT_PIN).expect("login");
    assert_eq!(
        h.provider.login(session, CLIENT_PIN),
        Err(Pkcs11Error::UserAlreadyLoggedIn)
    );
    assert_eq!(
        h.provider.session_info(session).map(|info| info.state),
        Ok(CKS_RW_USER_FUNCTIONS)
    );

    h.provider.logout(session).expect("logout");
    assert_eq!(h.provider.logout(session), Err(Pkcs11Error::UserNotLoggedIn));
}

#[test]
fn managed_identity_can_be_unavailable() {
    let h = harness();
    h.tokens.set_managed_identity(false);
    let session = h.open();
    assert!(matches!(
        h.provider.login(session, b""),
        Err(Pkcs11Error::AuthenticationFailed(_))
    ));

    h.tokens.fail_next(VaultError::Transport("refused".into()));
    h.tokens.fail_next(VaultError::Transport("refused".into()));
    h.tokens.fail_next(VaultError::Transport("refused".into()));
    assert!(matches!(
        h.provider.login(session, CLIENT_PIN),
        Err(Pkcs11Error::ServiceUnavailable(_))
    ));
}

#[test]
fn tokens_are_shared_across_sessions_and_survive_logout() {
    let h = harness();
    let first = h.logged_in();
    let second = h.logged_in();
    assert_eq!(h.tokens.acquisitions(), 1);

    h.provider.logout(first).expect("logout");
    let keys = h.generate(second, KEY1).expect("generate");
    h.provider.login(first, b"").expect("login again");
    h.provider
        .encrypt_init(first, &oaep(), keys.public)
        .expect("init");
    h.encrypt_all(first, &sample());
    assert_eq!(h.tokens.acquisitions(), 1);
}

#[test]
fn logout_between_init_and_step_fails_the_step() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .encrypt_init(session, &oaep(), keys.public)
        .expect("init");
    h.provider.logout(session).expect("logout");
    assert_eq!(
        h.provider.encrypt(session, &sample(), Some(MODULUS_LEN)),
        Err(Pkcs11Error::UserNotLoggedIn)
    );
    assert_eq!(h.vault.calls(VaultOp::Encrypt), 0);
}

#[test]
fn session_opening_rules() {
    let h = harness();
    assert_eq!(
        h.provider.open_session(1, CKF_SERIAL_SESSION),
        Err(Pkcs11Error::SlotIdInvalid)
    );
    assert_eq!(
        h.provider.open_session(SLOT_ID, CKF_RW_SESSION),
        Err(Pkcs11Error::SessionFlagsInvalid)
    );
    let session = h
        .provider
        .open_session(SLOT_ID, CKF_SERIAL_SESSION)
        .expect("read-only session");
    let info = h.provider.session_info(session).expect("info");
    assert_eq!(info.slot_id, SLOT_ID);
    assert_eq!(info.state, CKS_RO_PUBLIC_SESSION);

    h.open();
    let counts = h.provider.session_counts().expect("counts");
    assert_eq!((counts.total, counts.read_write), (2, 1));

    h.provider.close_all_sessions(SLOT_ID).expect("close all");
    assert_eq!(
        h.provider.session_info(session),
        Err(Pkcs11Error::SessionHandleInvalid)
    );
}

#[test]
fn attributes_expose_public_data_only() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.provider
        .generate_key_pair(
            session,
            &MechanismSpec::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
            &Template::new()
                .with(CKA_ID, KEY1)
                .with(CKA_LABEL, "signing")
                .with_ulong(CKA_MODULUS_BITS, 1024),
            &Template::new().with(CKA_ID, KEY1),
        )
        .expect("generate");

    let values = h
        .provider
        .attribute_values(
            session,
            keys.private,
            &[CKA_CLASS, CKA_LABEL, CKA_MODULUS, CKA_PRIVATE_EXPONENT, CKA_VALUE],
        )
        .expect("attributes");
    assert_eq!(
        values[0],
        AttributeLookup::Value(CKO_PRIVATE_KEY.to_ne_bytes().to_vec())
    );
    assert_eq!(values[1], AttributeLookup::Value(b"signing".to_vec()));
    assert!(matches!(&values[2], AttributeLookup::Value(n) if n.len() == MODULUS_LEN));
    assert_eq!(values[3], AttributeLookup::Sensitive);
    assert_eq!(values[4], AttributeLookup::Invalid);

    assert_eq!(
        h.provider.attribute_values(session, 0, &[CKA_CLASS]),
        Err(Pkcs11Error::ObjectHandleInvalid)
    );
}

#[test]
fn key_size_comes_from_the_template_or_the_config() {
    let h = harness();
    let session = h.logged_in();
    let result = h.provider.generate_key_pair(
        session,
        &MechanismSpec::new(CKM_RSA_PKCS_KEY_PAIR_GEN),
        &Template::new()
            .with(CKA_ID, KEY1)
            .with_ulong(CKA_MODULUS_BITS, 1000),
        &Template::new(),
    );
    assert!(matches!(result, Err(Pkcs11Error::AttributeValueInvalid(_))));

    let keys = h.generate(session, KEY2).expect("generate");
    assert_eq!(
        h.lookup(session, keys.public, CKA_MODULUS_BITS),
        AttributeLookup::Value((1024 as cryptoki_sys::CK_ULONG).to_ne_bytes().to_vec())
    );
}

#[test]
fn destroyed_objects_are_gone_but_the_remote_key_stays() {
    let h = harness();
    let session = h.logged_in();
    let keys = h.generate(session, KEY1).expect("generate");
    h.provider
        .destroy_object(session, keys.public)
        .expect("destroy");
    assert_eq!(
        h.provider.destroy_object(session, keys.public),
        Err(Pkcs11Error::ObjectHandleInvalid)
    );
    assert_eq!(
        h.provider.encrypt_init(session, &oaep(), keys.public),
        Err(Pkcs11Error::KeyHandleInvalid)
    );
    assert_eq!(h.provider.object_count(), Ok(1));

    let again = h.generate(session, KEY1).expect("rebind");
    assert_ne!(again.public, keys.public);
    assert_eq!(h.vault.keys_generated(), 1);
}

#[test]
fn lifecycle_errors() {
    let h = harness();
    assert_eq!(
        h.provider.initialize(InitArgs::os_locking()),
        Err(Pkcs11Error::AlreadyInitialized)
    );
    let session = h.logged_in();
    h.generate(session, KEY1).expect("generate");

    h.provider.finalize().expect("finalize");
    assert_eq!(h.provider.finalize(), Err(Pkcs11Error::NotInitialized));
    assert_eq!(
        h.provider.open_session(SLOT_ID, CKF_SERIAL_SESSION),
        Err(Pkcs11Error::NotInitialized)
    );

    h.provider
        .initialize(InitArgs::os_locking())
        .expect("initialize again");
    assert_eq!(
        h.provider.session_info(session),
        Err(Pkcs11Error::SessionHandleInvalid)
    );
    assert_eq!(h.provider.object_count(), Ok(0));
    // The token cache was cleared too.
    h.logged_in();
    assert_eq!(h.tokens.acquisitions(), 2);
}

#[test]
fn finalize_during_login_discards_the_result() {
    let h = Arc::new(harness());
    let session = h.open();
    h.tokens.set_latency(Duration::from_millis(300));

    let worker = {
        let h = h.clone();
        thread::spawn(move || h.provider.login(session, b""))
    };
    thread::sleep(Duration::from_millis(100));
    h.provider.finalize().expect("finalize while login is in flight");

    assert_eq!(
        worker.join().expect("worker"),
        Err(Pkcs11Error::NotInitialized)
    );
    assert_eq!(h.provider.object_count(), Err(Pkcs11Error::NotInitialized));
}

#[test]
fn sessions_proceed_while_another_waits_on_the_vault() {
    let h = Arc::new(harness());
    let slow = h.open();
    h.tokens.set_latency(Duration::from_millis(300));

    let worker = {
        let h = h.clone();
        thread::spawn(move || h.provider.login(slow, b""))
    };
    thread::sleep(Duration::from_millis(50));
    // The table lock is not held across the token request.
    let other = h.open();
    assert!(h.provider.session_info(other).is_ok());
    worker.join().expect("worker").expect("login");
}

#[test]
fn providers_are_independent() {
    let a = harness();
    let b = harness();
    let session = a.logged_in();
    a.generate(session, KEY1).expect("generate");
    assert_eq!(b.provider.object_count(), Ok(0));
    assert_eq!(b.provider.session_counts().map(|c| c.total), Ok(0));
}
