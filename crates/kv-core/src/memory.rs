//! In-process stand-ins for the key vault and the token endpoint.
//!
//! Both do the real thing locally (RSA-OAEP with the `rsa` crate, expiring
//! tokens) and can be told to fail, so the provider can be exercised without
//! a network.

use parking_lot::Mutex;
use rand::thread_rng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::credential::{AccessToken, Credential};
use crate::error::{VaultError, VaultResult};
use crate::key_ref::KeyReference;
use crate::service::{CreateKeyRequest, EncryptionAlgorithm, KeyBundle, KeyService, TokenSource};

/// Remote operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultOp {
    Create,
    Encrypt,
    Decrypt,
}

struct StoredKey {
    bundle: KeyBundle,
    version: String,
    private: RsaPrivateKey,
}

#[derive(Default)]
struct Counters {
    create: AtomicUsize,
    encrypt: AtomicUsize,
    decrypt: AtomicUsize,
    generated: AtomicUsize,
}

/// A key vault held in process memory.
pub struct MemoryVault {
    key_size: usize,
    keys: Mutex<HashMap<String, StoredKey>>,
    failures: Mutex<VecDeque<(VaultOp, VaultError)>>,
    counters: Counters,
}

impl MemoryVault {
    pub fn new(key_size: usize) -> Self {
        Self {
            key_size,
            keys: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    /// Make the next call of kind `op` fail with `err`. Failures queue up in
    /// order and each one is consumed by a single call.
    pub fn fail_next(&self, op: VaultOp, err: VaultError) {
        self.failures.lock().push_back((op, err));
    }

    /// Number of calls received for `op`, including failed ones.
    pub fn calls(&self, op: VaultOp) -> usize {
        let counter = match op {
            VaultOp::Create => &self.counters.create,
            VaultOp::Encrypt => &self.counters.encrypt,
            VaultOp::Decrypt => &self.counters.decrypt,
        };
        counter.load(Ordering::SeqCst)
    }

    /// Number of distinct keys ever generated.
    pub fn keys_generated(&self) -> usize {
        self.counters.generated.load(Ordering::SeqCst)
    }

    fn enter(&self, op: VaultOp) -> VaultResult<()> {
        match op {
            VaultOp::Create => &self.counters.create,
            VaultOp::Encrypt => &self.counters.encrypt,
            VaultOp::Decrypt => &self.counters.decrypt,
        }
        .fetch_add(1, Ordering::SeqCst);

        let mut failures = self.failures.lock();
        if let Some(position) = failures.iter().position(|(kind, _)| *kind == op) {
            if let Some((_, err)) = failures.remove(position) {
                debug!("memory vault injecting {:?} failure: {}", op, err);
                return Err(err);
            }
        }
        Ok(())
    }

    fn slot(key: &KeyReference) -> String {
        format!("{}/{}", key.vault(), key.name())
    }

    fn with_key<T>(
        &self,
        key: &KeyReference,
        f: impl FnOnce(&StoredKey) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let keys = self.keys.lock();
        let stored = keys
            .get(&Self::slot(key))
            .filter(|stored| key.version().is_none_or(|v| v == stored.version))
            .ok_or_else(|| VaultError::KeyNotFound(key.to_string()))?;
        f(stored)
    }
}

impl Default for MemoryVault {
    fn default() -> Self {
        Self::new(2048)
    }
}

fn oaep(algorithm: EncryptionAlgorithm) -> Oaep {
    match algorithm {
        EncryptionAlgorithm::RsaOaep => Oaep::new::<sha1::Sha1>(),
        EncryptionAlgorithm::RsaOaep256 => Oaep::new::<sha2::Sha256>(),
    }
}

impl KeyService for MemoryVault {
    fn create_key(
        &self,
        _token: &AccessToken,
        request: &CreateKeyRequest,
    ) -> VaultResult<KeyBundle> {
        self.enter(VaultOp::Create)?;
        if let Ok(bundle) = self.with_key(&request.key, |stored| Ok(stored.bundle.clone())) {
            return Ok(bundle);
        }
        if request.key.version().is_some() {
            return Err(VaultError::KeyNotFound(request.key.to_string()));
        }

        // Generate outside the table lock; a racing creator of the same name
        // wins and this key is thrown away.
        let key_size = if request.key_size == 0 {
            self.key_size
        } else {
            request.key_size
        };
        let private = RsaPrivateKey::new(&mut thread_rng(), key_size)
            .map_err(|e| VaultError::BadRequest(format!("key generation failed: {e}")))?;
        let version = Uuid::new_v4().simple().to_string();
        let bundle = KeyBundle {
            kid: format!("{}/{}", request.key.key_url(), version),
            modulus: private.n().to_bytes_be(),
            public_exponent: private.e().to_bytes_be(),
        };

        let mut keys = self.keys.lock();
        let stored = keys.entry(Self::slot(&request.key)).or_insert_with(|| {
            self.counters.generated.fetch_add(1, Ordering::SeqCst);
            StoredKey {
                bundle,
                version,
                private,
            }
        });
        Ok(stored.bundle.clone())
    }

    fn encrypt(
        &self,
        _token: &AccessToken,
        key: &KeyReference,
        algorithm: EncryptionAlgorithm,
        plaintext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        self.enter(VaultOp::Encrypt)?;
        self.with_key(key, |stored| {
            let public = RsaPublicKey::from(&stored.private);
            public
                .encrypt(&mut thread_rng(), oaep(algorithm), plaintext)
                .map_err(|e| VaultError::BadRequest(e.to_string()))
        })
    }

    fn decrypt(
        &self,
        _token: &AccessToken,
        key: &KeyReference,
        algorithm: EncryptionAlgorithm,
        ciphertext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        self.enter(VaultOp::Decrypt)?;
        self.with_key(key, |stored| {
            stored
                .private
                .decrypt(oaep(algorithm), ciphertext)
                .map_err(|e| VaultError::BadRequest(e.to_string()))
        })
    }
}

/// Token endpoint held in process memory.
///
/// The managed identity is available unless disabled; client credentials
/// must be registered first.
pub struct MemoryTokenSource {
    managed_identity: AtomicBool,
    clients: Mutex<HashMap<String, SecretString>>,
    lifetime: Mutex<time::Duration>,
    latency: Mutex<Duration>,
    failures: Mutex<VecDeque<VaultError>>,
    acquisitions: AtomicUsize,
}

impl MemoryTokenSource {
    pub fn new() -> Self {
        Self {
            managed_identity: AtomicBool::new(true),
            clients: Mutex::new(HashMap::new()),
            lifetime: Mutex::new(time::Duration::hours(1)),
            latency: Mutex::new(Duration::ZERO),
            failures: Mutex::new(VecDeque::new()),
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn register_client(&self, client_id: &str, secret: &str) {
        self.clients
            .lock()
            .insert(client_id.to_string(), SecretString::new(secret.to_string()));
    }

    pub fn set_managed_identity(&self, available: bool) {
        self.managed_identity.store(available, Ordering::SeqCst);
    }

    /// Lifetime of tokens issued from now on.
    pub fn set_token_lifetime(&self, lifetime: time::Duration) {
        *self.lifetime.lock() = lifetime;
    }

    /// Delay applied to every acquisition, to widen race windows in tests.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail_next(&self, err: VaultError) {
        self.failures.lock().push_back(err);
    }

    /// Number of acquisitions attempted, including failed ones.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource for MemoryTokenSource {
    fn acquire(&self, credential: &Credential) -> VaultResult<AccessToken> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        match credential {
            Credential::ManagedIdentity => {
                if !self.managed_identity.load(Ordering::SeqCst) {
                    return Err(VaultError::Unauthorized(
                        "no managed identity on this host".into(),
                    ));
                }
            }
            Credential::ClientSecret { client_id, secret } => {
                let clients = self.clients.lock();
                let registered = clients.get(client_id).ok_or_else(|| {
                    VaultError::Unauthorized(format!("unknown client {client_id}"))
                })?;
                if registered.expose_secret() != secret.expose_secret() {
                    return Err(VaultError::Unauthorized(format!(
                        "invalid secret for {client_id}"
                    )));
                }
            }
        }
        Ok(AccessToken::expires_in(
            Uuid::new_v4().to_string(),
            *self.lifetime.lock(),
        ))
    }
}
