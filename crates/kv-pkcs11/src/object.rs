//! Object table: key objects standing in for keys held by the vault.

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CKO_PRIVATE_KEY,
    CKO_PUBLIC_KEY,
};
use kv_core::{CreateKeyRequest, KeyBundle, KeyReference};
use std::sync::Arc;
use tracing::{debug, info};

use crate::attribute::{AttributeLookup, KeyPairRequest, Template};
use crate::context::Provider;
use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::mechanism::MechanismSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
}

impl ObjectClass {
    pub fn as_ck(self) -> CK_OBJECT_CLASS {
        match self {
            Self::PublicKey => CKO_PUBLIC_KEY,
            Self::PrivateKey => CKO_PRIVATE_KEY,
        }
    }
}

/// What the provider knows about a remote key. Shared by both halves of a
/// pair; none of it is secret.
#[derive(Debug)]
pub(crate) struct RemoteKey {
    pub reference: KeyReference,
    pub id: Vec<u8>,
    pub label: Option<Vec<u8>>,
    pub bundle: KeyBundle,
}

impl RemoteKey {
    /// Byte length of the modulus, and of every ciphertext.
    pub fn modulus_len(&self) -> usize {
        self.bundle.modulus_len()
    }
}

pub(crate) struct KeyObject {
    pub class: ObjectClass,
    pub key: Arc<RemoteKey>,
}

/// Handles of a freshly registered key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPairHandles {
    pub public: CK_OBJECT_HANDLE,
    pub private: CK_OBJECT_HANDLE,
}

impl Provider {
    /// Create the key named by the template's `CKA_ID` in the vault, or bind
    /// to it if it already exists, and register a public/private object pair
    /// for it.
    ///
    /// The remote call is idempotent on the identifier, so a call that fails
    /// after the key was created can simply be repeated.
    pub fn generate_key_pair(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &MechanismSpec,
        public_template: &Template,
        private_template: &Template,
    ) -> Pkcs11Result<KeyPairHandles> {
        let (epoch, credential, request) = {
            let tables = self.tables()?;
            let credential = tables.session(session)?.credential()?;
            mechanism.key_pair_gen()?;
            let request = KeyPairRequest::from_templates(public_template, private_template)?;
            (tables.epoch, credential, request)
        };

        let create = CreateKeyRequest {
            key: request.reference.clone(),
            key_size: request.modulus_bits.unwrap_or(self.key_size),
        };
        debug!(
            "creating or binding {} ({} bits)",
            create.key, create.key_size
        );
        let bundle = self.call_remote(&credential, "key creation", |vault, token| {
            vault.create_key(token, &create)
        })?;
        if bundle.modulus_len() == 0 {
            return Err(Pkcs11Error::DeviceError(format!(
                "{} came back without a modulus",
                request.reference
            )));
        }

        let key = Arc::new(RemoteKey {
            reference: request.reference,
            id: request.id,
            label: request.label,
            bundle,
        });
        let mut tables = self.tables_for_commit(epoch)?;
        tables.session(session)?;
        if !tables.objects.has_room(2) {
            return Err(Pkcs11Error::FunctionFailed("object table is full".into()));
        }
        let public = tables
            .objects
            .insert(KeyObject {
                class: ObjectClass::PublicKey,
                key: Arc::clone(&key),
            })
            .ok_or_else(|| Pkcs11Error::FunctionFailed("object table is full".into()))?;
        let private = tables
            .objects
            .insert(KeyObject {
                class: ObjectClass::PrivateKey,
                key: Arc::clone(&key),
            })
            .ok_or_else(|| Pkcs11Error::FunctionFailed("object table is full".into()))?;
        info!(
            "registered key pair for {} ({} bits): public {}, private {}",
            key.reference,
            key.bundle.modulus_bits(),
            public,
            private
        );
        Ok(KeyPairHandles { public, private })
    }

    /// Forget an object handle. The remote key is left untouched.
    pub fn destroy_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> Pkcs11Result<()> {
        let mut tables = self.tables()?;
        tables.session(session)?;
        let removed = tables
            .objects
            .remove(object)
            .ok_or(Pkcs11Error::ObjectHandleInvalid)?;
        info!(
            "destroyed {:?} object {} for {}",
            removed.class, object, removed.key.reference
        );
        Ok(())
    }

    pub fn attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> Pkcs11Result<Vec<AttributeLookup>> {
        let tables = self.tables()?;
        tables.session(session)?;
        let object = tables
            .objects
            .get(object)
            .ok_or(Pkcs11Error::ObjectHandleInvalid)?;
        Ok(kinds.iter().map(|kind| object.attribute(*kind)).collect())
    }

    pub fn object_count(&self) -> Pkcs11Result<usize> {
        Ok(self.tables()?.objects.len())
    }
}
