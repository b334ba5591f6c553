//! Contracts of the two remote collaborators: the key service and the token
//! endpoint.

use std::fmt;

use crate::credential::{AccessToken, Credential};
use crate::error::VaultResult;
use crate::key_ref::KeyReference;

/// Asymmetric encryption algorithms understood by the key service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionAlgorithm {
    /// OAEP with SHA-1 and MGF1-SHA-1.
    RsaOaep,
    /// OAEP with SHA-256 and MGF1-SHA-256.
    RsaOaep256,
}

impl EncryptionAlgorithm {
    /// Algorithm name on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RsaOaep => "RSA-OAEP",
            Self::RsaOaep256 => "RSA-OAEP-256",
        }
    }

    pub fn hash_len(self) -> usize {
        match self {
            Self::RsaOaep => 20,
            Self::RsaOaep256 => 32,
        }
    }

    /// Largest plaintext that fits a key of `modulus_len` bytes.
    pub fn max_plaintext_len(self, modulus_len: usize) -> usize {
        modulus_len.saturating_sub(2 * self.hash_len() + 2)
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public, non-sensitive description of a remote RSA key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    /// Identifier as reported by the service, usually with a version suffix.
    pub kid: String,
    /// Big-endian modulus.
    pub modulus: Vec<u8>,
    /// Big-endian public exponent.
    pub public_exponent: Vec<u8>,
}

impl KeyBundle {
    /// Modulus length in bytes, which is also the ciphertext length.
    pub fn modulus_len(&self) -> usize {
        let leading_zeros = self.modulus.iter().take_while(|b| **b == 0).count();
        self.modulus.len() - leading_zeros
    }

    pub fn modulus_bits(&self) -> usize {
        match self.modulus.iter().position(|b| *b != 0) {
            Some(first) => {
                (self.modulus.len() - first) * 8 - self.modulus[first].leading_zeros() as usize
            }
            None => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateKeyRequest {
    pub key: KeyReference,
    pub key_size: usize,
}

/// Remote key operations.
///
/// `create_key` must be idempotent on the key reference: asking for a key
/// that already exists returns the existing key.
pub trait KeyService: Send + Sync {
    fn create_key(
        &self,
        token: &AccessToken,
        request: &CreateKeyRequest,
    ) -> VaultResult<KeyBundle>;

    fn encrypt(
        &self,
        token: &AccessToken,
        key: &KeyReference,
        algorithm: EncryptionAlgorithm,
        plaintext: &[u8],
    ) -> VaultResult<Vec<u8>>;

    fn decrypt(
        &self,
        token: &AccessToken,
        key: &KeyReference,
        algorithm: EncryptionAlgorithm,
        ciphertext: &[u8],
    ) -> VaultResult<Vec<u8>>;
}

/// Issues bearer tokens for credentials.
pub trait TokenSource: Send + Sync {
    fn acquire(&self, credential: &Credential) -> VaultResult<AccessToken>;
}
