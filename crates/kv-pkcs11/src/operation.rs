//! Mechanism dispatcher: RSA-OAEP encrypt and decrypt through the vault.
//!
//! A session carries at most one active operation. It survives size queries
//! and undersized buffers and is cleared by a full write or by a remote
//! failure.

use cryptoki_sys::{CK_OBJECT_HANDLE, CK_SESSION_HANDLE};
use kv_core::{Credential, EncryptionAlgorithm};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::context::{Provider, Tables};
use crate::error::{Pkcs11Error, Pkcs11Result};
use crate::mechanism::MechanismSpec;
use crate::object::{ObjectClass, RemoteKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    fn key_class(self) -> ObjectClass {
        match self {
            Self::Encrypt => ObjectClass::PublicKey,
            Self::Decrypt => ObjectClass::PrivateKey,
        }
    }
}

/// A decrypt result held back while the caller sizes its buffer.
struct PendingPlaintext {
    ciphertext: Vec<u8>,
    plaintext: Zeroizing<Vec<u8>>,
}

pub(crate) struct ActiveOperation {
    direction: Direction,
    algorithm: EncryptionAlgorithm,
    key: Arc<RemoteKey>,
    /// Distinguishes this operation from a later one on the same session.
    serial: u64,
    pending: Option<PendingPlaintext>,
}

/// Result of a single-part step, before it is squeezed into the two-call
/// buffer convention.
#[derive(Debug, PartialEq, Eq)]
pub enum Output {
    /// The caller only asked how large the output is.
    SizeRequired(usize),
    /// The complete output. The operation is finished.
    Written(Zeroizing<Vec<u8>>),
}

/// Everything a step needs from the tables, taken under the lock.
struct StepSnapshot {
    epoch: u64,
    serial: u64,
    algorithm: EncryptionAlgorithm,
    key: Arc<RemoteKey>,
    credential: Arc<Credential>,
}

impl Provider {
    pub fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &MechanismSpec,
        key: CK_OBJECT_HANDLE,
    ) -> Pkcs11Result<()> {
        self.operation_init(session, mechanism, key, Direction::Encrypt)
    }

    pub fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &MechanismSpec,
        key: CK_OBJECT_HANDLE,
    ) -> Pkcs11Result<()> {
        self.operation_init(session, mechanism, key, Direction::Decrypt)
    }

    fn operation_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &MechanismSpec,
        key: CK_OBJECT_HANDLE,
        direction: Direction,
    ) -> Pkcs11Result<()> {
        let mut tables = self.tables()?;
        {
            let session = tables.session(session)?;
            session.credential()?;
            if session.operation.is_some() {
                return Err(Pkcs11Error::OperationActive);
            }
        }
        let algorithm = mechanism.oaep_algorithm()?;
        let object = tables
            .objects
            .get(key)
            .filter(|object| object.class == direction.key_class())
            .ok_or(Pkcs11Error::KeyHandleInvalid)?;
        let remote = Arc::clone(&object.key);
        let serial = tables.next_serial();
        debug!(
            "session {}: {:?} with {} under {}",
            session, direction, algorithm, remote.reference
        );
        tables.session_mut(session)?.operation = Some(ActiveOperation {
            direction,
            algorithm,
            key: remote,
            serial,
            pending: None,
        });
        Ok(())
    }

    /// Single-part encryption. `capacity` is the caller's buffer size, or
    /// `None` for a size query.
    ///
    /// Ciphertext is always exactly the key's byte length, so size queries
    /// and undersized buffers are answered without calling the vault.
    pub fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        plaintext: &[u8],
        capacity: Option<usize>,
    ) -> Pkcs11Result<Output> {
        let snapshot = {
            let tables = self.tables()?;
            let snapshot = step_snapshot(&tables, session, Direction::Encrypt)?;
            let required = snapshot.key.modulus_len();
            if plaintext.len() > snapshot.algorithm.max_plaintext_len(required) {
                return Err(Pkcs11Error::DataLenInvalid);
            }
            match capacity {
                None => return Ok(Output::SizeRequired(required)),
                Some(capacity) if capacity < required => {
                    return Err(Pkcs11Error::BufferTooSmall { required });
                }
                Some(_) => snapshot,
            }
        };

        let result = self
            .call_remote(&snapshot.credential, "encrypt", |vault, token| {
                vault.encrypt(
                    token,
                    &snapshot.key.reference,
                    snapshot.algorithm,
                    plaintext,
                )
            })
            .and_then(|ciphertext| {
                if ciphertext.len() != snapshot.key.modulus_len() {
                    return Err(Pkcs11Error::DeviceError(format!(
                        "vault returned {} bytes of ciphertext for a {} byte key",
                        ciphertext.len(),
                        snapshot.key.modulus_len()
                    )));
                }
                Ok(ciphertext)
            });

        let mut tables = self.tables_for_commit(snapshot.epoch)?;
        finish_operation(&mut tables, session, snapshot.serial)?;
        Ok(Output::Written(Zeroizing::new(result?)))
    }

    /// Single-part decryption. `capacity` is the caller's buffer size, or
    /// `None` for a size query.
    ///
    /// The plaintext length is only known after the vault has decrypted, so
    /// a size query or undersized buffer performs the decryption and keeps
    /// the result for the follow-up call with the same ciphertext.
    pub fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        ciphertext: &[u8],
        capacity: Option<usize>,
    ) -> Pkcs11Result<Output> {
        let snapshot = {
            let mut tables = self.tables()?;
            let snapshot = step_snapshot(&tables, session, Direction::Decrypt)?;
            if ciphertext.len() != snapshot.key.modulus_len() {
                return Err(Pkcs11Error::EncryptedDataLenInvalid);
            }
            let operation = active_operation(&mut tables, session, snapshot.serial)?;
            let cached = operation
                .pending
                .as_ref()
                .filter(|pending| pending.ciphertext == ciphertext)
                .map(|pending| pending.plaintext.len());
            if let Some(required) = cached {
                debug!("session {}: serving decrypt from the pending result", session);
                return deliver(&mut tables, session, required, capacity);
            }
            snapshot
        };

        let result = self.call_remote(&snapshot.credential, "decrypt", |vault, token| {
            vault.decrypt(
                token,
                &snapshot.key.reference,
                snapshot.algorithm,
                ciphertext,
            )
        });

        let mut tables = self.tables_for_commit(snapshot.epoch)?;
        let plaintext = match result {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(err) => {
                finish_operation(&mut tables, session, snapshot.serial)?;
                return Err(err);
            }
        };
        let required = plaintext.len();
        active_operation(&mut tables, session, snapshot.serial)?.pending = Some(PendingPlaintext {
            ciphertext: ciphertext.to_vec(),
            plaintext,
        });
        deliver(&mut tables, session, required, capacity)
    }
}

/// Validate a step against the session's active operation and take what the
/// remote call needs.
fn step_snapshot(
    tables: &Tables,
    session: CK_SESSION_HANDLE,
    direction: Direction,
) -> Pkcs11Result<StepSnapshot> {
    let epoch = tables.epoch;
    let state = tables.session(session)?;
    let operation = state
        .operation
        .as_ref()
        .filter(|operation| operation.direction == direction)
        .ok_or(Pkcs11Error::OperationNotInitialized)?;
    let credential = state.credential()?;
    Ok(StepSnapshot {
        epoch,
        serial: operation.serial,
        algorithm: operation.algorithm,
        key: Arc::clone(&operation.key),
        credential,
    })
}

/// The session's active operation, provided it is still the one with
/// `serial`.
fn active_operation<'a>(
    tables: &'a mut Tables,
    session: CK_SESSION_HANDLE,
    serial: u64,
) -> Pkcs11Result<&'a mut ActiveOperation> {
    tables
        .session_mut(session)?
        .operation
        .as_mut()
        .filter(|operation| operation.serial == serial)
        .ok_or(Pkcs11Error::OperationNotInitialized)
}

/// Clear the operation with `serial` from the session, if it is still there.
fn finish_operation(
    tables: &mut Tables,
    session: CK_SESSION_HANDLE,
    serial: u64,
) -> Pkcs11Result<()> {
    let state = tables.session_mut(session)?;
    if state
        .operation
        .as_ref()
        .is_some_and(|operation| operation.serial == serial)
    {
        state.operation = None;
        Ok(())
    } else {
        Err(Pkcs11Error::OperationNotInitialized)
    }
}

/// Hand out a pending plaintext according to the buffer convention.
fn deliver(
    tables: &mut Tables,
    session: CK_SESSION_HANDLE,
    required: usize,
    capacity: Option<usize>,
) -> Pkcs11Result<Output> {
    match capacity {
        None => Ok(Output::SizeRequired(required)),
        Some(capacity) if capacity < required => Err(Pkcs11Error::BufferTooSmall { required }),
        Some(_) => {
            let state = tables.session_mut(session)?;
            let pending = state
                .operation
                .take()
                .and_then(|operation| operation.pending)
                .ok_or(Pkcs11Error::OperationNotInitialized)?;
            Ok(Output::Written(pending.plaintext))
        }
    }
}
