#![allow(non_snake_case)]
//! PKCS#11 provider that keeps its RSA private keys in a remote key vault.
//!
//! Applications see one slot holding one token. `C_Login` takes a credential
//! in the PIN, `C_GenerateKeyPair` creates or binds a vault key named by
//! `CKA_ID`, and RSA-OAEP encryption and decryption run inside the vault.

mod attribute;
mod context;
mod error;
pub mod functions;
mod handle;
pub mod logging;
mod mechanism;
mod object;
mod operation;
mod session;
mod slot;

pub use attribute::{AttributeLookup, KeyPairRequest, Template};
pub use context::{InitArgs, Provider};
pub use error::{Pkcs11Error, Pkcs11Result};
pub use handle::HandleArena;
pub use mechanism::{
    MAX_KEY_BITS, MIN_KEY_BITS, MechanismParam, MechanismSpec, OaepParams, SUPPORTED_MECHANISMS,
    mechanism_info,
};
pub use object::{KeyPairHandles, ObjectClass};
pub use operation::Output;
pub use session::{SessionCounts, SessionInfo};
pub use slot::{SLOT_ID, library_info, slot_info, token_info};
