//! Provider errors and their `CK_RV` codes.

use cryptoki_sys::{
    CK_RV, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_ATTRIBUTE_VALUE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CANT_LOCK,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_LEN_RANGE,
    CKR_DEVICE_ERROR, CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_FUNCTION_FAILED,
    CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID, CKR_MECHANISM_INVALID,
    CKR_MECHANISM_PARAM_INVALID, CKR_NEED_TO_CREATE_THREADS, CKR_OBJECT_HANDLE_INVALID,
    CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT, CKR_PIN_INVALID,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SLOT_ID_INVALID,
    CKR_TEMPLATE_INCOMPLETE, CKR_TOKEN_NOT_PRESENT, CKR_USER_ALREADY_LOGGED_IN,
    CKR_USER_NOT_LOGGED_IN,
};
use kv_core::{CredentialFormatError, VaultError};
use thiserror::Error;

pub type Pkcs11Result<T> = Result<T, Pkcs11Error>;

/// Errors raised by the provider prior to translation into CKR_* return
/// codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Pkcs11Error {
    #[error("bad arguments: {0}")]
    ArgumentsBad(String),
    #[error("output buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("invalid session handle")]
    SessionHandleInvalid,
    #[error("invalid key handle")]
    KeyHandleInvalid,
    #[error("invalid object handle")]
    ObjectHandleInvalid,
    #[error("user not logged in")]
    UserNotLoggedIn,
    #[error("user already logged in")]
    UserAlreadyLoggedIn,
    #[error("an operation is already active on this session")]
    OperationActive,
    #[error("no operation initialized")]
    OperationNotInitialized,
    #[error("mechanism not supported")]
    MechanismInvalid,
    #[error("invalid mechanism parameter: {0}")]
    MechanismParamInvalid(String),
    #[error("template is missing the key identifier")]
    TemplateIncomplete,
    #[error("invalid attribute type")]
    AttributeTypeInvalid,
    #[error("attribute is sensitive")]
    AttributeSensitive,
    #[error("invalid attribute value: {0}")]
    AttributeValueInvalid(String),
    #[error("invalid credential: {0}")]
    CredentialFormatInvalid(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("input length out of range")]
    DataLenInvalid,
    #[error("ciphertext length out of range")]
    EncryptedDataLenInvalid,
    #[error("key service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("key service error: {0}")]
    DeviceError(String),
    #[error("function failed: {0}")]
    FunctionFailed(String),
    #[error("cryptoki already initialized")]
    AlreadyInitialized,
    #[error("cryptoki not initialized")]
    NotInitialized,
    #[error("invalid slot id")]
    SlotIdInvalid,
    #[error("sessions must be opened with CKF_SERIAL_SESSION")]
    SessionFlagsInvalid,
    #[error("application-supplied locking is not supported")]
    CannotLockMutex,
    #[error("provider needs to create threads")]
    CannotCreateThreads,
}

impl Pkcs11Error {
    pub fn rv(&self) -> CK_RV {
        match self {
            Self::ArgumentsBad(_) => CKR_ARGUMENTS_BAD,
            Self::BufferTooSmall { .. } => CKR_BUFFER_TOO_SMALL,
            Self::SessionHandleInvalid => CKR_SESSION_HANDLE_INVALID,
            Self::KeyHandleInvalid => CKR_KEY_HANDLE_INVALID,
            Self::ObjectHandleInvalid => CKR_OBJECT_HANDLE_INVALID,
            Self::UserNotLoggedIn => CKR_USER_NOT_LOGGED_IN,
            Self::UserAlreadyLoggedIn => CKR_USER_ALREADY_LOGGED_IN,
            Self::OperationActive => CKR_OPERATION_ACTIVE,
            Self::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
            Self::MechanismInvalid => CKR_MECHANISM_INVALID,
            Self::MechanismParamInvalid(_) => CKR_MECHANISM_PARAM_INVALID,
            Self::TemplateIncomplete => CKR_TEMPLATE_INCOMPLETE,
            Self::AttributeTypeInvalid => CKR_ATTRIBUTE_TYPE_INVALID,
            Self::AttributeSensitive => CKR_ATTRIBUTE_SENSITIVE,
            Self::AttributeValueInvalid(_) => CKR_ATTRIBUTE_VALUE_INVALID,
            Self::CredentialFormatInvalid(_) => CKR_PIN_INVALID,
            Self::AuthenticationFailed(_) => CKR_PIN_INCORRECT,
            Self::NotAuthorized(_) => CKR_KEY_FUNCTION_NOT_PERMITTED,
            Self::DataLenInvalid => CKR_DATA_LEN_RANGE,
            Self::EncryptedDataLenInvalid => CKR_ENCRYPTED_DATA_LEN_RANGE,
            Self::ServiceUnavailable(_) => CKR_TOKEN_NOT_PRESENT,
            Self::DeviceError(_) => CKR_DEVICE_ERROR,
            Self::FunctionFailed(_) => CKR_FUNCTION_FAILED,
            Self::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
            Self::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
            Self::SlotIdInvalid => CKR_SLOT_ID_INVALID,
            Self::SessionFlagsInvalid => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
            Self::CannotLockMutex => CKR_CANT_LOCK,
            Self::CannotCreateThreads => CKR_NEED_TO_CREATE_THREADS,
        }
    }

    /// Failures worth an `error!` line: remote trouble and internal faults,
    /// as opposed to a caller misusing the interface.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_)
                | Self::NotAuthorized(_)
                | Self::ServiceUnavailable(_)
                | Self::DeviceError(_)
                | Self::FunctionFailed(_)
        )
    }

    /// Map a failure to obtain a bearer token.
    pub fn from_token_error(err: VaultError) -> Self {
        match err {
            VaultError::Unauthorized(msg)
            | VaultError::BadRequest(msg)
            | VaultError::Forbidden(msg)
            | VaultError::Unsupported(msg) => Self::AuthenticationFailed(msg),
            err if err.is_transient() => Self::ServiceUnavailable(err.to_string()),
            err => Self::FunctionFailed(err.to_string()),
        }
    }

    /// Map a failed key creation, encryption or decryption.
    pub fn from_key_error(err: VaultError) -> Self {
        match err {
            VaultError::Forbidden(msg) | VaultError::Unauthorized(msg) => Self::NotAuthorized(msg),
            VaultError::KeyNotFound(_) => Self::KeyHandleInvalid,
            VaultError::InvalidKeyReference(msg)
            | VaultError::BadRequest(msg)
            | VaultError::Unsupported(msg) => Self::ArgumentsBad(msg),
            err @ (VaultError::RateLimited
            | VaultError::Server { .. }
            | VaultError::InvalidResponse(_)) => Self::DeviceError(err.to_string()),
            err @ (VaultError::Timeout(_) | VaultError::Transport(_)) => {
                Self::FunctionFailed(err.to_string())
            }
        }
    }
}

impl From<CredentialFormatError> for Pkcs11Error {
    fn from(err: CredentialFormatError) -> Self {
        Self::CredentialFormatInvalid(err.0.to_string())
    }
}
