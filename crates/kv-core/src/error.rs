use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Failures reported by the remote key service, the token endpoint, or the
/// client talking to them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("invalid key reference: {0}")]
    InvalidKeyReference(String),
    #[error("request rejected: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("rate limited")]
    RateLimited,
    #[error("service error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl VaultError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Server { .. } | Self::Timeout(_) | Self::Transport(_)
        )
    }

    pub fn invalid_response<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidResponse(err.to_string())
    }

    pub fn transport<E: std::fmt::Display>(err: E) -> Self {
        Self::Transport(err.to_string())
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        match status {
            400 => Self::BadRequest(message),
            401 => Self::Unauthorized(message),
            403 => Self::Forbidden(message),
            404 => Self::KeyNotFound(message),
            408 => Self::Timeout(message),
            429 => Self::RateLimited,
            500..=599 => Self::Server { status, message },
            _ => Self::InvalidResponse(format!("unexpected status {status}: {message}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
