//! Core of the kv-pkcs11 provider: remote key references, the key service
//! and token endpoint contracts with their HTTPS and in-memory
//! implementations, the shared credential cache, retry policy and
//! configuration. Nothing here knows about PKCS#11.

pub mod auth;
pub mod config;
pub mod credential;
pub mod error;
pub mod http;
pub mod key_ref;
pub mod memory;
pub mod retry;
pub mod service;

pub use auth::CredentialBridge;
pub use config::{BackendKind, IdentityConfig, ProviderConfig, RetryConfig, VaultConfig};
pub use credential::{AccessToken, Credential, CredentialFormatError, CredentialId};
pub use error::{ConfigError, VaultError, VaultResult};
pub use http::{HttpKeyVault, HttpTokenSource};
pub use key_ref::KeyReference;
pub use memory::{MemoryTokenSource, MemoryVault, VaultOp};
pub use retry::RetryPolicy;
pub use service::{CreateKeyRequest, EncryptionAlgorithm, KeyBundle, KeyService, TokenSource};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The pair of remote collaborators a provider instance talks to.
#[derive(Clone)]
pub struct Backend {
    pub vault: Arc<dyn KeyService>,
    pub tokens: Arc<dyn TokenSource>,
}

impl Backend {
    /// Build the backend selected by `config`.
    pub fn from_config(config: &ProviderConfig) -> VaultResult<Self> {
        let backend = match config.backend {
            BackendKind::Http => Self {
                vault: Arc::new(HttpKeyVault::new(&config.vault)?),
                tokens: Arc::new(HttpTokenSource::new(
                    &config.identity,
                    Duration::from_secs(config.vault.timeout_secs),
                )?),
            },
            BackendKind::Memory => Self::memory(
                Arc::new(MemoryVault::new(config.vault.key_size)),
                Arc::new(MemoryTokenSource::new()),
            ),
        };
        info!("using {:?} key vault backend", config.backend);
        Ok(backend)
    }

    pub fn memory(vault: Arc<MemoryVault>, tokens: Arc<MemoryTokenSource>) -> Self {
        Self { vault, tokens }
    }
}
