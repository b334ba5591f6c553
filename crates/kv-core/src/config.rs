//! Provider configuration.
//!
//! Read from the TOML file named by `KVP11_CONFIG`, falling back to
//! `config.toml` in the platform configuration directory, then to defaults.
//! `KVP11_BACKEND` and `KVP11_TENANT_ID` override the file.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "KVP11_CONFIG";
pub const BACKEND_ENV: &str = "KVP11_BACKEND";
pub const TENANT_ENV: &str = "KVP11_TENANT_ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The remote key vault over HTTPS.
    #[default]
    Http,
    /// An in-process vault, for development and tests.
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::Invalid(format!("unknown backend {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub backend: BackendKind,
    pub vault: VaultConfig,
    pub identity: IdentityConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// `api-version` query parameter sent with every vault request.
    pub api_version: String,
    pub timeout_secs: u64,
    /// RSA modulus size for newly created keys.
    pub key_size: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            api_version: "7.4".to_string(),
            timeout_secs: 30,
            key_size: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub authority_host: String,
    /// Directory tenant for client-secret logins.
    pub tenant_id: Option<String>,
    pub managed_identity_endpoint: String,
    /// Resource the tokens are requested for.
    pub resource: String,
    /// Tokens closer than this to expiry are refreshed.
    pub refresh_margin_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            authority_host: "https://login.microsoftonline.com".to_string(),
            tenant_id: None,
            managed_identity_endpoint: "http://169.254.169.254/metadata/identity/oauth2/token"
                .to_string(),
            resource: "https://vault.azure.net".to_string(),
            refresh_margin_secs: 300,
        }
    }
}

impl IdentityConfig {
    pub fn refresh_margin(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.refresh_margin_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_elapsed_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 200,
            multiplier: 2.0,
            max_interval_ms: 5_000,
            max_elapsed_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ProviderConfig {
    /// Locate, parse and validate the configuration for this process.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::config_path() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("loading provider configuration from {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides; `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(backend) = lookup(BACKEND_ENV) {
            self.backend = backend.parse()?;
        }
        if let Some(tenant) = lookup(TENANT_ENV).filter(|t| !t.is_empty()) {
            self.identity.tenant_id = Some(tenant);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault.timeout_secs == 0 {
            return Err(ConfigError::Invalid("vault.timeout_secs must be > 0".into()));
        }
        if self.vault.key_size < 1024 || self.vault.key_size % 8 != 0 {
            return Err(ConfigError::Invalid(format!(
                "vault.key_size {} is not a usable RSA size",
                self.vault.key_size
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1".into()));
        }
        Ok(())
    }

    fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        ProjectDirs::from("net", "kv-pkcs11", "kv-pkcs11")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.exists())
    }
}
