//! Remote key references (`https://<vault>/keys/<name>[/<version>]`).

use std::fmt;
use url::Url;

use crate::error::{VaultError, VaultResult};

/// The full identifier of a key in the remote vault.
///
/// Callers supply it up front (as the `CKA_ID` of a generated pair), so it
/// doubles as an idempotency key for key creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyReference {
    vault: String,
    name: String,
    version: Option<String>,
}

impl KeyReference {
    pub fn parse(identifier: &str) -> VaultResult<Self> {
        let url = Url::parse(identifier)
            .map_err(|e| VaultError::InvalidKeyReference(format!("{identifier}: {e}")))?;
        if !matches!(url.scheme(), "https" | "http") {
            return Err(VaultError::InvalidKeyReference(format!(
                "{identifier}: unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(VaultError::InvalidKeyReference(format!(
                "{identifier}: query and fragment are not allowed"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| VaultError::InvalidKeyReference(format!("{identifier}: missing host")))?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let (name, version) = match segments.as_slice() {
            ["keys", name] => (*name, None),
            ["keys", name, version] => (*name, Some(version.to_string())),
            _ => {
                return Err(VaultError::InvalidKeyReference(format!(
                    "{identifier}: expected /keys/<name>[/<version>]"
                )));
            }
        };
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(VaultError::InvalidKeyReference(format!(
                "{identifier}: invalid key name {name}"
            )));
        }

        let vault = match url.port() {
            Some(port) => format!("{}://{host}:{port}", url.scheme()),
            None => format!("{}://{host}", url.scheme()),
        };
        Ok(Self {
            vault,
            name: name.to_string(),
            version,
        })
    }

    /// Base URL of the owning vault, without trailing slash.
    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// URL of the key itself, the base for every per-key operation.
    pub fn key_url(&self) -> String {
        match &self.version {
            Some(version) => format!("{}/keys/{}/{version}", self.vault, self.name),
            None => format!("{}/keys/{}", self.vault, self.name),
        }
    }

    pub fn create_url(&self) -> String {
        format!("{}/keys/{}/create", self.vault, self.name)
    }

    pub fn operation_url(&self, operation: &str) -> String {
        format!("{}/{operation}", self.key_url())
    }
}

impl fmt::Display for KeyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_url())
    }
}
