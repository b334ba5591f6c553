//! Login credentials and the bearer tokens they resolve to.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

const CLIENT_ID_PREFIX: &str = "clientid=";
const SECRET_SEPARATOR: &str = ";secret=";

/// The identity a session logs in with.
pub enum Credential {
    /// Ambient identity of the host, no secret involved.
    ManagedIdentity,
    /// Explicit application registration.
    ClientSecret {
        client_id: String,
        secret: SecretString,
    },
}

/// Raised when a login blob is neither empty nor `clientid=<id>;secret=<secret>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed credential: {0}")]
pub struct CredentialFormatError(pub &'static str);

impl Credential {
    /// Parse the PIN passed to `C_Login`.
    ///
    /// An empty PIN selects the managed identity.
    pub fn from_pin(pin: &[u8]) -> Result<Self, CredentialFormatError> {
        if pin.is_empty() {
            return Ok(Self::ManagedIdentity);
        }
        let text =
            std::str::from_utf8(pin).map_err(|_| CredentialFormatError("not valid UTF-8"))?;
        let rest = text
            .strip_prefix(CLIENT_ID_PREFIX)
            .ok_or(CredentialFormatError("missing clientid"))?;
        let (client_id, secret) = rest
            .split_once(SECRET_SEPARATOR)
            .ok_or(CredentialFormatError("missing secret"))?;
        if client_id.is_empty() || client_id.contains(';') {
            return Err(CredentialFormatError("invalid clientid"));
        }
        if secret.is_empty() {
            return Err(CredentialFormatError("empty secret"));
        }
        Ok(Self::ClientSecret {
            client_id: client_id.to_string(),
            secret: SecretString::new(secret.to_string()),
        })
    }

    /// Cache key for tokens obtained with this credential.
    pub fn id(&self) -> CredentialId {
        match self {
            Self::ManagedIdentity => CredentialId::ManagedIdentity,
            Self::ClientSecret { client_id, secret } => CredentialId::Client {
                client_id: client_id.clone(),
                secret_digest: Sha256::digest(secret.expose_secret().as_bytes()).into(),
            },
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagedIdentity => f.write_str("ManagedIdentity"),
            Self::ClientSecret { client_id, .. } => f
                .debug_struct("ClientSecret")
                .field("client_id", client_id)
                .field("secret", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Identity of a credential, safe to keep as a map key.
///
/// Client credentials are keyed by id and a digest of the secret so a caller
/// with the wrong secret never picks up someone else's cached token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CredentialId {
    ManagedIdentity,
    Client {
        client_id: String,
        secret_digest: [u8; 32],
    },
}

impl fmt::Debug for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagedIdentity => f.write_str("managed-identity"),
            Self::Client { client_id, .. } => write!(f, "client:{client_id}"),
        }
    }
}

/// A bearer token for the key service.
pub struct AccessToken {
    value: SecretString,
    expires_at: OffsetDateTime,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            value: SecretString::new(value.into()),
            expires_at,
        }
    }

    pub fn expires_in(value: impl Into<String>, lifetime: Duration) -> Self {
        Self::new(value, OffsetDateTime::now_utc() + lifetime)
    }

    pub fn secret(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// True while the token is still valid for at least `margin`.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.expires_at - margin > OffsetDateTime::now_utc()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
