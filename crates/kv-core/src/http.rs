//! Blocking HTTPS clients for the key vault and its token endpoints.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::blocking::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::{IdentityConfig, VaultConfig};
use crate::credential::{AccessToken, Credential};
use crate::error::{VaultError, VaultResult};
use crate::key_ref::KeyReference;
use crate::service::{CreateKeyRequest, EncryptionAlgorithm, KeyBundle, KeyService, TokenSource};

const USER_AGENT: &str = concat!("kv-pkcs11/", env!("CARGO_PKG_VERSION"));
const IMDS_API_VERSION: &str = "2018-02-01";

fn build_client(timeout: Duration) -> VaultResult<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(VaultError::transport)
}

fn map_send_error(err: reqwest::Error) -> VaultError {
    if err.is_timeout() {
        VaultError::Timeout(err.to_string())
    } else {
        VaultError::Transport(err.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Turn a non-success response into a [`VaultError`], keeping the service's
/// own error code and message when it sent one.
fn error_from_response(response: Response) -> VaultError {
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => format!("{}: {}", envelope.error.code, envelope.error.message),
        Err(_) => body,
    };
    VaultError::from_status(status, message)
}

fn send_json<T: for<'de> Deserialize<'de>>(request: RequestBuilder) -> VaultResult<T> {
    let response = request.send().map_err(map_send_error)?;
    if !response.status().is_success() {
        return Err(error_from_response(response));
    }
    response.json::<T>().map_err(VaultError::invalid_response)
}

fn decode_b64(field: &str, value: &str) -> VaultResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|e| VaultError::InvalidResponse(format!("{field}: {e}")))
}

// ===== KEY VAULT =====

#[derive(Serialize)]
struct CreateKeyBody<'a> {
    kty: &'a str,
    key_size: usize,
    key_ops: [&'a str; 4],
}

#[derive(Deserialize)]
struct KeyEnvelope {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

impl TryFrom<JsonWebKey> for KeyBundle {
    type Error = VaultError;

    fn try_from(jwk: JsonWebKey) -> VaultResult<Self> {
        if !jwk.kty.starts_with("RSA") {
            return Err(VaultError::Unsupported(format!(
                "{} is a {} key, only RSA is supported",
                jwk.kid, jwk.kty
            )));
        }
        let n = jwk
            .n
            .ok_or_else(|| VaultError::InvalidResponse(format!("{}: missing modulus", jwk.kid)))?;
        let e = jwk
            .e
            .ok_or_else(|| VaultError::InvalidResponse(format!("{}: missing exponent", jwk.kid)))?;
        Ok(KeyBundle {
            modulus: decode_b64("n", &n)?,
            public_exponent: decode_b64("e", &e)?,
            kid: jwk.kid,
        })
    }
}

#[derive(Serialize)]
struct OperationBody<'a> {
    alg: &'a str,
    value: String,
}

#[derive(Deserialize)]
struct OperationResult {
    value: String,
}

/// [`KeyService`] backed by the key vault REST API.
pub struct HttpKeyVault {
    client: Client,
    api_version: String,
}

impl HttpKeyVault {
    pub fn new(config: &VaultConfig) -> VaultResult<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(config.timeout_secs))?,
            api_version: config.api_version.clone(),
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        token: &AccessToken,
    ) -> RequestBuilder {
        self.client
            .request(method, url)
            .query(&[("api-version", self.api_version.as_str())])
            .bearer_auth(token.secret())
    }

    fn get_key(&self, token: &AccessToken, key: &KeyReference) -> VaultResult<KeyBundle> {
        let envelope: KeyEnvelope =
            send_json(self.request(reqwest::Method::GET, &key.key_url(), token))?;
        envelope.key.try_into()
    }

    fn operation(
        &self,
        token: &AccessToken,
        key: &KeyReference,
        operation: &str,
        algorithm: EncryptionAlgorithm,
        input: &[u8],
    ) -> VaultResult<Vec<u8>> {
        let body = OperationBody {
            alg: algorithm.as_str(),
            value: URL_SAFE_NO_PAD.encode(input),
        };
        let result: OperationResult = send_json(
            self.request(reqwest::Method::POST, &key.operation_url(operation), token)
                .json(&body),
        )?;
        decode_b64("value", &result.value)
    }
}

impl KeyService for HttpKeyVault {
    fn create_key(
        &self,
        token: &AccessToken,
        request: &CreateKeyRequest,
    ) -> VaultResult<KeyBundle> {
        // The create endpoint mints a new version on every call, so bind to an
        // existing key first.
        match self.get_key(token, &request.key) {
            Ok(bundle) => {
                debug!("key {} already exists, binding to it", request.key);
                return Ok(bundle);
            }
            Err(VaultError::KeyNotFound(_)) => {}
            Err(err) => return Err(err),
        }
        if request.key.version().is_some() {
            return Err(VaultError::KeyNotFound(format!(
                "{} names a version that does not exist",
                request.key
            )));
        }
        let body = CreateKeyBody {
            kty: "RSA",
            key_size: request.key_size,
            key_ops: ["encrypt", "decrypt", "wrapKey", "unwrapKey"],
        };
        let envelope: KeyEnvelope = send_json(
            self.request(reqwest::Method::POST, &request.key.create_url(), token)
                .json(&body),
        )?;
        envelope.key.try_into()
    }

    fn encrypt(
        &self,
        token: &AccessToken,
        key: &KeyReference,
        algorithm: EncryptionAlgorithm,
        plaintext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        self.operation(token, key, "encrypt", algorithm, plaintext)
    }

    fn decrypt(
        &self,
        token: &AccessToken,
        key: &KeyReference,
        algorithm: EncryptionAlgorithm,
        ciphertext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        self.operation(token, key, "decrypt", algorithm, ciphertext)
    }
}

// ===== TOKEN ENDPOINTS =====

#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(i64),
    Text(String),
}

impl Seconds {
    fn value(&self) -> VaultResult<i64> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => s.trim().parse().map_err(VaultError::invalid_response),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<Seconds>,
    expires_on: Option<Seconds>,
}

impl TryFrom<TokenResponse> for AccessToken {
    type Error = VaultError;

    fn try_from(response: TokenResponse) -> VaultResult<Self> {
        if let Some(expires_on) = &response.expires_on {
            let expires_at = time::OffsetDateTime::from_unix_timestamp(expires_on.value()?)
                .map_err(VaultError::invalid_response)?;
            return Ok(AccessToken::new(response.access_token, expires_at));
        }
        let expires_in = response
            .expires_in
            .as_ref()
            .ok_or_else(|| VaultError::InvalidResponse("token without expiry".into()))?
            .value()?;
        Ok(AccessToken::expires_in(
            response.access_token,
            time::Duration::seconds(expires_in),
        ))
    }
}

/// [`TokenSource`] for managed identity (instance metadata endpoint) and
/// client-credential grants.
pub struct HttpTokenSource {
    client: Client,
    config: IdentityConfig,
}

impl HttpTokenSource {
    pub fn new(config: &IdentityConfig, timeout: Duration) -> VaultResult<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            config: config.clone(),
        })
    }

    fn managed_identity(&self) -> VaultResult<AccessToken> {
        let request = self
            .client
            .get(&self.config.managed_identity_endpoint)
            .header("Metadata", "true")
            .query(&[
                ("api-version", IMDS_API_VERSION),
                ("resource", self.config.resource.as_str()),
            ]);
        let response: TokenResponse = send_json(request)?;
        response.try_into()
    }

    fn client_credentials(&self, client_id: &str, secret: &str) -> VaultResult<AccessToken> {
        let tenant = self.config.tenant_id.as_deref().ok_or_else(|| {
            VaultError::Unsupported("client secret login needs identity.tenant_id".into())
        })?;
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority_host.trim_end_matches('/'),
            tenant
        );
        let scope = format!("{}/.default", self.config.resource.trim_end_matches('/'));
        let request = self.client.post(url).form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", secret),
            ("scope", scope.as_str()),
        ]);
        let response: TokenResponse = send_json(request)?;
        response.try_into()
    }
}

impl TokenSource for HttpTokenSource {
    fn acquire(&self, credential: &Credential) -> VaultResult<AccessToken> {
        match credential {
            Credential::ManagedIdentity => self.managed_identity(),
            Credential::ClientSecret { client_id, secret } => {
                self.client_credentials(client_id, secret.expose_secret())
            }
        }
    }
}
