//! Remote secret store layer.
//!
//! # Responsibilities
//! - Derive the vault endpoint from `Vault:Name`
//! - Authenticate with client credentials discovered from the vault's
//!   bearer challenge
//! - Fetch every enabled secret and expose it as configuration
//!
//! # Design Decisions
//! - Secret names use `--` where configuration keys use `:`
//! - No retries and no timeouts: a hung vault hangs startup, supervision
//!   is expected to restart the process

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::schema::{ResolvedConfiguration, VAULT_CLIENT_ID, VAULT_CLIENT_SECRET, VAULT_NAME};

/// DNS suffix appended to the vault name.
pub const VAULT_DOMAIN: &str = "vault.azure.net";
pub const VAULT_API_VERSION: &str = "7.4";

/// Error type for secret store access.
#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret store name is not configured (Vault:Name)")]
    MissingName,

    #[error("invalid secret store endpoint {endpoint}: {source}")]
    Endpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("secret store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("secret store at {0} did not issue a bearer challenge")]
    MissingChallenge(String),

    #[error("secret store authentication failed with status {0}")]
    Authentication(u16),

    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
}

/// The three settings needed to reach the vault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaultSettings {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
}

impl VaultSettings {
    pub fn from_config(config: &ResolvedConfiguration) -> Self {
        let read = |key: &str| config.get(key).unwrap_or_default().trim().to_string();
        Self {
            name: read(VAULT_NAME),
            client_id: read(VAULT_CLIENT_ID),
            client_secret: read(VAULT_CLIENT_SECRET),
        }
    }

    /// `https://{name}.vault.azure.net/`
    pub fn endpoint(&self) -> Result<Url, SecretStoreError> {
        if self.name.is_empty() {
            return Err(SecretStoreError::MissingName);
        }
        let endpoint = format!("https://{}.{}/", self.name, VAULT_DOMAIN);
        Url::parse(&endpoint).map_err(|source| SecretStoreError::Endpoint { endpoint, source })
    }
}

/// A source of secret configuration values.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch every secret as a `(key, value)` configuration pair.
    async fn load(&self) -> Result<Vec<(String, String)>, SecretStoreError>;
}

/// Builds the secret store once the provisional configuration asks for one.
pub trait SecretStoreFactory: Send + Sync {
    fn create(&self, settings: &VaultSettings) -> Result<Box<dyn SecretStore>, SecretStoreError>;
}

impl<F> SecretStoreFactory for F
where
    F: Fn(&VaultSettings) -> Result<Box<dyn SecretStore>, SecretStoreError> + Send + Sync,
{
    fn create(&self, settings: &VaultSettings) -> Result<Box<dyn SecretStore>, SecretStoreError> {
        self(settings)
    }
}

/// Default factory: a [`KeyVaultClient`] at the endpoint derived from the name.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyVaultFactory;

impl SecretStoreFactory for KeyVaultFactory {
    fn create(&self, settings: &VaultSettings) -> Result<Box<dyn SecretStore>, SecretStoreError> {
        Ok(Box::new(KeyVaultClient::new(
            settings.endpoint()?,
            settings.client_id.clone(),
            settings.client_secret.clone(),
        )))
    }
}

/// Parameters of a `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub authorization: String,
    pub resource: String,
}

/// Parse `Bearer authorization="...", resource="..."`.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let params = header.trim().strip_prefix("Bearer")?;
    let mut authorization = None;
    let mut resource = None;
    for param in params.split(',') {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match name.trim().to_ascii_lowercase().as_str() {
            "authorization" | "authorization_uri" => authorization = Some(value),
            "resource" => resource = Some(value),
            _ => {}
        }
    }
    Some(Challenge {
        authorization: authorization?,
        resource: resource?,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretListPage {
    #[serde(default)]
    value: Vec<SecretItem>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretItem {
    id: String,
    #[serde(default)]
    attributes: SecretAttributes,
}

#[derive(Debug, Deserialize)]
struct SecretAttributes {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

impl Default for SecretAttributes {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SecretBundle {
    value: String,
}

/// Client for a key vault using the client-credentials flow.
pub struct KeyVaultClient {
    endpoint: Url,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

impl KeyVaultClient {
    pub fn new(endpoint: Url, client_id: String, client_secret: String) -> Self {
        Self {
            endpoint,
            client_id,
            client_secret,
            http: reqwest::Client::new(),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn secrets_url(&self) -> Result<Url, SecretStoreError> {
        let mut url = self.endpoint.join("secrets").map_err(|source| SecretStoreError::Endpoint {
            endpoint: self.endpoint.to_string(),
            source,
        })?;
        url.query_pairs_mut().append_pair("api-version", VAULT_API_VERSION);
        Ok(url)
    }

    /// Probe the vault anonymously, then trade the client credentials for a
    /// token at the authority named in the challenge.
    async fn authenticate(&self) -> Result<String, SecretStoreError> {
        let probe = self.secrets_url()?;
        let response = self.http.get(probe.clone()).send().await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Err(SecretStoreError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: probe.to_string(),
            });
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_challenge)
            .ok_or_else(|| SecretStoreError::MissingChallenge(probe.to_string()))?;

        let token_url = format!("{}/oauth2/token", challenge.authorization.trim_end_matches('/'));
        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("resource", challenge.resource.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SecretStoreError::Authentication(response.status().as_u16()));
        }
        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        token: &str,
    ) -> Result<T, SecretStoreError> {
        let response = self.http.get(url.clone()).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(SecretStoreError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }

    async fn list_secret_ids(&self, token: &str) -> Result<Vec<String>, SecretStoreError> {
        let mut ids = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(self.secrets_url()?);
        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                tracing::warn!(url = %url, "Secret listing repeated a page; stopping");
                break;
            }
            let page: SecretListPage = self.get_json(url, token).await?;
            ids.extend(
                page.value
                    .into_iter()
                    .filter(|item| item.attributes.enabled)
                    .map(|item| item.id),
            );
            if let Some(link) = page.next_link.filter(|link| !link.is_empty()) {
                next = Some(Url::parse(&link).map_err(|source| SecretStoreError::Endpoint {
                    endpoint: link.clone(),
                    source,
                })?);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl SecretStore for KeyVaultClient {
    async fn load(&self) -> Result<Vec<(String, String)>, SecretStoreError> {
        let token = self.authenticate().await?;
        let mut secrets = Vec::new();
        for id in self.list_secret_ids(&token).await? {
            let mut url = Url::parse(&id).map_err(|source| SecretStoreError::Endpoint {
                endpoint: id.clone(),
                source,
            })?;
            let Some(name) = secret_name(&url) else {
                continue;
            };
            url.query_pairs_mut().append_pair("api-version", VAULT_API_VERSION);
            let bundle: SecretBundle = self.get_json(url, &token).await?;
            secrets.push((name.replace("--", ":"), bundle.value));
        }
        Ok(secrets)
    }
}

/// Name segment of `.../secrets/{name}[/{version}]`.
fn secret_name(id: &Url) -> Option<String> {
    let mut segments = id.path_segments()?;
    segments.find(|segment| *segment == "secrets")?;
    segments
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
