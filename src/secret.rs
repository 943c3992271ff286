//! Secret Manager access
//!
//! [`SecretStore`] is the seam used by configuration resolution. The
//! production implementation talks to the Secret Manager v1 REST API and
//! builds a fresh HTTP client for every call; call volume is a handful of
//! lookups at startup so no client is cached.

use crate::config::Settings;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Failed to build secret manager client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Failed to obtain access token: {0}")]
    Token(String),

    #[error("Secret not found: {secret_id}")]
    NotFound { secret_id: String },

    #[error("Secret has already been created: {secret_id}")]
    AlreadyExists { secret_id: String },

    #[error("Permission denied for secret: {secret_id}")]
    PermissionDenied { secret_id: String },

    #[error("Secret manager returned {status} for {secret_id}: {message}")]
    Api {
        secret_id: String,
        status: StatusCode,
        message: String,
    },

    #[error("Failed to {operation} secret {secret_id}: {source}")]
    Transport {
        operation: &'static str,
        secret_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Secret {secret_id} is empty")]
    Empty { secret_id: String },

    #[error("Secret {secret_id} payload is not valid UTF-8 base64: {reason}")]
    Payload { secret_id: String, reason: String },
}

/// Resource name of a created secret, `projects/{project}/secrets/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Latest version of `secret_id` as UTF-8
    async fn get_secret(&self, secret_id: &str) -> Result<String, SecretError>;

    /// Create the secret with automatic replication and `plaintext` as its first version.
    /// Fails with [`SecretError::AlreadyExists`] if the id is taken.
    async fn create_secret(&self, secret_id: &str, plaintext: &str)
        -> Result<SecretRef, SecretError>;

    async fn delete_secret(&self, secret_id: &str) -> Result<(), SecretError>;
}

/// Path read by [`SecretStore::get_secret`]
pub fn secret_version_path(project: &str, secret_id: &str) -> String {
    format!("projects/{project}/secrets/{secret_id}/versions/latest")
}

/// Path of the secret container itself
pub fn secret_path(project: &str, secret_id: &str) -> String {
    format!("projects/{project}/secrets/{secret_id}")
}

/// How bearer tokens are obtained
#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    /// GCE / Cloud Run metadata server
    Metadata { url: String },
}

impl TokenSource {
    /// The configured access token, otherwise the metadata server
    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.access_token {
            Some(token) => TokenSource::Static(token.expose().to_string()),
            None => TokenSource::Metadata {
                url: METADATA_TOKEN_URL.to_string(),
            },
        }
    }

    async fn token(&self, client: &Client) -> Result<String, SecretError> {
        match self {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::Metadata { url } => {
                let response = client
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| SecretError::Token(e.to_string()))?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(SecretError::Token(format!("HTTP {} - {}", status, body)));
                }

                let token: MetadataToken = response
                    .json()
                    .await
                    .map_err(|e| SecretError::Token(format!("invalid token response: {}", e)))?;
                Ok(token.access_token)
            }
        }
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
}

#[derive(Deserialize)]
struct AccessSecretVersionResponse {
    payload: SecretPayload,
}

#[derive(Serialize, Deserialize)]
struct SecretPayload {
    data: String,
}

#[derive(Serialize)]
struct AddSecretVersionRequest {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// Secret Manager REST client
///
/// Reads and creates go through `project_id`; deletes address the
/// project by `project_uuid` (its number).
#[derive(Debug, Clone)]
pub struct SecretManagerClient {
    project_id: String,
    project_uuid: String,
    endpoint: String,
    token: TokenSource,
}

impl SecretManagerClient {
    pub fn new(
        project_id: impl Into<String>,
        project_uuid: impl Into<String>,
        endpoint: impl Into<String>,
        token: TokenSource,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            project_uuid: project_uuid.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.project_id.clone(),
            settings.project_uuid.clone(),
            settings.secret_manager_endpoint.clone(),
            TokenSource::from_settings(settings),
        )
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/v1/{}", self.endpoint, resource)
    }

    /// Client scoped to a single call
    fn client(&self) -> Result<Client, SecretError> {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(SecretError::Client)
    }

    async fn request(
        &self,
        client: &Client,
        method: Method,
        url: String,
    ) -> Result<RequestBuilder, SecretError> {
        let token = self.token.token(client).await?;
        Ok(client.request(method, url).bearer_auth(token))
    }

    /// Best-effort delete of a secret left without a version
    async fn discard(&self, client: &Client, name: &str) {
        let result = match self.request(client, Method::DELETE, self.url(name)).await {
            Ok(request) => request.send().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(response) if response.status().is_success() => {
                warn!(secret = %name, "Removed secret after failing to add its first version");
            }
            Ok(response) => {
                error!(secret = %name, status = %response.status(), "Failed to remove partially created secret");
            }
            Err(e) => {
                error!(secret = %name, error = %e, "Failed to remove partially created secret");
            }
        }
    }
}

/// Map a non-success response to the matching error, keyed by `secret_id`
async fn error_for(response: Response, secret_id: &str) -> SecretError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);

    let secret_id = secret_id.to_string();
    match status {
        StatusCode::NOT_FOUND => SecretError::NotFound { secret_id },
        StatusCode::CONFLICT => SecretError::AlreadyExists { secret_id },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SecretError::PermissionDenied { secret_id }
        }
        status => SecretError::Api {
            secret_id,
            status,
            message,
        },
    }
}

fn transport(operation: &'static str, secret_id: &str) -> impl FnOnce(reqwest::Error) -> SecretError {
    let secret_id = secret_id.to_string();
    move |source| SecretError::Transport {
        operation,
        secret_id,
        source,
    }
}

#[async_trait]
impl SecretStore for SecretManagerClient {
    async fn get_secret(&self, secret_id: &str) -> Result<String, SecretError> {
        let client = self.client()?;
        let url = format!(
            "{}:access",
            self.url(&secret_version_path(&self.project_id, secret_id))
        );

        let response = self
            .request(&client, Method::GET, url)
            .await?
            .send()
            .await
            .map_err(transport("access", secret_id))?;

        if !response.status().is_success() {
            return Err(error_for(response, secret_id).await);
        }

        let body: AccessSecretVersionResponse = response
            .json()
            .await
            .map_err(transport("access", secret_id))?;

        let bytes = STANDARD
            .decode(body.payload.data.as_bytes())
            .map_err(|e| SecretError::Payload {
                secret_id: secret_id.to_string(),
                reason: e.to_string(),
            })?;

        debug!(secret = %secret_id, "Secret version accessed");

        String::from_utf8(bytes).map_err(|e| SecretError::Payload {
            secret_id: secret_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn create_secret(
        &self,
        secret_id: &str,
        plaintext: &str,
    ) -> Result<SecretRef, SecretError> {
        let client = self.client()?;
        let url = self.url(&format!("projects/{}/secrets", self.project_id));

        let response = self
            .request(&client, Method::POST, url)
            .await?
            .query(&[("secretId", secret_id)])
            .json(&serde_json::json!({ "replication": { "automatic": {} } }))
            .send()
            .await
            .map_err(transport("create", secret_id))?;

        if !response.status().is_success() {
            return Err(error_for(response, secret_id).await);
        }

        let secret: SecretRef = response
            .json()
            .await
            .map_err(transport("create", secret_id))?;

        let version_url = format!("{}:addVersion", self.url(&secret.name));
        let response = self
            .request(&client, Method::POST, version_url)
            .await?
            .json(&AddSecretVersionRequest {
                payload: SecretPayload {
                    data: STANDARD.encode(plaintext.as_bytes()),
                },
            })
            .send()
            .await
            .map_err(transport("add version to", secret_id));

        let failure = match response {
            Ok(response) if response.status().is_success() => None,
            Ok(response) => Some(error_for(response, secret_id).await),
            Err(e) => Some(e),
        };
        if let Some(error) = failure {
            // An empty container would make retries fail with AlreadyExists
            self.discard(&client, &secret.name).await;
            return Err(error);
        }

        info!(secret = %secret.name, "Secret created");
        Ok(secret)
    }

    async fn delete_secret(&self, secret_id: &str) -> Result<(), SecretError> {
        let client = self.client()?;
        let url = self.url(&secret_path(&self.project_uuid, secret_id));

        let response = self
            .request(&client, Method::DELETE, url)
            .await?
            .send()
            .await
            .map_err(transport("delete", secret_id))?;

        if !response.status().is_success() {
            return Err(error_for(response, secret_id).await);
        }

        info!(secret = %secret_id, "Secret deleted");
        Ok(())
    }
}
