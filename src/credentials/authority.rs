//! Client for the external credential authority.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use super::record::{CredentialsRecord, ProofKind};
use crate::{Result, TelestoreError};

/// User agent string for authority calls.
const USER_AGENT: &str = "TeleStore-Worker/1.0";

/// Why the authority did not issue credentials.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The authority answered and refused the proof.
    #[error("credential authority rejected the proof: {0}")]
    Rejected(String),
    /// The authority could not be reached or failed internally.
    #[error("credential authority unavailable: {0}")]
    Unavailable(String),
}

/// Issues credentials for an auth proof.
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Verify `auth_proof` and return the principal's credentials.
    async fn verify(
        &self,
        auth_proof: &str,
        kind: ProofKind,
    ) -> std::result::Result<CredentialsRecord, AuthorityError>;
}

/// HTTP client for the backend's worker endpoints.
pub struct HttpAuthority {
    client: Client,
    base_url: Url,
}

impl HttpAuthority {
    /// Create a client for the backend at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TelestoreError::Config(format!("invalid backend URL: {e}")))?;

        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TelestoreError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, AuthorityError> {
        self.base_url
            .join(path)
            .map_err(|e| AuthorityError::Unavailable(format!("invalid endpoint: {e}")))
    }
}

#[async_trait]
impl CredentialAuthority for HttpAuthority {
    async fn verify(
        &self,
        auth_proof: &str,
        kind: ProofKind,
    ) -> std::result::Result<CredentialsRecord, AuthorityError> {
        let request = match kind {
            ProofKind::Session => self
                .client
                .get(self.endpoint("/api/worker/credentials")?)
                .bearer_auth(auth_proof),
            ProofKind::DownloadToken => self
                .client
                .post(self.endpoint("/api/worker/verify-download-token")?)
                .form(&[("token", auth_proof)]),
        };

        let response = request
            .send()
            .await
            .map_err(|e| AuthorityError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<CredentialsRecord>().await.map_err(|e| {
                AuthorityError::Unavailable(format!("malformed credentials record: {e}"))
            });
        }

        let detail = error_detail(response).await;
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            Err(AuthorityError::Rejected(format!("{status}: {detail}")))
        } else {
            Err(AuthorityError::Unavailable(format!("{status}: {detail}")))
        }
    }
}

/// Pull the `detail` message out of an error body, falling back to the raw text.
async fn error_detail(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or(text)
}
