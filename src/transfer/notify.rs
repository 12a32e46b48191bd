//! Completion webhook towards the metadata layer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use url::Url;

use crate::{Result, TelestoreError};

/// What the metadata layer is told after a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadNotice {
    /// Backend user owning the file, if the credentials named one.
    pub user_id: Option<String>,
    /// Original file name.
    pub file_name: String,
    /// Remote message id.
    pub message_id: i64,
    /// Remote file id.
    pub file_id: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type derived from the file name.
    pub mime_type: String,
}

/// Receives completion notices.
#[async_trait]
pub trait UploadNotifier: Send + Sync {
    /// Deliver one notice.
    async fn notify(&self, notice: &UploadNotice) -> Result<()>;
}

/// Posts notices to `{backend_url}/api/webhook/upload`.
pub struct HttpNotifier {
    client: Client,
    endpoint: Url,
}

impl HttpNotifier {
    /// Create a notifier for the backend at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join("/api/webhook/upload"))
            .map_err(|e| TelestoreError::Config(format!("invalid backend URL: {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelestoreError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl UploadNotifier for HttpNotifier {
    async fn notify(&self, notice: &UploadNotice) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(notice)
            .send()
            .await
            .map_err(|e| TelestoreError::RemoteStore(format!("webhook failed: {e}")))?;

        if !response.status().is_success() {
            return Err(TelestoreError::RemoteStore(format!(
                "webhook failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}
