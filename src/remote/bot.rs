//! HTTP client for the bot API (fast path).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::RANGE;
use reqwest::{multipart, Client, StatusCode};
use serde::Deserialize;

use super::{slice_stream, ByteStream, FastStore, RemoteRead, UploadReceipt};
use crate::credentials::CredentialsRecord;
use crate::{Result, TelestoreError};

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Read timeout between body chunks in seconds.
const READ_TIMEOUT_SECS: u64 = 60;

/// User agent string for bot API calls.
const USER_AGENT: &str = "TeleStore-Worker/1.0";

#[derive(Debug, Deserialize)]
struct BotResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: String,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    #[serde(default)]
    document: Option<FileRef>,
    #[serde(default)]
    video: Option<FileRef>,
    #[serde(default)]
    audio: Option<FileRef>,
    #[serde(default)]
    photo: Option<Vec<FileRef>>,
}

impl Message {
    /// Identifier of the attached media: document, video, audio, then the largest photo.
    fn file_id(&self) -> Option<&str> {
        self.document
            .as_ref()
            .or(self.video.as_ref())
            .or(self.audio.as_ref())
            .or_else(|| {
                self.photo
                    .as_ref()
                    .and_then(|sizes| sizes.iter().max_by_key(|p| p.file_size.unwrap_or(0)))
            })
            .map(|f| f.file_id.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    file_size: Option<u64>,
}

/// Bot API client.
pub struct BotApiClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl BotApiClient {
    /// Create a client against `base_url` (e.g. `https://api.telegram.org`).
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TelestoreError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    fn method_url(&self, token: &str, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, token, method)
    }

    fn file_url(&self, token: &str, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, token, file_path)
    }

    async fn get_file(&self, token: &str, file_id: &str) -> Result<FileInfo> {
        let response = self
            .client
            .get(self.method_url(token, "getFile"))
            .query(&[("file_id", file_id)])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| TelestoreError::RemoteStore(format!("getFile failed: {e}")))?;

        unwrap_result(response, "getFile").await
    }
}

/// Decode a bot API envelope, turning `ok: false` into a remote store error.
async fn unwrap_result<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    method: &str,
) -> Result<T> {
    let status = response.status();
    let body: BotResponse<T> = response
        .json()
        .await
        .map_err(|e| TelestoreError::RemoteStore(format!("{method}: invalid response ({status}): {e}")))?;

    match (body.ok, body.result) {
        (true, Some(result)) => Ok(result),
        _ => Err(TelestoreError::RemoteStore(format!(
            "{method} failed: {}",
            body.description.unwrap_or_else(|| status.to_string())
        ))),
    }
}

#[async_trait]
impl FastStore for BotApiClient {
    async fn send_document(
        &self,
        credentials: &CredentialsRecord,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<UploadReceipt> {
        let token = credentials.bot_token()?;
        let size = bytes.len();

        let part = multipart::Part::stream_with_length(bytes, size as u64)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| TelestoreError::RemoteStore(format!("invalid part: {e}")))?;
        let form = multipart::Form::new()
            .text("chat_id", credentials.destination_channel_id.to_string())
            .part("document", part);

        let response = self
            .client
            .post(self.method_url(token, "sendDocument"))
            .multipart(form)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| TelestoreError::RemoteStore(format!("sendDocument failed: {e}")))?;

        let message: Message = unwrap_result(response, "sendDocument").await?;
        let file_id = message.file_id().ok_or_else(|| {
            TelestoreError::RemoteStore("sendDocument response carries no file_id".to_string())
        })?;

        tracing::debug!(message_id = message.message_id, bytes = size, "Bot API upload done");

        Ok(UploadReceipt {
            message_id: message.message_id,
            file_id: file_id.to_string(),
        })
    }

    async fn open_read(
        &self,
        credentials: &CredentialsRecord,
        file_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<RemoteRead> {
        let token = credentials.bot_token()?;
        let info = self.get_file(token, file_id).await?;

        let file_path = info
            .file_path
            .ok_or_else(|| TelestoreError::RemoteStore("getFile returned no file_path".to_string()))?;

        let mut request = self.client.get(self.file_url(token, &file_path));
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={start}-{end}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TelestoreError::RemoteStore(format!("file download failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelestoreError::RemoteStore(format!(
                "file download failed: HTTP {status}"
            )));
        }

        let total_size = match info.file_size.or_else(|| content_range_total(&response)) {
            Some(size) => size,
            None if status == StatusCode::OK => response.content_length().unwrap_or(0),
            None => 0,
        };

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| TelestoreError::RemoteStore(format!("file read failed: {e}"))),
        );

        // Ranged request answered with the whole object
        let stream = match range {
            Some((start, end)) if status == StatusCode::OK => {
                slice_stream(stream, start, end.saturating_sub(start).saturating_add(1))
            }
            _ => stream,
        };

        Ok(RemoteRead { total_size, stream })
    }
}

fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}
