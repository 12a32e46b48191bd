//! Remote object store protocols.
//!
//! The store is reached through two APIs with different limits:
//!
//! - [`FastStore`]: simple request/response, capped object size, native
//!   range reads on download.
//! - [`SessionStore`]: session-authenticated, no practical size cap, moves
//!   bytes in parts and reads arbitrary ranges.
//!
//! [`BotApiClient`] implements the fast API over HTTP. [`MemoryStore`]
//! implements both in process. [`UnconfiguredSessionStore`] refuses
//! session connections outright.

pub mod bot;
pub mod memory;
pub mod unconfigured;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::credentials::CredentialsRecord;
use crate::{Result, TelestoreError};

pub use bot::BotApiClient;
pub use memory::MemoryStore;
pub use unconfigured::UnconfiguredSessionStore;

/// Stream of bytes read from the remote store.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Identifiers of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    /// Message holding the object in the destination channel.
    pub message_id: i64,
    /// Store-wide file identifier.
    pub file_id: String,
}

/// An open read against the fast API.
pub struct RemoteRead {
    /// Size of the whole object.
    pub total_size: u64,
    /// Bytes of the requested range (or the whole object).
    pub stream: ByteStream,
}

/// Resolved destination channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    /// Channel identifier as configured.
    pub id: i64,
    /// Access hash returned by resolution.
    pub access_hash: i64,
}

/// A file whose parts have all been uploaded through a session.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Key the parts were uploaded under.
    pub upload_key: i64,
    /// Number of parts.
    pub parts: u32,
    /// File name to attach.
    pub file_name: String,
    /// Total size in bytes.
    pub size: u64,
}

/// Fast, size-limited remote API.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Store `bytes` as a document in the credentials' destination channel.
    async fn send_document(
        &self,
        credentials: &CredentialsRecord,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<UploadReceipt>;

    /// Open a read of `file_id`, optionally limited to the inclusive range `(start, end)`.
    async fn open_read(
        &self,
        credentials: &CredentialsRecord,
        file_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<RemoteRead>;
}

/// Opens sessions against the session-authenticated API.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Connect with the credentials' session token.
    async fn connect(&self, credentials: &CredentialsRecord) -> Result<Box<dyn RemoteSession>>;
}

/// One authenticated session.
///
/// Sessions are owned by a single task and dropped when it finishes.
#[async_trait]
pub trait RemoteSession: Send {
    /// Resolve a channel id to a handle. Known to fail transiently.
    async fn resolve_channel(&mut self, channel_id: i64) -> Result<ChannelHandle>;

    /// Upload one part of a file.
    async fn upload_part(&mut self, upload_key: i64, part_index: u32, bytes: Bytes) -> Result<()>;

    /// Post a fully uploaded file to `channel`.
    async fn send_uploaded(
        &mut self,
        channel: &ChannelHandle,
        file: UploadedFile,
    ) -> Result<UploadReceipt>;

    /// Size of the object attached to `message_id`.
    async fn object_size(&mut self, channel: &ChannelHandle, message_id: i64) -> Result<u64>;

    /// Read at most `limit` bytes starting at `offset`.
    async fn read_range(
        &mut self,
        channel: &ChannelHandle,
        message_id: i64,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes>;

    /// Close the session.
    async fn disconnect(&mut self);
}

/// Resolve `channel_id`, retrying with linear backoff.
///
/// Resolution is the one step of the session API known to fail
/// transiently, so it alone is retried.
pub async fn resolve_with_retry(
    session: &mut dyn RemoteSession,
    channel_id: i64,
    attempts: u32,
    backoff: Duration,
) -> Result<ChannelHandle> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match session.resolve_channel(channel_id).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                tracing::warn!(channel_id, attempt, error = %e, "Channel resolution failed");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff * attempt).await;
        }
    }

    Err(TelestoreError::RemoteStore(format!(
        "could not resolve channel {} after {} attempts: {}",
        channel_id,
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Skip `skip` bytes of `stream` and yield at most `take` bytes after that.
///
/// Used when a server ignores a range request and sends the whole object.
pub(crate) fn slice_stream(stream: ByteStream, skip: u64, take: u64) -> ByteStream {
    let sliced = stream
        .scan((skip, take), |(skip, take), item| {
            let out = match item {
                Err(e) => Some(Err(e)),
                Ok(_) if *take == 0 => None,
                Ok(mut chunk) => {
                    let len = chunk.len() as u64;
                    if *skip >= len {
                        *skip -= len;
                        Some(Ok(Bytes::new()))
                    } else {
                        let chunk = chunk.split_off(*skip as usize);
                        *skip = 0;
                        let keep = (*take).min(chunk.len() as u64);
                        *take -= keep;
                        Some(Ok(chunk.slice(..keep as usize)))
                    }
                }
            };
            futures::future::ready(out)
        })
        .filter(|item| futures::future::ready(!matches!(item, Ok(b) if b.is_empty())));
    Box::pin(sliced)
}
