//! Range-serving downloads from the remote store.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, Stream};

use super::range::{self, ByteRange};
use crate::credentials::CredentialsRecord;
use crate::remote::{resolve_with_retry, ByteStream, ChannelHandle, FastStore, RemoteSession, SessionStore};
use crate::tier::{Tier, TierPolicy};
use crate::{Result, TelestoreError};

/// Part size for session reads.
pub const DEFAULT_PART_SIZE: usize = 1024 * 1024;

/// What the client asked for.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Message holding the object in the destination channel.
    pub object_id: i64,
    /// Name used for the MIME type and the `Content-Disposition` header.
    pub file_name: String,
    /// Object size as known to the metadata layer.
    pub size: Option<u64>,
    /// Fast-API file identifier, if known.
    pub file_id: Option<String>,
    /// Raw `Range` header.
    pub range: Option<String>,
}

/// Response metadata for a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDescriptor {
    /// Message holding the object.
    pub object_id: i64,
    /// File name.
    pub file_name: String,
    /// MIME type derived from the file name.
    pub mime_type: String,
    /// Size of the whole object.
    pub total_size: u64,
    /// Range being served, `None` for the whole object.
    pub range: Option<ByteRange>,
    /// Protocol used to read the object.
    pub tier: Tier,
}

impl DownloadDescriptor {
    /// Number of body bytes.
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.total_size, |r| r.len())
    }

    /// `Content-Range` value for partial responses.
    pub fn content_range(&self) -> Option<String> {
        self.range.map(|r| r.content_range(self.total_size))
    }
}

/// Descriptor plus the body stream.
pub struct Download {
    /// Response metadata.
    pub descriptor: DownloadDescriptor,
    /// Body bytes, pulled on demand.
    pub body: ByteStream,
}

/// Serves objects and byte ranges of objects.
///
/// Bodies are pulled from the remote store as the client consumes them.
/// Dropping the body stops the upstream reads and closes the session.
pub struct Downloader {
    fast: Arc<dyn FastStore>,
    sessions: Arc<dyn SessionStore>,
    tiers: TierPolicy,
    part_size: usize,
    resolve_attempts: u32,
    resolve_backoff: Duration,
}

impl Downloader {
    /// Create a downloader reading session parts of `part_size` bytes.
    pub fn new(
        fast: Arc<dyn FastStore>,
        sessions: Arc<dyn SessionStore>,
        tiers: TierPolicy,
        part_size: usize,
    ) -> Self {
        Self {
            fast,
            sessions,
            tiers,
            part_size: part_size.max(1),
            resolve_attempts: 3,
            resolve_backoff: Duration::from_millis(500),
        }
    }

    /// Set how channel resolution is retried.
    pub fn with_resolve_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.resolve_attempts = attempts.max(1);
        self.resolve_backoff = backoff;
        self
    }

    /// Tier a request will be served from.
    pub fn tier_for(&self, request: &DownloadRequest) -> Tier {
        match (request.size, &request.file_id) {
            (Some(size), Some(_)) => self.tiers.for_download(size),
            _ => Tier::Large,
        }
    }

    /// Serve `request` with `credentials`.
    ///
    /// Unsatisfiable ranges fail with [`TelestoreError::RangeNotSatisfiable`]
    /// before any bytes are read.
    pub async fn serve(
        &self,
        request: &DownloadRequest,
        credentials: &CredentialsRecord,
    ) -> Result<Download> {
        match (self.tier_for(request), request.size, request.file_id.as_deref()) {
            (Tier::Small, Some(size), Some(file_id)) => {
                self.serve_small(request, file_id, size, credentials).await
            }
            _ => self.serve_large(request, credentials).await,
        }
    }

    async fn serve_small(
        &self,
        request: &DownloadRequest,
        file_id: &str,
        size: u64,
        credentials: &CredentialsRecord,
    ) -> Result<Download> {
        let range = range::select(request.range.as_deref(), size)?;
        let read = self
            .fast
            .open_read(credentials, file_id, range.map(|r| (r.start, r.end)))
            .await?;

        if read.total_size != size {
            tracing::warn!(
                object_id = request.object_id,
                declared = size,
                actual = read.total_size,
                "Object size differs from metadata"
            );
        }

        let descriptor = describe(request, read.total_size, range, Tier::Small);
        let guard = RelayGuard::new(request.object_id, descriptor.content_length());
        tracing::debug!(
            object_id = request.object_id,
            bytes = descriptor.content_length(),
            "Serving download from fast API"
        );

        Ok(Download {
            descriptor,
            body: Box::pin(Relay {
                inner: read.stream,
                guard,
            }),
        })
    }

    async fn serve_large(
        &self,
        request: &DownloadRequest,
        credentials: &CredentialsRecord,
    ) -> Result<Download> {
        let mut session = self.sessions.connect(credentials).await?;

        let prepared = self
            .prepare_large(session.as_mut(), request, credentials)
            .await;
        let (channel, total_size, range) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                session.disconnect().await;
                return Err(e);
            }
        };

        let descriptor = describe(request, total_size, range, Tier::Large);
        let (offset, stop) = match range {
            Some(r) => (r.start, r.end + 1),
            None => (0, total_size),
        };
        tracing::debug!(
            object_id = request.object_id,
            offset,
            bytes = stop - offset,
            "Serving download from session API"
        );

        let reader = RangeReader {
            session: Some(session),
            channel,
            message_id: request.object_id,
            offset,
            stop,
            part_size: self.part_size,
            guard: RelayGuard::new(request.object_id, stop - offset),
        };
        let body = stream::unfold(reader, |mut reader| async move {
            reader.next_part().await.map(|item| (item, reader))
        });

        Ok(Download {
            descriptor,
            body: Box::pin(body),
        })
    }

    async fn prepare_large(
        &self,
        session: &mut dyn RemoteSession,
        request: &DownloadRequest,
        credentials: &CredentialsRecord,
    ) -> Result<(ChannelHandle, u64, Option<ByteRange>)> {
        let channel = resolve_with_retry(
            session,
            credentials.destination_channel_id,
            self.resolve_attempts,
            self.resolve_backoff,
        )
        .await?;

        let total_size = match request.size {
            Some(size) => size,
            None => session.object_size(&channel, request.object_id).await?,
        };
        let range = range::select(request.range.as_deref(), total_size)?;
        Ok((channel, total_size, range))
    }
}

fn describe(
    request: &DownloadRequest,
    total_size: u64,
    range: Option<ByteRange>,
    tier: Tier,
) -> DownloadDescriptor {
    DownloadDescriptor {
        object_id: request.object_id,
        file_name: request.file_name.clone(),
        mime_type: mime_guess::from_path(&request.file_name)
            .first_or_octet_stream()
            .to_string(),
        total_size,
        range,
        tier,
    }
}

/// Counts relayed bytes and logs when a body is dropped early.
struct RelayGuard {
    object_id: i64,
    expected: u64,
    relayed: u64,
}

impl RelayGuard {
    fn new(object_id: i64, expected: u64) -> Self {
        Self {
            object_id,
            expected,
            relayed: 0,
        }
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if self.relayed < self.expected {
            tracing::info!(
                object_id = self.object_id,
                bytes = self.relayed,
                expected = self.expected,
                "Download ended early"
            );
        } else {
            tracing::debug!(object_id = self.object_id, bytes = self.relayed, "Download finished");
        }
    }
}

/// Fast-API body with relay accounting.
struct Relay {
    inner: ByteStream,
    guard: RelayGuard,
}

impl Stream for Relay {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(bytes))) = &item {
            self.guard.relayed += bytes.len() as u64;
        }
        item
    }
}

/// Pulls `[offset, stop)` from a session one part at a time.
struct RangeReader {
    session: Option<Box<dyn RemoteSession>>,
    channel: ChannelHandle,
    message_id: i64,
    offset: u64,
    stop: u64,
    part_size: usize,
    guard: RelayGuard,
}

impl RangeReader {
    async fn next_part(&mut self) -> Option<Result<Bytes>> {
        if self.session.is_none() {
            return None;
        }
        if self.offset >= self.stop {
            self.close().await;
            return None;
        }

        let limit = (self.stop - self.offset).min(self.part_size as u64) as usize;
        let session = self.session.as_mut()?;
        let read = session
            .read_range(&self.channel, self.message_id, self.offset, limit)
            .await;

        match read {
            Ok(bytes) if bytes.is_empty() => {
                let offset = self.offset;
                self.close().await;
                Some(Err(TelestoreError::RemoteStore(format!(
                    "remote store returned no data at offset {offset}"
                ))))
            }
            Ok(mut bytes) => {
                bytes.truncate(limit);
                self.offset += bytes.len() as u64;
                self.guard.relayed += bytes.len() as u64;
                Some(Ok(bytes))
            }
            Err(e) => {
                self.close().await;
                Some(Err(e))
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }
    }
}

impl Drop for RangeReader {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.disconnect().await;
            });
        }
    }
}
