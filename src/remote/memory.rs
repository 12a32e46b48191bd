//! In-process remote store.
//!
//! Implements both the fast and the session API over a shared map. Used
//! for local development (`backend = "memory"`) and by the test suite,
//! which relies on its fault injection and I/O counters.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream;
use tokio::sync::Mutex;

use super::{
    ChannelHandle, FastStore, RemoteRead, RemoteSession, SessionStore, UploadReceipt, UploadedFile,
};
use crate::credentials::CredentialsRecord;
use crate::tier::TierPolicy;
use crate::{Result, TelestoreError};

/// Size of the pieces a fast-API read is streamed in.
const READ_PIECE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    channel_id: i64,
    message_id: i64,
    file_id: String,
    file_name: String,
    bytes: Bytes,
}

#[derive(Default)]
struct Objects {
    next_message_id: i64,
    by_message: HashMap<(i64, i64), StoredObject>,
    by_file_id: HashMap<String, (i64, i64)>,
    pending: HashMap<i64, BTreeMap<u32, Bytes>>,
}

impl Objects {
    fn insert(&mut self, channel_id: i64, file_name: &str, bytes: Bytes) -> UploadReceipt {
        self.next_message_id += 1;
        let message_id = self.next_message_id;
        let file_id = format!("mem-{}", uuid::Uuid::new_v4().simple());

        self.by_file_id
            .insert(file_id.clone(), (channel_id, message_id));
        self.by_message.insert(
            (channel_id, message_id),
            StoredObject {
                channel_id,
                message_id,
                file_id: file_id.clone(),
                file_name: file_name.to_string(),
                bytes,
            },
        );

        UploadReceipt {
            message_id,
            file_id,
        }
    }
}

struct Inner {
    objects: Mutex<Objects>,
    fast_upload_limit: u64,
    fast_download_limit: u64,
    failing_resolutions: AtomicU32,
    failing_sends: Mutex<Option<String>>,
    part_delay: Mutex<Option<Duration>>,
    bytes_uploaded: AtomicU64,
    bytes_read: AtomicU64,
    resolutions: AtomicU32,
}

/// In-process remote store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store with the fast API's native limits.
    pub fn new() -> Self {
        Self::with_fast_limits(
            TierPolicy::DEFAULT_UPLOAD_THRESHOLD,
            TierPolicy::DEFAULT_DOWNLOAD_THRESHOLD,
        )
    }

    /// Create an empty store with explicit fast-API limits.
    pub fn with_fast_limits(upload_limit: u64, download_limit: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: Mutex::new(Objects::default()),
                fast_upload_limit: upload_limit,
                fast_download_limit: download_limit,
                failing_resolutions: AtomicU32::new(0),
                failing_sends: Mutex::new(None),
                part_delay: Mutex::new(None),
                bytes_uploaded: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                resolutions: AtomicU32::new(0),
            }),
        }
    }

    /// Store an object directly, bypassing both APIs.
    pub async fn insert_object(&self, channel_id: i64, file_name: &str, bytes: Bytes) -> UploadReceipt {
        self.inner
            .objects
            .lock()
            .await
            .insert(channel_id, file_name, bytes)
    }

    /// Bytes of the object stored under `file_id`.
    pub async fn object_bytes(&self, file_id: &str) -> Option<Bytes> {
        let objects = self.inner.objects.lock().await;
        let key = objects.by_file_id.get(file_id)?;
        objects.by_message.get(key).map(|o| o.bytes.clone())
    }

    /// File name of the object attached to `message_id`.
    pub async fn object_name(&self, channel_id: i64, message_id: i64) -> Option<String> {
        let objects = self.inner.objects.lock().await;
        objects
            .by_message
            .get(&(channel_id, message_id))
            .map(|o| o.file_name.clone())
    }

    /// Number of stored objects.
    pub async fn object_count(&self) -> usize {
        self.inner.objects.lock().await.by_message.len()
    }

    /// Fail the next `n` channel resolutions.
    pub fn fail_next_resolutions(&self, n: u32) {
        self.inner.failing_resolutions.store(n, Ordering::SeqCst);
    }

    /// Fail the next fast-API upload with `message`.
    pub async fn fail_next_send(&self, message: impl Into<String>) {
        *self.inner.failing_sends.lock().await = Some(message.into());
    }

    /// Sleep this long before every session part upload.
    pub async fn set_part_delay(&self, delay: Duration) {
        *self.inner.part_delay.lock().await = Some(delay);
    }

    /// Bytes received through either upload API.
    pub fn bytes_uploaded(&self) -> u64 {
        self.inner.bytes_uploaded.load(Ordering::SeqCst)
    }

    /// Bytes served through either read API.
    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::SeqCst)
    }

    /// Channel resolution attempts, failed ones included.
    pub fn resolutions(&self) -> u32 {
        self.inner.resolutions.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn send_document(
        &self,
        credentials: &CredentialsRecord,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<UploadReceipt> {
        credentials.bot_token()?;

        if let Some(message) = self.inner.failing_sends.lock().await.take() {
            return Err(TelestoreError::RemoteStore(message));
        }
        if bytes.len() as u64 > self.inner.fast_upload_limit {
            return Err(TelestoreError::RemoteStore(
                "Request Entity Too Large".to_string(),
            ));
        }

        self.inner
            .bytes_uploaded
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        let receipt = self.inner.objects.lock().await.insert(
            credentials.destination_channel_id,
            file_name,
            bytes,
        );
        Ok(receipt)
    }

    async fn open_read(
        &self,
        credentials: &CredentialsRecord,
        file_id: &str,
        range: Option<(u64, u64)>,
    ) -> Result<RemoteRead> {
        credentials.bot_token()?;

        let object = {
            let objects = self.inner.objects.lock().await;
            objects
                .by_file_id
                .get(file_id)
                .and_then(|key| objects.by_message.get(key))
                .cloned()
                .ok_or_else(|| TelestoreError::RemoteStore(format!("file {file_id} not found")))?
        };

        let total_size = object.bytes.len() as u64;
        if total_size > self.inner.fast_download_limit {
            return Err(TelestoreError::RemoteStore("file is too big".to_string()));
        }

        let body = match range {
            Some((start, end)) => {
                if start >= total_size || start > end {
                    return Err(TelestoreError::RemoteStore(
                        "requested range not satisfiable".to_string(),
                    ));
                }
                let end = end.min(total_size - 1);
                object.bytes.slice(start as usize..=end as usize)
            }
            None => object.bytes,
        };
        self.inner
            .bytes_read
            .fetch_add(body.len() as u64, Ordering::SeqCst);

        let pieces: Vec<Result<Bytes>> = body
            .chunks(READ_PIECE)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();

        Ok(RemoteRead {
            total_size,
            stream: Box::pin(stream::iter(pieces)),
        })
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn connect(&self, credentials: &CredentialsRecord) -> Result<Box<dyn RemoteSession>> {
        credentials.session_credentials()?;
        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
            connected: true,
        }))
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    connected: bool,
}

impl MemorySession {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(TelestoreError::RemoteStore("session disconnected".to_string()))
        }
    }
}

#[async_trait]
impl RemoteSession for MemorySession {
    async fn resolve_channel(&mut self, channel_id: i64) -> Result<ChannelHandle> {
        self.ensure_connected()?;
        self.inner.resolutions.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .inner
            .failing_resolutions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TelestoreError::RemoteStore(format!(
                "could not find the input entity for channel {channel_id}"
            )));
        }

        Ok(ChannelHandle {
            id: channel_id,
            access_hash: channel_id.wrapping_mul(31),
        })
    }

    async fn upload_part(&mut self, upload_key: i64, part_index: u32, bytes: Bytes) -> Result<()> {
        self.ensure_connected()?;

        let delay = *self.inner.part_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.inner
            .bytes_uploaded
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.inner
            .objects
            .lock()
            .await
            .pending
            .entry(upload_key)
            .or_default()
            .insert(part_index, bytes);
        Ok(())
    }

    async fn send_uploaded(
        &mut self,
        channel: &ChannelHandle,
        file: UploadedFile,
    ) -> Result<UploadReceipt> {
        self.ensure_connected()?;

        let mut objects = self.inner.objects.lock().await;
        let parts = objects.pending.remove(&file.upload_key).unwrap_or_default();

        if parts.len() as u32 != file.parts || parts.keys().copied().ne(0..file.parts) {
            return Err(TelestoreError::RemoteStore(format!(
                "file parts missing: expected {}, got {}",
                file.parts,
                parts.len()
            )));
        }

        let mut buffer = BytesMut::with_capacity(file.size as usize);
        for part in parts.values() {
            buffer.extend_from_slice(part);
        }
        if buffer.len() as u64 != file.size {
            return Err(TelestoreError::RemoteStore(format!(
                "file size mismatch: declared {}, uploaded {}",
                file.size,
                buffer.len()
            )));
        }

        Ok(objects.insert(channel.id, &file.file_name, buffer.freeze()))
    }

    async fn object_size(&mut self, channel: &ChannelHandle, message_id: i64) -> Result<u64> {
        self.ensure_connected()?;
        let objects = self.inner.objects.lock().await;
        objects
            .by_message
            .get(&(channel.id, message_id))
            .map(|o| o.bytes.len() as u64)
            .ok_or_else(|| TelestoreError::NotFound(format!("message {message_id}")))
    }

    async fn read_range(
        &mut self,
        channel: &ChannelHandle,
        message_id: i64,
        offset: u64,
        limit: usize,
    ) -> Result<Bytes> {
        self.ensure_connected()?;
        let objects = self.inner.objects.lock().await;
        let object = objects
            .by_message
            .get(&(channel.id, message_id))
            .ok_or_else(|| TelestoreError::NotFound(format!("message {message_id}")))?;

        let len = object.bytes.len();
        let start = (offset as usize).min(len);
        let end = start.saturating_add(limit).min(len);
        let slice = object.bytes.slice(start..end);

        tracing::trace!(
            channel_id = object.channel_id,
            message_id = object.message_id,
            file_id = %object.file_id,
            offset,
            bytes = slice.len(),
            "Memory read"
        );
        self.inner
            .bytes_read
            .fetch_add(slice.len() as u64, Ordering::SeqCst);
        Ok(slice)
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}
