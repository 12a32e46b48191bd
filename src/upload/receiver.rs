//! Chunk receiver: stores upload chunks and tracks session completeness.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use super::scratch::{validate_session_id, ScratchStore};
use super::session::{ChunkStatus, UploadSession};
use crate::{Result, TelestoreError};

type SessionRef = Arc<Mutex<UploadSession>>;

/// One chunk-store call.
#[derive(Debug, Clone, Copy)]
pub struct ChunkUpload<'a> {
    /// Session the chunk belongs to.
    pub session_id: &'a str,
    /// 0-based chunk index.
    pub chunk_index: u32,
    /// Declared chunk count.
    pub total_chunks: u32,
    /// File name, used when this chunk opens the session.
    pub file_name: &'a str,
    /// Declared file size; required when this chunk opens the session.
    pub total_size: Option<u64>,
    /// Chunk content.
    pub bytes: &'a [u8],
}

/// Accepts chunks for client-declared upload sessions.
///
/// Chunks are persisted to [`ScratchStore`] before they are counted, and
/// the session table is rebuilt from disk on a miss, so a restarted process
/// picks up where the previous one stopped.
pub struct ChunkReceiver {
    scratch: ScratchStore,
    max_chunk_bytes: u64,
    max_file_bytes: u64,
    sessions: RwLock<HashMap<String, SessionRef>>,
}

impl ChunkReceiver {
    /// Create a receiver over `scratch`.
    pub fn new(scratch: ScratchStore, max_chunk_bytes: u64, max_file_bytes: u64) -> Self {
        Self {
            scratch,
            max_chunk_bytes,
            max_file_bytes,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying scratch storage.
    pub fn scratch(&self) -> &ScratchStore {
        &self.scratch
    }

    /// Per-chunk ceiling in bytes.
    pub fn max_chunk_bytes(&self) -> u64 {
        self.max_chunk_bytes
    }

    /// Declare a session. Repeating an identical declaration is a no-op.
    pub async fn init(
        &self,
        session_id: &str,
        file_name: &str,
        total_chunks: u32,
        total_size: u64,
    ) -> Result<ChunkStatus> {
        validate_session_id(session_id)?;
        self.check_declaration(total_chunks, total_size)?;

        let session = self
            .session_or_create(session_id, || {
                UploadSession::new(session_id, file_name, total_size, total_chunks)
            })
            .await?;
        let session = session.lock().await;

        let manifest = session.manifest();
        if manifest.declared_chunk_count != total_chunks
            || manifest.declared_total_size != total_size
            || manifest.file_name != file_name
        {
            return Err(TelestoreError::Conflict(format!(
                "session {session_id} already declared with a different layout"
            )));
        }

        Ok(session.status())
    }

    /// Store one chunk.
    ///
    /// Re-sending a stored index overwrites the earlier copy and leaves the
    /// received count unchanged. Rejected calls never touch disk.
    pub async fn store_chunk(&self, upload: ChunkUpload<'_>) -> Result<ChunkStatus> {
        validate_session_id(upload.session_id)?;

        let size = upload.bytes.len() as u64;
        if size > self.max_chunk_bytes {
            return Err(TelestoreError::Validation(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                size, self.max_chunk_bytes
            )));
        }

        let session = self
            .session_or_create(upload.session_id, || {
                let total_size = upload.total_size.ok_or_else(|| {
                    TelestoreError::Validation("total_size is required to open a session".into())
                })?;
                self.check_declaration(upload.total_chunks, total_size)?;
                UploadSession::new(
                    upload.session_id,
                    upload.file_name,
                    total_size,
                    upload.total_chunks,
                )
            })
            .await?;

        {
            let session = session.lock().await;
            Self::ensure_open(&session)?;
            session.check_chunk(upload.chunk_index, upload.total_chunks, upload.total_size)?;
        }

        // Written aside without the lock; only put in place while the
        // session is known to be open.
        let staged = self
            .scratch
            .stage_chunk(upload.session_id, upload.chunk_index, upload.bytes)
            .await?;

        let mut session = session.lock().await;
        if session.is_closed() {
            staged.discard().await;
            return Err(TelestoreError::Conflict(format!(
                "upload session {} is closed",
                upload.session_id
            )));
        }
        staged.commit().await?;

        session.record_chunk(upload.chunk_index, size);
        self.scratch.write_manifest(session.manifest()).await?;

        let status = session.status();
        tracing::debug!(
            session_id = upload.session_id,
            chunk_index = upload.chunk_index,
            bytes = size,
            received = status.received_count,
            total = status.total_count,
            "Stored chunk"
        );
        Ok(status)
    }

    /// Claim a complete session for reassembly.
    ///
    /// Fails with `IncompleteSession` while chunks are missing. A claimed
    /// session accepts no more chunks until it is released.
    pub async fn claim(&self, session_id: &str) -> Result<UploadSession> {
        validate_session_id(session_id)?;
        let session = self
            .lookup(session_id)
            .await?
            .ok_or_else(|| TelestoreError::NotFound(format!("upload session {session_id}")))?;

        let mut session = session.lock().await;
        Self::ensure_open(&session)?;
        session.ensure_complete()?;
        session.set_closed(true);
        Ok(session.clone())
    }

    /// Reopen a claimed session after a failed completion attempt.
    ///
    /// The received set is reconciled with the chunk files still on disk,
    /// so chunks lost during the attempt have to be sent again.
    pub async fn release(&self, session_id: &str) {
        let session = self.sessions.read().await.get(session_id).cloned();
        let Some(session) = session else {
            return;
        };

        let mut session = session.lock().await;
        match self.scratch.list_chunks(session_id).await {
            Ok(on_disk) => {
                let dropped = session.retain_on_disk(&on_disk);
                if dropped > 0 {
                    tracing::warn!(
                        session_id,
                        dropped,
                        received = session.received_count(),
                        "Upload session lost chunks; they must be re-sent"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Failed to list chunks on release");
                session.retain_on_disk(&BTreeMap::new());
            }
        }
        session.set_closed(false);
    }

    /// Forget a session whose chunks were consumed by reassembly.
    pub async fn finish(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    /// Cancel a session and delete its scratch data.
    ///
    /// Returns `true` if there was anything to cancel.
    pub async fn cancel(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;

        let session = self.sessions.write().await.remove(session_id);
        if let Some(session) = &session {
            session.lock().await.set_closed(true);
        }

        let removed = self.scratch.remove_session(session_id).await?;
        if session.is_some() || removed {
            tracing::info!(session_id, "Upload session cancelled");
        }
        Ok(session.is_some() || removed)
    }

    /// Delete sessions idle for longer than `retention`.
    ///
    /// Sessions claimed for completion are left alone.
    pub async fn sweep_stale(&self, retention: Duration) -> Result<usize> {
        let mut removed = 0;

        for session_id in self.scratch.list_sessions().await? {
            let in_memory = self.sessions.read().await.get(&session_id).cloned();

            let idle = match &in_memory {
                Some(session) => {
                    let session = session.lock().await;
                    if session.is_closed() {
                        continue;
                    }
                    elapsed_since(session.manifest().updated_at)
                }
                None => match self.scratch.read_manifest(&session_id).await {
                    Ok(Some(manifest)) => elapsed_since(manifest.updated_at),
                    Ok(None) | Err(_) => dir_age(&self.scratch.session_dir(&session_id)),
                },
            };

            if idle < retention {
                continue;
            }

            self.sessions.write().await.remove(&session_id);
            if let Some(session) = in_memory {
                session.lock().await.set_closed(true);
            }
            if self.scratch.remove_session(&session_id).await? {
                tracing::info!(session_id = %session_id, "Removed stale upload session");
                removed += 1;
            }
        }

        self.scratch.cleanup_empty_dirs().await?;
        Ok(removed)
    }

    /// Whether `session_id` names an open or claimed session, in memory or on disk.
    pub async fn has_session(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        Ok(self.lookup(session_id).await?.is_some())
    }

    /// Number of sessions held in memory.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn check_declaration(&self, total_chunks: u32, total_size: u64) -> Result<()> {
        if total_size > self.max_file_bytes {
            return Err(TelestoreError::Validation(format!(
                "file of {} bytes exceeds the {} byte limit",
                total_size, self.max_file_bytes
            )));
        }
        if u64::from(total_chunks).saturating_mul(self.max_chunk_bytes) < total_size {
            return Err(TelestoreError::Validation(format!(
                "{} chunks of at most {} bytes cannot hold {} bytes",
                total_chunks, self.max_chunk_bytes, total_size
            )));
        }
        Ok(())
    }

    fn ensure_open(session: &UploadSession) -> Result<()> {
        if session.is_closed() {
            Err(TelestoreError::Conflict(format!(
                "upload session {} is already being completed",
                session.session_id()
            )))
        } else {
            Ok(())
        }
    }

    /// Session from memory, or rebuilt from its manifest on disk.
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRef>> {
        if let Some(session) = self.sessions.read().await.get(session_id) {
            return Ok(Some(session.clone()));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            return Ok(Some(session.clone()));
        }

        match self.load(session_id).await? {
            Some(session) => {
                let session = Arc::new(Mutex::new(session));
                sessions.insert(session_id.to_string(), session.clone());
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn session_or_create<F>(&self, session_id: &str, create: F) -> Result<SessionRef>
    where
        F: FnOnce() -> Result<UploadSession>,
    {
        if let Some(session) = self.lookup(session_id).await? {
            return Ok(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(session_id) {
            return Ok(session.clone());
        }

        let session = create()?;
        self.scratch.write_manifest(session.manifest()).await?;
        tracing::info!(
            session_id,
            file_name = session.file_name(),
            total_size = session.declared_total_size(),
            total_chunks = session.total_count(),
            "Upload session opened"
        );

        let session = Arc::new(Mutex::new(session));
        sessions.insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    async fn load(&self, session_id: &str) -> Result<Option<UploadSession>> {
        let Some(manifest) = self.scratch.read_manifest(session_id).await? else {
            return Ok(None);
        };
        let chunks = self.scratch.list_chunks(session_id).await?;
        let session = UploadSession::restore(manifest, chunks);
        tracing::info!(
            session_id,
            received = session.received_count(),
            total = session.total_count(),
            "Upload session restored from disk"
        );
        Ok(Some(session))
    }
}

fn elapsed_since(at: chrono::DateTime<Utc>) -> Duration {
    (Utc::now() - at).to_std().unwrap_or(Duration::ZERO)
}

fn dir_age(path: &std::path::Path) -> Duration {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KB: u64 = 1024;

    fn create_receiver() -> (ChunkReceiver, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let scratch = ScratchStore::new(temp_dir.path()).unwrap();
        (ChunkReceiver::new(scratch, 4 * KB, 1024 * KB), temp_dir)
    }

    fn chunk<'a>(session_id: &'a str, index: u32, bytes: &'a [u8]) -> ChunkUpload<'a> {
        ChunkUpload {
            session_id,
            chunk_index: index,
            total_chunks: 3,
            file_name: "data.bin",
            total_size: Some(9),
            bytes,
        }
    }

    #[tokio::test]
    async fn test_store_chunks_until_complete() {
        let (receiver, _temp) = create_receiver();

        let s = receiver.store_chunk(chunk("s1", 2, b"ccc")).await.unwrap();
        assert_eq!((s.received_count, s.total_count, s.complete), (1, 3, false));

        receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();
        let s = receiver.store_chunk(chunk("s1", 1, b"bbb")).await.unwrap();
        assert!(s.complete);
    }

    #[tokio::test]
    async fn test_store_chunk_is_idempotent() {
        let (receiver, _temp) = create_receiver();

        receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();
        let again = receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();

        assert_eq!(again.received_count, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_index_does_not_mutate() {
        let (receiver, _temp) = create_receiver();

        receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();
        let result = receiver.store_chunk(chunk("s1", 3, b"ddd")).await;

        assert!(matches!(result, Err(TelestoreError::Validation(_))));
        assert!(!receiver.scratch().chunk_path("s1", 3).exists());
        let chunks = receiver.scratch().list_chunks("s1").await.unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_chunk_rejected() {
        let (receiver, _temp) = create_receiver();
        let big = vec![0u8; (4 * KB + 1) as usize];

        let result = receiver.store_chunk(chunk("s1", 0, &big)).await;
        assert!(matches!(result, Err(TelestoreError::Validation(_))));
        assert_eq!(receiver.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_chunk_requires_total_size() {
        let (receiver, _temp) = create_receiver();
        let mut upload = chunk("s1", 0, b"aaa");
        upload.total_size = None;

        assert!(receiver.store_chunk(upload).await.is_err());

        receiver.init("s1", "data.bin", 3, 9).await.unwrap();
        assert!(receiver.store_chunk(upload).await.is_ok());
    }

    #[tokio::test]
    async fn test_init_is_idempotent_but_rejects_redeclaration() {
        let (receiver, _temp) = create_receiver();

        receiver.init("s1", "data.bin", 3, 9).await.unwrap();
        receiver.init("s1", "data.bin", 3, 9).await.unwrap();

        let result = receiver.init("s1", "data.bin", 4, 9).await;
        assert!(matches!(result, Err(TelestoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_init_rejects_impossible_layout() {
        let (receiver, _temp) = create_receiver();

        // 2 chunks of at most 4KB cannot hold 9KB
        assert!(receiver.init("s1", "a", 2, 9 * KB).await.is_err());
        // Larger than the file ceiling
        assert!(receiver.init("s2", "a", 1000, 2048 * KB).await.is_err());
        assert!(receiver.init("../x", "a", 1, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_incomplete_session() {
        let (receiver, _temp) = create_receiver();

        receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();
        receiver.store_chunk(chunk("s1", 1, b"bbb")).await.unwrap();

        let result = receiver.claim("s1").await;
        assert!(matches!(
            result,
            Err(TelestoreError::IncompleteSession { received: 2, total: 3 })
        ));
    }

    #[tokio::test]
    async fn test_claim_blocks_chunks_until_release() {
        let (receiver, _temp) = create_receiver();
        for i in 0..3 {
            receiver.store_chunk(chunk("s1", i, b"xxx")).await.unwrap();
        }

        receiver.claim("s1").await.unwrap();
        assert!(matches!(
            receiver.claim("s1").await,
            Err(TelestoreError::Conflict(_))
        ));
        assert!(receiver.store_chunk(chunk("s1", 0, b"yyy")).await.is_err());

        receiver.release("s1").await;
        assert!(receiver.claim("s1").await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_unknown_session() {
        let (receiver, _temp) = create_receiver();
        assert!(matches!(
            receiver.claim("missing").await,
            Err(TelestoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_removes_scratch() {
        let (receiver, _temp) = create_receiver();
        receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();

        assert!(receiver.cancel("s1").await.unwrap());
        assert!(!receiver.scratch().session_dir("s1").exists());
        assert_eq!(receiver.session_count().await, 0);

        assert!(!receiver.cancel("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_session_restored_after_restart() {
        let temp_dir = TempDir::new().unwrap();

        {
            let receiver =
                ChunkReceiver::new(ScratchStore::new(temp_dir.path()).unwrap(), 4 * KB, 1024 * KB);
            receiver.store_chunk(chunk("s1", 0, b"aaa")).await.unwrap();
            receiver.store_chunk(chunk("s1", 2, b"ccc")).await.unwrap();
        }

        let receiver =
            ChunkReceiver::new(ScratchStore::new(temp_dir.path()).unwrap(), 4 * KB, 1024 * KB);
        let status = receiver.store_chunk(chunk("s1", 1, b"bbb")).await.unwrap();

        assert_eq!(status.received_count, 3);
        assert!(status.complete);
    }

    #[tokio::test]
    async fn test_sweep_stale_sessions() {
        let (receiver, _temp) = create_receiver();
        receiver.store_chunk(chunk("old", 0, b"aaa")).await.unwrap();

        assert_eq!(receiver.sweep_stale(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(receiver.scratch().session_dir("old").exists());

        assert_eq!(receiver.sweep_stale(Duration::ZERO).await.unwrap(), 1);
        assert!(!receiver.scratch().session_dir("old").exists());
        assert_eq!(receiver.session_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_one_index() {
        let (receiver, _temp) = create_receiver();
        let receiver = Arc::new(receiver);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    let bytes: &[u8] = if i % 2 == 0 { b"aaa" } else { b"bbb" };
                    receiver.store_chunk(chunk("s1", 0, bytes)).await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().received_count, 1);
        }

        let content = tokio::fs::read(receiver.scratch().chunk_path("s1", 0))
            .await
            .unwrap();
        assert!(content == b"aaa" || content == b"bbb");

        let mut entries = tokio::fs::read_dir(receiver.scratch().session_dir("s1"))
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["000000.part", "manifest.json"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_claim_racing_chunk_writes() {
        for _ in 0..20 {
            let (receiver, _temp) = create_receiver();
            let receiver = Arc::new(receiver);
            for i in 0..3 {
                receiver.store_chunk(chunk("s1", i, b"xxx")).await.unwrap();
            }

            let writers: Vec<_> = (0..4)
                .map(|_| {
                    let receiver = Arc::clone(&receiver);
                    tokio::spawn(async move {
                        for _ in 0..10 {
                            match receiver.store_chunk(chunk("s1", 2, b"xxx")).await {
                                Ok(_) | Err(TelestoreError::Conflict(_)) => {}
                                Err(e) => panic!("unexpected error: {e}"),
                            }
                        }
                    })
                })
                .collect();

            let claimed = receiver.claim("s1").await.unwrap();
            for writer in writers {
                writer.await.unwrap();
            }

            assert_eq!(claimed.received_count(), 3);
            let on_disk = receiver.scratch().list_chunks("s1").await.unwrap();
            assert_eq!(on_disk.len(), 3);
            assert_eq!(on_disk.get(&2), Some(&3));
        }
    }
}
