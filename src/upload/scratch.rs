//! Durable scratch storage for upload chunks.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── sessions/
//! │   └── ab/                      (first two characters of the session id)
//! │       └── ab12cd.../
//! │           ├── manifest.json
//! │           ├── 000000.part
//! │           └── 000001.part
//! └── assembled/
//!     └── ab12cd....bin
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::session::SessionManifest;
use crate::{Result, TelestoreError};

const MANIFEST_FILE: &str = "manifest.json";
const PART_EXT: &str = "part";

/// Maximum session id length.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Check that a session id is safe to use as a directory name.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(TelestoreError::Validation(format!(
            "session_id must be 1-{MAX_SESSION_ID_LEN} characters of [A-Za-z0-9_-]"
        )))
    }
}

/// Scratch storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct ScratchStore {
    base_path: PathBuf,
}

impl ScratchStore {
    /// Create a store, creating the base directories if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join("sessions"))?;
        std::fs::create_dir_all(base_path.join("assembled"))?;

        Ok(Self { base_path })
    }

    /// Get the base path of this storage.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding one session's chunks and manifest.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_path
            .join("sessions")
            .join(Self::get_shard(session_id))
            .join(session_id)
    }

    /// Path of one chunk.
    pub fn chunk_path(&self, session_id: &str, index: u32) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{index:06}.{PART_EXT}"))
    }

    /// Path of the reassembled file for a session.
    pub fn assembled_path(&self, session_id: &str) -> PathBuf {
        self.base_path
            .join("assembled")
            .join(format!("{session_id}.bin"))
    }

    /// Write a chunk atomically, replacing any earlier copy.
    pub async fn write_chunk(&self, session_id: &str, index: u32, content: &[u8]) -> Result<()> {
        self.stage_chunk(session_id, index, content).await?.commit().await
    }

    /// Write a chunk to a private temp file next to its final path.
    ///
    /// Nothing is visible under the chunk's name until the returned
    /// [`StagedChunk`] is committed.
    pub async fn stage_chunk(
        &self,
        session_id: &str,
        index: u32,
        content: &[u8],
    ) -> Result<StagedChunk> {
        let path = self.chunk_path(session_id, index);
        let tmp = write_temp(&path, content).await?;
        Ok(StagedChunk { tmp, path })
    }

    /// Write the session manifest atomically.
    pub async fn write_manifest(&self, manifest: &SessionManifest) -> Result<()> {
        let path = self.session_dir(&manifest.session_id).join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(manifest)
            .map_err(|e| TelestoreError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        write_atomic(&path, &json).await
    }

    /// Read a session manifest, `None` if the session has none.
    pub async fn read_manifest(&self, session_id: &str) -> Result<Option<SessionManifest>> {
        let path = self.session_dir(session_id).join(MANIFEST_FILE);
        match fs::read(&path).await {
            Ok(content) => serde_json::from_slice(&content).map(Some).map_err(|e| {
                TelestoreError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt manifest for session {session_id}: {e}"),
                ))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Chunks present on disk for a session, as index to size.
    pub async fn list_chunks(&self, session_id: &str) -> Result<BTreeMap<u32, u64>> {
        let mut chunks = BTreeMap::new();
        let mut entries = match fs::read_dir(self.session_dir(session_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(chunks),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PART_EXT) {
                continue;
            }
            let index = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(index) = index {
                chunks.insert(index, entry.metadata().await?.len());
            }
        }

        Ok(chunks)
    }

    /// Ids of every session with a directory on disk.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut shards = fs::read_dir(self.base_path.join("sessions")).await?;

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut sessions = fs::read_dir(shard.path()).await?;
            while let Some(session) = sessions.next_entry().await? {
                if let Some(id) = session.file_name().to_str() {
                    ids.push(id.to_string());
                }
            }
        }

        Ok(ids)
    }

    /// Delete a session's directory with everything in it.
    ///
    /// Returns `true` if the directory was deleted, `false` if it didn't exist.
    pub async fn remove_session(&self, session_id: &str) -> Result<bool> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a reassembled file.
    pub async fn remove_assembled(&self, session_id: &str) -> Result<bool> {
        remove_file(&self.assembled_path(session_id)).await
    }

    /// Remove empty shard directories.
    pub async fn cleanup_empty_dirs(&self) -> Result<usize> {
        let mut removed = 0;
        let mut shards = fs::read_dir(self.base_path.join("sessions")).await?;

        while let Some(shard) = shards.next_entry().await? {
            let path = shard.path();
            if !path.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(&path).await?;
            if entries.next_entry().await?.is_none() && fs::remove_dir(&path).await.is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Shard directory name: the first two characters of the session id.
    fn get_shard(session_id: &str) -> &str {
        if session_id.len() >= 2 {
            &session_id[..2]
        } else {
            session_id
        }
    }
}

/// A chunk written to a temp file but not yet in place.
#[derive(Debug)]
#[must_use = "a staged chunk must be committed or discarded"]
pub struct StagedChunk {
    tmp: PathBuf,
    path: PathBuf,
}

impl StagedChunk {
    /// Rename the temp file over the chunk path.
    pub async fn commit(self) -> Result<()> {
        if let Err(e) = fs::rename(&self.tmp, &self.path).await {
            let _ = fs::remove_file(&self.tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the temp file, leaving any committed copy untouched.
    pub async fn discard(self) {
        if let Err(e) = fs::remove_file(&self.tmp).await {
            tracing::debug!(path = %self.tmp.display(), error = %e, "Failed to remove staged chunk");
        }
    }
}

/// Write `content` to a uniquely named sibling of `path` and return its path.
async fn write_temp(path: &Path, content: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(tmp)
}

/// Write to a sibling temp file, then rename over `path`.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = write_temp(path, content).await?;
    StagedChunk {
        tmp,
        path: path.to_path_buf(),
    }
    .commit()
    .await
}

async fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (ScratchStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ScratchStore::new(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("abc-123_XYZ").is_ok());
        assert!(validate_session_id(&"a".repeat(128)).is_ok());

        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"a".repeat(129)).is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("a b").is_err());
    }

    #[test]
    fn test_paths_are_sharded() {
        let (store, _temp) = create_test_store();

        let dir = store.session_dir("ab12cd");
        assert!(dir.ends_with("sessions/ab/ab12cd"));
        assert!(store.chunk_path("ab12cd", 7).ends_with("ab12cd/000007.part"));
        assert!(store.assembled_path("ab12cd").ends_with("assembled/ab12cd.bin"));

        // Single character ids shard under themselves
        assert!(store.session_dir("x").ends_with("sessions/x/x"));
    }

    #[tokio::test]
    async fn test_write_chunk_overwrites() {
        let (store, _temp) = create_test_store();

        store.write_chunk("s1", 0, b"first").await.unwrap();
        store.write_chunk("s1", 0, b"second!").await.unwrap();

        let content = fs::read(store.chunk_path("s1", 0)).await.unwrap();
        assert_eq!(content, b"second!");

        let chunks = store.list_chunks("s1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[&0], 7);
    }

    #[tokio::test]
    async fn test_discarded_stage_keeps_committed_chunk() {
        let (store, _temp) = create_test_store();

        store.write_chunk("s1", 0, b"kept").await.unwrap();
        let staged = store.stage_chunk("s1", 0, b"dropped").await.unwrap();
        staged.discard().await;

        let content = fs::read(store.chunk_path("s1", 0)).await.unwrap();
        assert_eq!(content, b"kept");

        let mut entries = fs::read_dir(store.session_dir("s1")).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["000000.part"]);
    }

    #[tokio::test]
    async fn test_list_chunks_ignores_other_files() {
        let (store, _temp) = create_test_store();

        store.write_chunk("s1", 2, b"cc").await.unwrap();
        store.write_chunk("s1", 0, b"a").await.unwrap();
        fs::write(store.session_dir("s1").join("junk.tmp"), b"x")
            .await
            .unwrap();

        let chunks = store.list_chunks("s1").await.unwrap();
        assert_eq!(chunks.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn test_list_chunks_missing_session() {
        let (store, _temp) = create_test_store();
        assert!(store.list_chunks("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let (store, _temp) = create_test_store();

        store.write_chunk("s1", 0, b"a").await.unwrap();
        assert!(store.remove_session("s1").await.unwrap());
        assert!(!store.remove_session("s1").await.unwrap());
        assert!(!store.session_dir("s1").exists());

        assert_eq!(store.cleanup_empty_dirs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let (store, _temp) = create_test_store();

        store.write_chunk("alpha", 0, b"a").await.unwrap();
        store.write_chunk("beta", 0, b"b").await.unwrap();

        let mut ids = store.list_sessions().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
