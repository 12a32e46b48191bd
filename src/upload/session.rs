//! Upload session state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, TelestoreError};

/// Immutable declaration of an upload session, persisted as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManifest {
    /// Client-generated session id.
    pub session_id: String,
    /// Original file name.
    pub file_name: String,
    /// Declared size of the whole file in bytes.
    pub declared_total_size: u64,
    /// Declared number of chunks.
    pub declared_chunk_count: u32,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Last time a chunk was stored.
    pub updated_at: DateTime<Utc>,
}

/// Receive state reported after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStatus {
    /// Distinct chunks stored so far.
    pub received_count: u32,
    /// Declared chunk count.
    pub total_count: u32,
    /// Whether every declared chunk is present.
    pub complete: bool,
}

/// An upload session: its declaration plus the chunks received so far.
#[derive(Debug, Clone)]
pub struct UploadSession {
    manifest: SessionManifest,
    received: BTreeMap<u32, u64>,
    closed: bool,
}

impl UploadSession {
    /// Create a new, empty session.
    pub fn new(
        session_id: &str,
        file_name: &str,
        declared_total_size: u64,
        declared_chunk_count: u32,
    ) -> Result<Self> {
        if declared_chunk_count == 0 {
            return Err(TelestoreError::Validation(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        if file_name.trim().is_empty() {
            return Err(TelestoreError::Validation(
                "file_name must not be empty".to_string(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            manifest: SessionManifest {
                session_id: session_id.to_string(),
                file_name: file_name.to_string(),
                declared_total_size,
                declared_chunk_count,
                created_at: now,
                updated_at: now,
            },
            received: BTreeMap::new(),
            closed: false,
        })
    }

    /// Rebuild a session from its manifest and the chunks found on disk.
    ///
    /// Chunk files with an index outside the declaration are ignored.
    pub fn restore(manifest: SessionManifest, on_disk: BTreeMap<u32, u64>) -> Self {
        let count = manifest.declared_chunk_count;
        Self {
            manifest,
            received: on_disk.into_iter().filter(|(i, _)| *i < count).collect(),
            closed: false,
        }
    }

    /// The persisted declaration.
    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }

    /// Session id.
    pub fn session_id(&self) -> &str {
        &self.manifest.session_id
    }

    /// File name.
    pub fn file_name(&self) -> &str {
        &self.manifest.file_name
    }

    /// Declared chunk count.
    pub fn total_count(&self) -> u32 {
        self.manifest.declared_chunk_count
    }

    /// Declared file size.
    pub fn declared_total_size(&self) -> u64 {
        self.manifest.declared_total_size
    }

    /// Distinct chunks stored so far.
    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Sum of the stored chunk sizes.
    pub fn received_bytes(&self) -> u64 {
        self.received.values().sum()
    }

    /// Size of each stored chunk, by index.
    pub fn chunk_sizes(&self) -> &BTreeMap<u32, u64> {
        &self.received
    }

    /// Whether every declared chunk is present.
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_count()
    }

    /// Whether the session was claimed for completion or cancelled.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn set_closed(&mut self, closed: bool) {
        self.closed = closed;
    }

    /// Check that a chunk call agrees with the declaration.
    pub fn check_chunk(&self, index: u32, total_chunks: u32, total_size: Option<u64>) -> Result<()> {
        if total_chunks != self.total_count() {
            return Err(TelestoreError::Validation(format!(
                "total_chunks {} does not match the declared {}",
                total_chunks,
                self.total_count()
            )));
        }
        if let Some(size) = total_size {
            if size != self.declared_total_size() {
                return Err(TelestoreError::Validation(format!(
                    "total_size {} does not match the declared {}",
                    size,
                    self.declared_total_size()
                )));
            }
        }
        if index >= self.total_count() {
            return Err(TelestoreError::Validation(format!(
                "chunk_index {} out of range (total_chunks {})",
                index,
                self.total_count()
            )));
        }
        Ok(())
    }

    /// Record a stored chunk. Re-recording an index replaces its size.
    pub fn record_chunk(&mut self, index: u32, size: u64) {
        self.received.insert(index, size);
        self.manifest.updated_at = Utc::now();
    }

    /// Forget chunks that are missing on disk or have a different size.
    ///
    /// Returns how many were forgotten.
    pub fn retain_on_disk(&mut self, on_disk: &BTreeMap<u32, u64>) -> usize {
        let before = self.received.len();
        self.received
            .retain(|index, size| on_disk.get(index) == Some(size));
        before - self.received.len()
    }

    /// Current receive state.
    pub fn status(&self) -> ChunkStatus {
        ChunkStatus {
            received_count: self.received_count(),
            total_count: self.total_count(),
            complete: self.is_complete(),
        }
    }

    /// Fail with `IncompleteSession` unless every chunk is present.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(TelestoreError::IncompleteSession {
                received: self.received_count(),
                total: self.total_count(),
            })
        }
    }
}
