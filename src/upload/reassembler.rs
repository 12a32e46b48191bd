//! Reassembly of stored chunks into one file.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::scratch::ScratchStore;
use super::session::UploadSession;
use crate::{Result, TelestoreError};

/// A reassembled file waiting to be transferred.
#[derive(Debug, Clone)]
pub struct AssembledFile {
    /// Session the file came from.
    pub session_id: String,
    /// Original file name.
    pub file_name: String,
    /// Location on local disk.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// Concatenates a session's chunks in index order.
#[derive(Debug, Clone)]
pub struct Reassembler {
    scratch: ScratchStore,
}

impl Reassembler {
    /// Create a reassembler over `scratch`.
    pub fn new(scratch: ScratchStore) -> Self {
        Self { scratch }
    }

    /// Reassemble a complete session.
    ///
    /// Completeness and the declared size are checked against the session
    /// record before any file is opened. Chunks stay on disk until the
    /// assembled file is in place, so a failed attempt can be retried.
    pub async fn reassemble(&self, session: &UploadSession) -> Result<AssembledFile> {
        session.ensure_complete()?;

        let session_id = session.session_id();
        let received = session.received_bytes();
        if received != session.declared_total_size() {
            return Err(TelestoreError::Validation(format!(
                "chunks hold {} bytes but {} were declared",
                received,
                session.declared_total_size()
            )));
        }

        let path = self.scratch.assembled_path(session_id);
        let tmp = path.with_extension("bin.partial");

        match self.concatenate(session, &tmp).await {
            Ok(size) => {
                fs::rename(&tmp, &path).await?;
                if let Err(e) = self.scratch.remove_session(session_id).await {
                    tracing::warn!(session_id, error = %e, "Failed to remove reassembled chunks");
                }

                tracing::info!(session_id, bytes = size, "Reassembled upload");
                Ok(AssembledFile {
                    session_id: session_id.to_string(),
                    file_name: session.file_name().to_string(),
                    path,
                    size,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn concatenate(&self, session: &UploadSession, out_path: &Path) -> Result<u64> {
        let session_id = session.session_id();
        let mut out = fs::File::create(out_path).await?;
        let mut written = 0u64;

        for index in 0..session.total_count() {
            let chunk_path = self.scratch.chunk_path(session_id, index);
            let mut chunk = fs::File::open(&chunk_path).await.map_err(|e| {
                TelestoreError::Io(std::io::Error::new(
                    e.kind(),
                    format!("chunk {index} of session {session_id} unreadable: {e}"),
                ))
            })?;

            let copied = tokio::io::copy(&mut chunk, &mut out).await?;
            let expected = session.chunk_sizes().get(&index).copied().unwrap_or(0);
            if copied != expected {
                return Err(TelestoreError::Validation(format!(
                    "chunk {index} changed on disk: expected {expected} bytes, found {copied}"
                )));
            }

            written += copied;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(written)
    }
}
