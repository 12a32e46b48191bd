//! Response DTOs for the transfer API.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::tier::Tier;
use crate::transfer::{JobStatus, TransferJob};
use crate::upload::ChunkStatus;

/// Result of declaring a session.
#[derive(Debug, Serialize, ToSchema)]
pub struct InitUploadResponse {
    /// Always true.
    pub success: bool,
    /// Session id.
    pub session_id: String,
    /// Chunks already stored (non-zero when resuming).
    pub received_count: u32,
    /// Declared chunk count.
    pub total_count: u32,
}

/// Result of storing one chunk.
#[derive(Debug, Serialize, ToSchema)]
pub struct ChunkUploadResponse {
    /// Always true.
    pub success: bool,
    /// Index that was stored.
    pub chunk_index: u32,
    /// Distinct chunks stored so far.
    pub received_count: u32,
    /// Declared chunk count.
    pub total_count: u32,
    /// Whether every chunk is present.
    pub complete: bool,
}

impl ChunkUploadResponse {
    /// Build from the receiver's status after storing `chunk_index`.
    pub fn new(chunk_index: u32, status: ChunkStatus) -> Self {
        Self {
            success: true,
            chunk_index,
            received_count: status.received_count,
            total_count: status.total_count,
            complete: status.complete,
        }
    }
}

/// Result of completing a session.
#[derive(Debug, Serialize, ToSchema)]
pub struct CompleteUploadResponse {
    /// Always true.
    pub success: bool,
    /// Job to poll.
    pub job_id: String,
    /// Path of the progress endpoint for this job.
    pub poll_at: String,
}

impl CompleteUploadResponse {
    /// Response pointing at the progress endpoint for `job_id`.
    pub fn for_job(job_id: &str) -> Self {
        Self {
            success: true,
            job_id: job_id.to_string(),
            poll_at: format!("/upload-progress/{job_id}"),
        }
    }
}

/// Result of cancelling a session.
#[derive(Debug, Serialize, ToSchema)]
pub struct CancelUploadResponse {
    /// Always true.
    pub success: bool,
    /// Whether scratch data was found and deleted.
    pub chunks_deleted: bool,
    /// Whether a running transfer was asked to stop.
    pub transfer_cancelled: bool,
}

/// Progress of a transfer job.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProgressResponse {
    /// Job id.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Progress, 0 to 100.
    pub percent: u8,
    /// Failure message.
    pub error: Option<String>,
    /// Remote message id once completed.
    pub remote_message_id: Option<i64>,
    /// Remote file id once completed.
    pub remote_file_id: Option<String>,
    /// File name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Protocol used.
    pub tier: Tier,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<TransferJob> for ProgressResponse {
    fn from(job: TransferJob) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            percent: job.percent,
            error: job.error,
            remote_message_id: job.remote_message_id,
            remote_file_id: job.remote_file_id,
            file_name: job.file_name,
            size: job.size,
            tier: job.tier,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

/// Result of a direct upload.
#[derive(Debug, Serialize, ToSchema)]
pub struct DirectUploadResponse {
    /// Always true.
    pub success: bool,
    /// Remote message id.
    pub remote_message_id: i64,
    /// Remote file id.
    pub remote_file_id: String,
    /// Stored file name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Job id the result was recorded under, if one was given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Health check.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Server time.
    pub timestamp: DateTime<Utc>,
}
