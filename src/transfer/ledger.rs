//! Progress ledger: per-job transfer state read by polling clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::remote::UploadReceipt;
use crate::tier::Tier;
use crate::{Result, TelestoreError};

/// Transfer job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Bytes are still moving.
    Uploading,
    /// Stored remotely; identifiers are set.
    Completed,
    /// Gave up; `error` is set.
    Failed,
}

impl JobStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Uploading)
    }
}

/// Snapshot of one transfer job.
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    /// Job identifier.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Progress, 0 to 100.
    pub percent: u8,
    /// Failure message, only when failed.
    pub error: Option<String>,
    /// Remote message id, only when completed.
    pub remote_message_id: Option<i64>,
    /// Remote file id, only when completed.
    pub remote_file_id: Option<String>,
    /// File being transferred.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
    /// Protocol used for the transfer.
    pub tier: Tier,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

/// In-memory job table.
///
/// Jobs are only mutated through the [`JobWriter`] returned by
/// [`ProgressLedger::create`]; everything else reads snapshots.
#[derive(Default)]
pub struct ProgressLedger {
    jobs: RwLock<HashMap<String, TransferJob>>,
}

impl ProgressLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `uploading` state and hand out its writer.
    pub async fn create(
        self: &Arc<Self>,
        job_id: &str,
        file_name: &str,
        size: u64,
        tier: Tier,
    ) -> Result<JobWriter> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job_id) {
            return Err(TelestoreError::Conflict(format!("job {job_id} already exists")));
        }

        jobs.insert(
            job_id.to_string(),
            TransferJob {
                job_id: job_id.to_string(),
                status: JobStatus::Uploading,
                percent: 0,
                error: None,
                remote_message_id: None,
                remote_file_id: None,
                file_name: file_name.to_string(),
                size,
                tier,
                created_at: Utc::now(),
                finished_at: None,
            },
        );

        Ok(JobWriter {
            ledger: Arc::clone(self),
            job_id: job_id.to_string(),
        })
    }

    /// Record a transfer that finished synchronously.
    ///
    /// Fails with `Conflict` if the id is already taken, finished or not.
    pub async fn record_completed(
        &self,
        job_id: &str,
        file_name: &str,
        size: u64,
        receipt: &UploadReceipt,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job_id) {
            return Err(TelestoreError::Conflict(format!("job {job_id} already exists")));
        }

        let now = Utc::now();
        jobs.insert(
            job_id.to_string(),
            TransferJob {
                job_id: job_id.to_string(),
                status: JobStatus::Completed,
                percent: 100,
                error: None,
                remote_message_id: Some(receipt.message_id),
                remote_file_id: Some(receipt.file_id.clone()),
                file_name: file_name.to_string(),
                size,
                tier: Tier::Small,
                created_at: now,
                finished_at: Some(now),
            },
        );
        Ok(())
    }

    /// Drop a finished job so its id can be used by a new transfer.
    ///
    /// Returns `false` and leaves the job alone if it is still running.
    pub async fn retire(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get(job_id) {
            Some(job) if !job.status.is_terminal() => false,
            Some(_) => {
                jobs.remove(job_id);
                tracing::debug!(job_id, "Retired finished job");
                true
            }
            None => true,
        }
    }

    /// Snapshot of a job.
    pub async fn get(&self, job_id: &str) -> Option<TransferJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    pub async fn sweep(&self, retention: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(retention) {
            Ok(retention) => Utc::now() - retention,
            Err(_) => return 0,
        };

        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| match job.finished_at {
            Some(finished) => finished > cutoff,
            None => true,
        });
        before - jobs.len()
    }

    /// Number of jobs held.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Whether the ledger holds no jobs.
    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Apply `f` to a job that is still uploading. Terminal jobs are left untouched.
    async fn update<F>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TransferJob),
    {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                f(job);
                true
            }
            Some(_) => {
                tracing::warn!(job_id, "Ignoring update to a finished job");
                false
            }
            None => false,
        }
    }
}

/// Exclusive write access to one job.
///
/// Not `Clone`: exactly one writer exists per job. The terminal
/// transitions consume it.
pub struct JobWriter {
    ledger: Arc<ProgressLedger>,
    job_id: String,
}

impl JobWriter {
    /// Job this writer owns.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Raise the percentage. Lower or equal values are ignored.
    pub async fn advance(&self, percent: u8) -> bool {
        let percent = percent.min(100);
        self.ledger
            .update(&self.job_id, |job| {
                if percent > job.percent {
                    job.percent = percent;
                }
            })
            .await
    }

    /// Move to `completed` with the remote identifiers.
    pub async fn complete(self, receipt: &UploadReceipt) {
        self.ledger
            .update(&self.job_id, |job| {
                job.status = JobStatus::Completed;
                job.percent = 100;
                job.remote_message_id = Some(receipt.message_id);
                job.remote_file_id = Some(receipt.file_id.clone());
                job.finished_at = Some(Utc::now());
            })
            .await;
    }

    /// Move to `failed` with an error message.
    pub async fn fail(self, error: impl Into<String>) {
        let error = error.into();
        self.ledger
            .update(&self.job_id, |job| {
                job.status = JobStatus::Failed;
                job.error = Some(error);
                job.finished_at = Some(Utc::now());
            })
            .await;
    }
}
