//! Detached transfer of reassembled files to the remote store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::ledger::{JobWriter, ProgressLedger};
use super::notify::{UploadNotice, UploadNotifier};
use crate::config::TransferConfig;
use crate::credentials::CredentialsRecord;
use crate::remote::{
    resolve_with_retry, FastStore, RemoteSession, SessionStore, UploadReceipt, UploadedFile,
};
use crate::tier::{Tier, TierPolicy};
use crate::upload::AssembledFile;
use crate::{Result, TelestoreError};

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size tier thresholds.
    pub tiers: TierPolicy,
    /// Part size for session uploads.
    pub part_size: usize,
    /// Ceiling for one transfer.
    pub timeout: Duration,
    /// Channel resolution attempts.
    pub resolve_attempts: u32,
    /// Linear backoff step between resolution attempts.
    pub resolve_backoff: Duration,
}

impl EngineConfig {
    /// Build from the `[transfer]` section.
    pub fn from_transfer(config: &TransferConfig) -> Self {
        Self {
            tiers: TierPolicy::new(
                config.upload_small_limit_bytes(),
                config.download_small_limit_bytes(),
            ),
            part_size: config.internal_chunk_bytes(),
            timeout: config.timeout(),
            resolve_attempts: config.resolve_attempts.max(1),
            resolve_backoff: Duration::from_millis(config.resolve_backoff_ms),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_transfer(&TransferConfig::default())
    }
}

/// Pushes files to the remote store from detached tasks.
///
/// [`begin_transfer`](Self::begin_transfer) registers the job and returns
/// at once; the spawned task is the job's only writer and reports every
/// outcome through the [`ProgressLedger`].
pub struct TransferEngine {
    ledger: Arc<ProgressLedger>,
    fast: Arc<dyn FastStore>,
    sessions: Arc<dyn SessionStore>,
    notifier: Option<Arc<dyn UploadNotifier>>,
    config: EngineConfig,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl TransferEngine {
    /// Create an engine writing to `ledger`.
    pub fn new(
        ledger: Arc<ProgressLedger>,
        fast: Arc<dyn FastStore>,
        sessions: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            fast,
            sessions,
            notifier: None,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Report completed transfers to `notifier`.
    pub fn with_notifier(mut self, notifier: Arc<dyn UploadNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// The ledger this engine writes to.
    pub fn ledger(&self) -> &Arc<ProgressLedger> {
        &self.ledger
    }

    /// Engine tunables.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start transferring `file` under `job_id` and return immediately.
    ///
    /// Fails only if a job with this id already exists.
    pub async fn begin_transfer(
        self: &Arc<Self>,
        job_id: &str,
        file: AssembledFile,
        credentials: CredentialsRecord,
    ) -> Result<()> {
        let tier = self.config.tiers.for_upload(file.size);
        let writer = self
            .ledger
            .create(job_id, &file.file_name, file.size, tier)
            .await?;

        let token = CancellationToken::new();
        self.running
            .lock()
            .await
            .insert(job_id.to_string(), token.clone());

        tracing::info!(
            job_id,
            file_name = %file.file_name,
            bytes = file.size,
            tier = ?tier,
            "Transfer started"
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(writer, file, credentials, token).await;
        });
        Ok(())
    }

    /// Request cancellation of a running job.
    ///
    /// Returns `false` if no such job is running.
    pub async fn cancel(&self, job_id: &str) -> bool {
        match self.running.lock().await.get(job_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(job_id, "Transfer cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Number of transfers in flight.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn run(
        self: Arc<Self>,
        writer: JobWriter,
        file: AssembledFile,
        credentials: CredentialsRecord,
        token: CancellationToken,
    ) {
        let job_id = writer.job_id().to_string();
        let work = AssertUnwindSafe(self.transfer(&writer, &file, &credentials, &token)).catch_unwind();

        let outcome = match tokio::time::timeout(self.config.timeout, work).await {
            Err(_) => Err(TelestoreError::Timeout(self.config.timeout.as_secs())),
            Ok(Err(_)) => Err(TelestoreError::RemoteStore(
                "transfer task panicked".to_string(),
            )),
            Ok(Ok(result)) => result,
        };

        self.running.lock().await.remove(&job_id);
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to delete reassembled file");
        }

        match outcome {
            Ok(receipt) => {
                writer.complete(&receipt).await;
                tracing::info!(
                    job_id = %job_id,
                    message_id = receipt.message_id,
                    file_id = %receipt.file_id,
                    "Transfer completed"
                );
                self.notify(&file, &credentials, &receipt).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Transfer failed");
                writer.fail(e.to_string()).await;
            }
        }
    }

    async fn transfer(
        &self,
        writer: &JobWriter,
        file: &AssembledFile,
        credentials: &CredentialsRecord,
        token: &CancellationToken,
    ) -> Result<UploadReceipt> {
        match self.config.tiers.for_upload(file.size) {
            Tier::Small => self.send_small(file, credentials, token).await,
            Tier::Large => self.send_large(writer, file, credentials, token).await,
        }
    }

    /// One call with the whole buffer; the percentage jumps straight to 100.
    async fn send_small(
        &self,
        file: &AssembledFile,
        credentials: &CredentialsRecord,
        token: &CancellationToken,
    ) -> Result<UploadReceipt> {
        let bytes = Bytes::from(tokio::fs::read(&file.path).await?);

        tokio::select! {
            _ = token.cancelled() => Err(TelestoreError::Cancelled),
            result = self.fast.send_document(credentials, &file.file_name, bytes) => result,
        }
    }

    async fn send_large(
        &self,
        writer: &JobWriter,
        file: &AssembledFile,
        credentials: &CredentialsRecord,
        token: &CancellationToken,
    ) -> Result<UploadReceipt> {
        let mut session = self.sessions.connect(credentials).await?;
        let result = self
            .stream_parts(session.as_mut(), writer, file, credentials, token)
            .await;
        session.disconnect().await;
        result
    }

    async fn stream_parts(
        &self,
        session: &mut dyn RemoteSession,
        writer: &JobWriter,
        file: &AssembledFile,
        credentials: &CredentialsRecord,
        token: &CancellationToken,
    ) -> Result<UploadReceipt> {
        let channel = tokio::select! {
            _ = token.cancelled() => return Err(TelestoreError::Cancelled),
            resolved = resolve_with_retry(
                session,
                credentials.destination_channel_id,
                self.config.resolve_attempts,
                self.config.resolve_backoff,
            ) => resolved?,
        };

        let upload_key = uuid::Uuid::new_v4().as_u64_pair().0 as i64;
        let mut source = tokio::fs::File::open(&file.path).await?;
        let mut buffer = vec![0u8; self.config.part_size];
        let mut sent = 0u64;
        let mut part = 0u32;
        let mut logged_decile = 0u64;

        loop {
            if token.is_cancelled() {
                return Err(TelestoreError::Cancelled);
            }

            let n = read_full(&mut source, &mut buffer).await?;
            if n == 0 {
                break;
            }

            session
                .upload_part(upload_key, part, Bytes::copy_from_slice(&buffer[..n]))
                .await?;
            part += 1;
            sent += n as u64;

            let percent = percent_of(sent, file.size);
            writer.advance(percent).await;

            let decile = u64::from(percent) / 10;
            if decile > logged_decile {
                logged_decile = decile;
                tracing::info!(job_id = writer.job_id(), percent, bytes = sent, "Transfer progress");
            }
        }

        if sent != file.size {
            return Err(TelestoreError::RemoteStore(format!(
                "read {} bytes from a {} byte file",
                sent, file.size
            )));
        }
        if token.is_cancelled() {
            return Err(TelestoreError::Cancelled);
        }

        session
            .send_uploaded(
                &channel,
                UploadedFile {
                    upload_key,
                    parts: part,
                    file_name: file.file_name.clone(),
                    size: file.size,
                },
            )
            .await
    }

    async fn notify(&self, file: &AssembledFile, credentials: &CredentialsRecord, receipt: &UploadReceipt) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let notice = UploadNotice {
            user_id: credentials.user_id.clone(),
            file_name: file.file_name.clone(),
            message_id: receipt.message_id,
            file_id: receipt.file_id.clone(),
            size: file.size,
            mime_type: mime_guess::from_path(&file.file_name)
                .first_or_octet_stream()
                .to_string(),
        };

        if let Err(e) = notifier.notify(&notice).await {
            tracing::warn!(
                session_id = %file.session_id,
                error = %e,
                "Failed to notify backend of completed upload"
            );
        }
    }
}

/// `floor(sent * 100 / total)`, with an empty file counting as done.
fn percent_of(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((u128::from(sent) * 100) / u128::from(total)).min(100) as u8
}

/// Fill `buf` from `reader`, stopping early only at end of file.
async fn read_full<R: AsyncReadExt + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
