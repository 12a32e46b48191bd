//! API handlers and shared application state.

pub mod download;
pub mod health;
pub mod upload;

pub use download::*;
pub use health::*;
pub use upload::*;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::credentials::{CredentialAuthority, CredentialCache};
use crate::download::Downloader;
use crate::remote::{FastStore, SessionStore};
use crate::tier::TierPolicy;
use crate::transfer::{EngineConfig, HttpNotifier, ProgressLedger, TransferEngine};
use crate::upload::{ChunkReceiver, Reassembler, ScratchStore};
use crate::web::middleware::DownloadTokenState;
use crate::Result;

/// Retention settings for the background sweeper.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// How long terminal jobs stay pollable.
    pub jobs: Duration,
    /// How long idle upload sessions keep their scratch data.
    pub sessions: Duration,
    /// Sweep interval.
    pub interval: Duration,
}

/// Application state shared by all handlers.
pub struct AppState {
    /// Chunk intake.
    pub receiver: ChunkReceiver,
    /// Chunk concatenation.
    pub reassembler: Reassembler,
    /// Detached transfers.
    pub engine: Arc<TransferEngine>,
    /// Job progress.
    pub ledger: Arc<ProgressLedger>,
    /// Per-principal credentials.
    pub credentials: CredentialCache,
    /// Range-serving downloads.
    pub downloader: Downloader,
    /// Fast API, used directly by single-request uploads.
    pub fast: Arc<dyn FastStore>,
    /// Size tiers.
    pub tiers: TierPolicy,
    /// Local download-token verifier, when a secret is configured.
    pub download_tokens: Option<DownloadTokenState>,
    /// Per-chunk ceiling in bytes.
    pub max_chunk_bytes: u64,
    /// Sweeper settings.
    pub retention: Retention,
}

impl AppState {
    /// Wire every component from `config`.
    pub fn new(
        config: &Config,
        authority: Arc<dyn CredentialAuthority>,
        fast: Arc<dyn FastStore>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let transfer = &config.transfer;
        let scratch = ScratchStore::new(&transfer.scratch_path)?;
        let engine_config = EngineConfig::from_transfer(transfer);
        let tiers = engine_config.tiers;

        let ledger = Arc::new(ProgressLedger::new());
        let mut engine = TransferEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&fast),
            Arc::clone(&sessions),
            engine_config.clone(),
        );
        if transfer.notify_backend {
            let notifier = HttpNotifier::new(
                &config.credentials.backend_url,
                Duration::from_secs(config.credentials.request_timeout_secs),
            )?;
            engine = engine.with_notifier(Arc::new(notifier));
        }

        let downloader = Downloader::new(
            Arc::clone(&fast),
            sessions,
            tiers,
            engine_config.part_size,
        )
        .with_resolve_retry(engine_config.resolve_attempts, engine_config.resolve_backoff);

        let secret = &config.credentials.download_token_secret;
        let download_tokens = (!secret.is_empty()).then(|| DownloadTokenState::new(secret));

        Ok(Self {
            receiver: ChunkReceiver::new(
                scratch.clone(),
                transfer.max_chunk_bytes(),
                transfer.max_file_bytes(),
            ),
            reassembler: Reassembler::new(scratch),
            engine: Arc::new(engine),
            ledger,
            credentials: CredentialCache::new(
                authority,
                Duration::from_secs(config.credentials.ttl_secs),
            ),
            downloader,
            fast,
            tiers,
            download_tokens,
            max_chunk_bytes: transfer.max_chunk_bytes(),
            retention: Retention {
                jobs: Duration::from_secs(transfer.job_retention_secs),
                sessions: Duration::from_secs(transfer.session_retention_secs),
                interval: Duration::from_secs(transfer.sweep_interval_secs.max(1)),
            },
        })
    }

    /// Run one retention sweep over jobs, upload sessions and cached credentials.
    pub async fn sweep(&self) {
        let jobs = self.ledger.sweep(self.retention.jobs).await;
        if jobs > 0 {
            tracing::info!(deleted_count = jobs, "Removed finished transfer jobs");
        }

        match self.receiver.sweep_stale(self.retention.sessions).await {
            Ok(0) => tracing::debug!("No stale upload sessions to clean up"),
            Ok(count) => tracing::info!(deleted_count = count, "Removed stale upload sessions"),
            Err(e) => tracing::warn!(error = %e, "Failed to sweep upload sessions"),
        }

        let credentials = self.credentials.sweep_expired().await;
        if credentials > 0 {
            tracing::info!(deleted_count = credentials, "Removed expired credentials");
        }
    }
}
