//! Per-principal credential cache with TTL and stale fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use super::authority::{AuthorityError, CredentialAuthority};
use super::record::{CredentialsRecord, PrincipalId, ProofKind};
use crate::{Result, TelestoreError};

/// Default freshness window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// How long an expired session record is kept for outages.
pub const DEFAULT_MAX_STALE: Duration = Duration::from_secs(24 * 3600);

struct CachedEntry {
    record: CredentialsRecord,
    kind: ProofKind,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedEntry>>>;

/// Process-local credential cache.
///
/// Each principal has its own slot. A refresh holds the slot lock, so
/// concurrent callers for the same principal wait for one authority call
/// while other principals are unaffected.
pub struct CredentialCache {
    authority: Arc<dyn CredentialAuthority>,
    ttl: Duration,
    max_stale: Duration,
    slots: RwLock<HashMap<PrincipalId, Slot>>,
}

impl CredentialCache {
    /// Create a cache in front of `authority`.
    pub fn new(authority: Arc<dyn CredentialAuthority>, ttl: Duration) -> Self {
        Self {
            authority,
            ttl,
            max_stale: DEFAULT_MAX_STALE,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Keep expired session records for at most `max_stale` past their fetch.
    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = max_stale;
        self
    }

    /// Credentials for the principal owning `auth_proof`.
    pub async fn get_for_proof(&self, auth_proof: &str, kind: ProofKind) -> Result<CredentialsRecord> {
        let principal = PrincipalId::from_proof(auth_proof);
        self.get(&principal, auth_proof, kind).await
    }

    /// Credentials for `principal`, fetched with `auth_proof` on a miss.
    ///
    /// A fresh record is returned without contacting the authority. When
    /// the authority is unavailable an expired session record is returned
    /// instead. Download-token records never outlive their TTL, and an
    /// explicit rejection drops the record and fails.
    pub async fn get(
        &self,
        principal: &PrincipalId,
        auth_proof: &str,
        kind: ProofKind,
    ) -> Result<CredentialsRecord> {
        let slot = self.slot(principal).await;
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.record.clone());
            }
        }

        match self.authority.verify(auth_proof, kind).await {
            Ok(mut record) => {
                record.expires_at = chrono::Duration::from_std(self.ttl)
                    .ok()
                    .map(|ttl| Utc::now() + ttl);
                tracing::debug!(principal = %principal, "Fetched fresh credentials");
                *entry = Some(CachedEntry {
                    record: record.clone(),
                    kind,
                    fetched_at: Instant::now(),
                });
                Ok(record)
            }
            Err(AuthorityError::Unavailable(reason)) => match entry.as_ref() {
                Some(cached) if kind == ProofKind::Session && cached.kind == kind => {
                    tracing::warn!(
                        principal = %principal,
                        reason = %reason,
                        "Credential authority unavailable, using stale credentials"
                    );
                    Ok(cached.record.clone())
                }
                _ => {
                    *entry = None;
                    drop(entry);
                    self.forget_empty(principal).await;
                    Err(TelestoreError::Credential(format!(
                        "credential authority unavailable: {reason}"
                    )))
                }
            },
            Err(AuthorityError::Rejected(reason)) => {
                *entry = None;
                drop(entry);
                self.forget_empty(principal).await;
                Err(TelestoreError::Credential(reason))
            }
        }
    }

    /// Drop records that can no longer be served.
    ///
    /// Download-token records go once their TTL has passed; session
    /// records once they are older than the stale limit. Slots in use by a
    /// refresh are skipped. Returns how many slots were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut slots = self.slots.write().await;
        let before = slots.len();

        slots.retain(|_, slot| {
            let Ok(entry) = slot.try_lock() else {
                return true;
            };
            match entry.as_ref() {
                None => false,
                Some(cached) => {
                    let limit = match cached.kind {
                        ProofKind::DownloadToken => self.ttl,
                        ProofKind::Session => self.ttl.max(self.max_stale),
                    };
                    cached.fetched_at.elapsed() < limit
                }
            }
        });

        let removed = before - slots.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = slots.len(), "Swept expired credentials");
        }
        removed
    }

    /// Number of principals with a cached record.
    pub async fn len(&self) -> usize {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Whether no principal has a cached record.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, principal: &PrincipalId) -> Slot {
        if let Some(slot) = self.slots.read().await.get(principal) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(principal.clone())
            .or_default()
            .clone()
    }

    /// Remove a slot that holds nothing so bogus proofs do not accumulate.
    async fn forget_empty(&self, principal: &PrincipalId) {
        let mut slots = self.slots.write().await;
        let empty = match slots.get(principal) {
            Some(slot) => slot.try_lock().map(|e| e.is_none()).unwrap_or(false),
            None => false,
        };
        if empty {
            slots.remove(principal);
        }
    }
}
