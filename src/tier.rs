//! Size-tiered routing between the two remote store protocols.
//!
//! The fast API is cheap but capped; the session API has no meaningful cap
//! but costs a connection and an entity lookup per call. Objects whose size
//! is less than or equal to the threshold take the fast path.

use serde::Serialize;
use utoipa::ToSchema;

/// Which remote protocol an object uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Fast, size-limited API.
    Small,
    /// Session-authenticated, range-capable API.
    Large,
}

/// Route an object of `size_bytes` against `threshold_bytes`.
///
/// The threshold itself belongs to the small tier.
pub fn route(size_bytes: u64, threshold_bytes: u64) -> Tier {
    if size_bytes <= threshold_bytes {
        Tier::Small
    } else {
        Tier::Large
    }
}

/// Thresholds for both transfer directions.
///
/// Uploads and downloads differ because the fast API accepts larger
/// uploads than it serves downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Upload threshold in bytes.
    pub upload_threshold: u64,
    /// Download threshold in bytes.
    pub download_threshold: u64,
}

impl TierPolicy {
    /// Upload threshold used by the fast API (50MB).
    pub const DEFAULT_UPLOAD_THRESHOLD: u64 = 50 * 1024 * 1024;
    /// Download threshold used by the fast API (20MB).
    pub const DEFAULT_DOWNLOAD_THRESHOLD: u64 = 20 * 1024 * 1024;

    /// Create a policy with explicit thresholds.
    pub fn new(upload_threshold: u64, download_threshold: u64) -> Self {
        Self {
            upload_threshold,
            download_threshold,
        }
    }

    /// Tier for an upload of `size_bytes`.
    pub fn for_upload(&self, size_bytes: u64) -> Tier {
        route(size_bytes, self.upload_threshold)
    }

    /// Tier for a download of `size_bytes`.
    pub fn for_download(&self, size_bytes: u64) -> Tier {
        route(size_bytes, self.download_threshold)
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_UPLOAD_THRESHOLD,
            Self::DEFAULT_DOWNLOAD_THRESHOLD,
        )
    }
}
