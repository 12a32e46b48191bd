//! TeleStore - chunked, resumable uploads and range-serving downloads over a
//! messaging-service object store.
//!
//! Clients upload large files as bounded chunks that are stored in durable
//! scratch space, reassembled in index order, and pushed to the remote store
//! by a detached transfer task whose progress is polled through a ledger.
//! Downloads are served as pull-based streams with HTTP range support.

pub mod config;
pub mod credentials;
pub mod download;
pub mod error;
pub mod logging;
pub mod remote;
pub mod tier;
pub mod transfer;
pub mod upload;
pub mod web;

pub use config::Config;
pub use error::{Result, TelestoreError};
pub use tier::{route, Tier, TierPolicy};
