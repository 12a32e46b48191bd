//! Remote-store transfer engine and progress ledger.

pub mod engine;
pub mod ledger;
pub mod notify;

pub use engine::{EngineConfig, TransferEngine};
pub use ledger::{JobStatus, JobWriter, ProgressLedger, TransferJob};
pub use notify::{HttpNotifier, UploadNotice, UploadNotifier};
