//! Chunked upload intake.
//!
//! Clients split a file into bounded chunks, send them in any order, then
//! ask for completion. Chunks live in durable scratch storage until the
//! [`Reassembler`] concatenates them in index order.

pub mod reassembler;
pub mod receiver;
pub mod scratch;
pub mod session;

pub use reassembler::{AssembledFile, Reassembler};
pub use receiver::{ChunkReceiver, ChunkUpload};
pub use scratch::{validate_session_id, ScratchStore, StagedChunk};
pub use session::{ChunkStatus, SessionManifest, UploadSession};
