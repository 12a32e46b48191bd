//! HTTP surface of the transfer worker.
//!
//! Axum handlers for chunked uploads, progress polling, direct uploads and
//! range-serving downloads, plus the API error type and OpenAPI docs.

pub mod dto;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod server;

pub use error::ApiError;
pub use handlers::AppState;
pub use router::create_router;
pub use server::{build_app, WebServer};
