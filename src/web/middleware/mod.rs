//! Middleware and extractors for the transfer API.

pub mod auth;
pub mod cors;

pub use auth::{BearerToken, DownloadTokenClaims, DownloadTokenState};
pub use cors::create_cors_layer;
