//! Request DTOs for the transfer API.
//!
//! Field names follow snake_case; the camelCase names used by older
//! clients are accepted as aliases.

use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

use super::validation::{no_control_chars, not_empty_trimmed};

/// Declare an upload session.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct InitUploadRequest {
    /// Client-chosen session id.
    #[serde(alias = "uploadId", alias = "sessionId")]
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    /// Original file name.
    #[serde(alias = "fileName")]
    #[validate(
        length(min = 1, max = 255),
        custom(function = "not_empty_trimmed"),
        custom(function = "no_control_chars")
    )]
    pub file_name: String,
    /// Number of chunks the file is split into.
    #[serde(alias = "totalChunks")]
    #[validate(range(min = 1))]
    pub total_chunks: u32,
    /// File size in bytes.
    #[serde(alias = "totalSize")]
    pub total_size: u64,
}

/// Finish a session and start the remote transfer.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CompleteUploadRequest {
    /// Session to complete.
    #[serde(alias = "uploadId", alias = "sessionId")]
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
    /// Proof used to fetch credentials; the bearer token is used if absent.
    #[serde(default, alias = "authToken")]
    pub auth_proof: Option<String>,
}

/// Abandon a session.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CancelUploadRequest {
    /// Session to cancel.
    #[serde(alias = "uploadId", alias = "sessionId")]
    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
}

fn default_download_name() -> String {
    "file".to_string()
}

/// Query parameters of `GET /download`.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DownloadQuery {
    /// Message holding the object.
    #[serde(alias = "messageId")]
    pub object_id: i64,
    /// Download token or session proof.
    #[serde(default, alias = "token")]
    pub auth_proof: Option<String>,
    /// Name for the MIME type and `Content-Disposition`.
    #[serde(default = "default_download_name", alias = "fileName")]
    pub file_name: String,
    /// Object size known to the metadata layer.
    #[serde(default)]
    pub size: Option<u64>,
    /// Fast-API file id.
    #[serde(default, alias = "fileId")]
    pub file_id: Option<String>,
}
