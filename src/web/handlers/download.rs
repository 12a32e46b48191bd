//! Streaming, range-capable download handler.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::Response,
};
use std::sync::Arc;

use crate::credentials::ProofKind;
use crate::download::{DownloadDescriptor, DownloadRequest};
use crate::web::dto::DownloadQuery;
use crate::web::error::ApiError;
use crate::web::handlers::AppState;
use crate::web::middleware::BearerToken;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Build an inline `Content-Disposition` value for `filename`.
///
/// Control characters are dropped, quotes and backslashes replaced in the
/// plain parameter, and non-ASCII names carried in an RFC 5987 `filename*`.
fn content_disposition_header(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '"' | '\\' => '_',
            _ => c,
        })
        .collect();

    if filename.is_ascii() && sanitized == filename {
        return format!("inline; filename=\"{}\"", filename);
    }

    let fallback: String = sanitized
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(&sanitized)
    )
}

fn response_status(descriptor: &DownloadDescriptor) -> StatusCode {
    if descriptor.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    }
}

/// GET /download - Stream an object or a byte range of it.
///
/// A proof passed in the query is a download token; a bearer header is a
/// session proof. Download tokens are checked locally when a secret is
/// configured, before anything else is contacted.
#[utoipa::path(
    get,
    path = "/download",
    tag = "downloads",
    params(DownloadQuery),
    responses(
        (status = 200, description = "Whole object", content_type = "application/octet-stream"),
        (status = 206, description = "Requested range", content_type = "application/octet-stream"),
        (status = 401, description = "Invalid or expired token"),
        (status = 404, description = "Object not found"),
        (status = 416, description = "Range not satisfiable"),
        (status = 502, description = "Remote store failure")
    )
)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    bearer: BearerToken,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Response<Body>, ApiError> {
    let (proof, kind) = match query.auth_proof.filter(|p| !p.trim().is_empty()) {
        Some(token) => (token, ProofKind::DownloadToken),
        None => (bearer.or_explicit(None)?, ProofKind::Session),
    };

    if kind == ProofKind::DownloadToken {
        if let Some(tokens) = &state.download_tokens {
            tokens.verify(&proof)?;
        }
    }

    let credentials = state.credentials.get_for_proof(&proof, kind).await?;

    let request = DownloadRequest {
        object_id: query.object_id,
        file_name: query.file_name,
        size: query.size,
        file_id: query.file_id.filter(|id| !id.is_empty()),
        range: headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };

    let download = state.downloader.serve(&request, &credentials).await?;
    let descriptor = download.descriptor;

    tracing::info!(
        object_id = descriptor.object_id,
        tier = ?descriptor.tier,
        bytes = descriptor.content_length(),
        total = descriptor.total_size,
        ranged = descriptor.range.is_some(),
        "Serving download"
    );

    let mut builder = Response::builder()
        .status(response_status(&descriptor))
        .header(header::CONTENT_TYPE, &descriptor.mime_type)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition_header(&descriptor.file_name),
        )
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, descriptor.content_length())
        .header(header::CACHE_CONTROL, "no-cache")
        .header(X_ACCEL_BUFFERING, "no");
    if let Some(content_range) = descriptor.content_range() {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    builder
        .body(Body::from_stream(download.body))
        .map_err(|e| {
            tracing::error!("Failed to build response: {}", e);
            ApiError::internal("Failed to build response")
        })
}
