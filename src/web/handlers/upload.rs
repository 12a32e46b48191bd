//! Upload handlers: chunked sessions, progress polling and direct uploads.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use std::sync::Arc;

use crate::credentials::ProofKind;
use crate::tier::Tier;
use crate::upload::ChunkUpload;
use crate::web::dto::validation::sanitize_file_name;
use crate::web::dto::{
    CancelUploadRequest, CancelUploadResponse, ChunkUploadResponse, CompleteUploadRequest,
    CompleteUploadResponse, DirectUploadResponse, InitUploadRequest, InitUploadResponse,
    ProgressResponse, ValidatedJson,
};
use crate::web::error::ApiError;
use crate::web::handlers::AppState;
use crate::web::middleware::BearerToken;
use crate::TelestoreError;

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("Request body too large")
    } else {
        tracing::debug!("Failed to read multipart field: {}", e);
        ApiError::bad_request("Invalid multipart data")
    }
}

fn missing(field: &str) -> ApiError {
    TelestoreError::Validation(format!("{field} is required")).into()
}

fn parse_field<T: std::str::FromStr>(field: &str, value: Option<String>) -> Result<T, ApiError> {
    let value = value.ok_or_else(|| missing(field))?;
    value
        .trim()
        .parse()
        .map_err(|_| TelestoreError::Validation(format!("{field} must be a non-negative integer")).into())
}

/// POST /init-upload - Declare an upload session.
#[utoipa::path(
    post,
    path = "/init-upload",
    tag = "uploads",
    request_body = InitUploadRequest,
    responses(
        (status = 200, description = "Session declared", body = InitUploadResponse),
        (status = 409, description = "Session exists with a different layout"),
        (status = 422, description = "Invalid declaration")
    )
)]
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<InitUploadRequest>,
) -> Result<Json<InitUploadResponse>, ApiError> {
    let status = state
        .receiver
        .init(&req.session_id, &req.file_name, req.total_chunks, req.total_size)
        .await?;

    tracing::info!(
        session_id = %req.session_id,
        file_name = %req.file_name,
        total_chunks = req.total_chunks,
        bytes = req.total_size,
        "Upload session declared"
    );

    Ok(Json(InitUploadResponse {
        success: true,
        session_id: req.session_id,
        received_count: status.received_count,
        total_count: status.total_count,
    }))
}

/// POST /upload-chunk - Store one chunk.
///
/// Request body: multipart/form-data with a `chunk` file field plus
/// `session_id`, `chunk_index`, `total_chunks`, `file_name` and `total_size`.
#[utoipa::path(
    post,
    path = "/upload-chunk",
    tag = "uploads",
    responses(
        (status = 200, description = "Chunk stored", body = ChunkUploadResponse),
        (status = 409, description = "Session is closed"),
        (status = 413, description = "Chunk too large"),
        (status = 422, description = "Invalid chunk")
    )
)]
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, ApiError> {
    let mut session_id: Option<String> = None;
    let mut chunk_index: Option<String> = None;
    let mut total_chunks: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut total_size: Option<String> = None;
    let mut content: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "chunk" | "file" | "chunk_bytes" => {
                content = Some(field.bytes().await.map_err(multipart_error)?);
            }
            "session_id" | "uploadId" | "sessionId" => {
                session_id = Some(field.text().await.map_err(multipart_error)?);
            }
            "chunk_index" | "chunkIndex" => {
                chunk_index = Some(field.text().await.map_err(multipart_error)?);
            }
            "total_chunks" | "totalChunks" => {
                total_chunks = Some(field.text().await.map_err(multipart_error)?);
            }
            "file_name" | "fileName" => {
                file_name = Some(field.text().await.map_err(multipart_error)?);
            }
            "total_size" | "totalSize" => {
                total_size = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let session_id = session_id.ok_or_else(|| missing("session_id"))?;
    let chunk_index: u32 = parse_field("chunk_index", chunk_index)?;
    let total_chunks: u32 = parse_field("total_chunks", total_chunks)?;
    let total_size: Option<u64> = match total_size {
        Some(value) if !value.trim().is_empty() => Some(parse_field("total_size", Some(value))?),
        _ => None,
    };
    let file_name = file_name
        .as_deref()
        .and_then(sanitize_file_name)
        .ok_or_else(|| missing("file_name"))?;
    let content = content.ok_or_else(|| missing("chunk"))?;

    if content.len() as u64 > state.max_chunk_bytes {
        return Err(ApiError::payload_too_large(format!(
            "Chunk exceeds the {} byte limit",
            state.max_chunk_bytes
        )));
    }

    let status = state
        .receiver
        .store_chunk(ChunkUpload {
            session_id: &session_id,
            chunk_index,
            total_chunks,
            file_name: &file_name,
            total_size,
            bytes: &content,
        })
        .await?;

    Ok(Json(ChunkUploadResponse::new(chunk_index, status)))
}

/// POST /complete-upload - Reassemble a session and start the transfer.
///
/// Returns as soon as the transfer is running. Calling it again for the
/// same session returns the existing job.
#[utoipa::path(
    post,
    path = "/complete-upload",
    tag = "uploads",
    request_body = CompleteUploadRequest,
    responses(
        (status = 200, description = "Transfer started", body = CompleteUploadResponse),
        (status = 401, description = "Credentials unavailable"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Chunks missing or session busy")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    bearer: BearerToken,
    ValidatedJson(req): ValidatedJson<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, ApiError> {
    let job_id = req.session_id;

    let existing = state.ledger.get(&job_id).await;
    if let Some(job) = &existing {
        if !state.receiver.has_session(&job_id).await? {
            tracing::debug!(job_id = %job_id, "Completion repeated for an existing job");
            return Ok(Json(CompleteUploadResponse::for_job(&job_id)));
        }
        if !job.status.is_terminal() {
            return Err(TelestoreError::Conflict(format!(
                "job {job_id} is still in progress"
            ))
            .into());
        }
    }

    let session = state.receiver.claim(&job_id).await?;

    let credentials = match bearer.or_explicit(req.auth_proof) {
        Ok(proof) => state.credentials.get_for_proof(&proof, ProofKind::Session).await,
        Err(e) => {
            state.receiver.release(&job_id).await;
            return Err(e);
        }
    };
    let credentials = match credentials {
        Ok(credentials) => credentials,
        Err(e) => {
            state.receiver.release(&job_id).await;
            return Err(e.into());
        }
    };

    let file = match state.reassembler.reassemble(&session).await {
        Ok(file) => file,
        Err(e) => {
            state.receiver.release(&job_id).await;
            return Err(e.into());
        }
    };
    state.receiver.finish(&job_id).await;

    // A new session reusing the id of a finished job replaces that job
    if existing.is_some() {
        state.ledger.retire(&job_id).await;
    }

    let path = file.path.clone();
    if let Err(e) = state.engine.begin_transfer(&job_id, file, credentials).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e.into());
    }

    Ok(Json(CompleteUploadResponse::for_job(&job_id)))
}

/// GET /upload-progress/:job_id - Poll a transfer job.
#[utoipa::path(
    get,
    path = "/upload-progress/{job_id}",
    tag = "uploads",
    params(
        ("job_id" = String, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job state", body = ProgressResponse),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn upload_progress(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let job = state
        .ledger
        .get(&job_id)
        .await
        .ok_or_else(|| ApiError::not_found("Job not found"))?;

    Ok(Json(ProgressResponse::from(job)))
}

/// POST /cancel-upload - Abandon a session and stop its transfer.
#[utoipa::path(
    post,
    path = "/cancel-upload",
    tag = "uploads",
    request_body = CancelUploadRequest,
    responses(
        (status = 200, description = "Session cancelled", body = CancelUploadResponse),
        (status = 422, description = "Invalid session id")
    )
)]
pub async fn cancel_upload(
    State(state): State<Arc<AppState>>,
    ValidatedJson(req): ValidatedJson<CancelUploadRequest>,
) -> Result<Json<CancelUploadResponse>, ApiError> {
    let chunks_deleted = state.receiver.cancel(&req.session_id).await?;
    let transfer_cancelled = state.engine.cancel(&req.session_id).await;

    Ok(Json(CancelUploadResponse {
        success: true,
        chunks_deleted,
        transfer_cancelled,
    }))
}

/// POST /upload - Store a small file in one request.
///
/// Request body: multipart/form-data with a `file` field, an optional
/// `auth_proof` (or bearer token) and an optional `job_id` to record the
/// result under.
#[utoipa::path(
    post,
    path = "/upload",
    tag = "uploads",
    responses(
        (status = 200, description = "File stored", body = DirectUploadResponse),
        (status = 401, description = "Credentials unavailable"),
        (status = 409, description = "Job id already used"),
        (status = 413, description = "Body too large"),
        (status = 422, description = "File too large for a direct upload"),
        (status = 502, description = "Remote store failure")
    ),
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn direct_upload(
    State(state): State<Arc<AppState>>,
    bearer: BearerToken,
    mut multipart: Multipart,
) -> Result<Json<DirectUploadResponse>, ApiError> {
    let mut file_name: Option<String> = None;
    let mut auth_proof: Option<String> = None;
    let mut job_id: Option<String> = None;
    let mut content: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" | "file_bytes" => {
                if file_name.is_none() {
                    file_name = field.file_name().map(|s| s.to_string());
                }
                content = Some(field.bytes().await.map_err(multipart_error)?);
            }
            "file_name" | "fileName" => {
                file_name = Some(field.text().await.map_err(multipart_error)?);
            }
            "auth_proof" | "authToken" => {
                auth_proof = Some(field.text().await.map_err(multipart_error)?);
            }
            "job_id" | "jobId" | "uploadId" => {
                job_id = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let content = content.ok_or_else(|| missing("file"))?;
    let file_name = file_name
        .as_deref()
        .and_then(sanitize_file_name)
        .ok_or_else(|| missing("file_name"))?;
    let size = content.len() as u64;

    if state.tiers.for_upload(size) == Tier::Large {
        return Err(TelestoreError::Validation(format!(
            "file of {} bytes exceeds the {} byte direct upload limit; use the chunked upload",
            size, state.tiers.upload_threshold
        ))
        .into());
    }

    let job_id = job_id.filter(|id| !id.trim().is_empty());
    if let Some(job_id) = &job_id {
        if state.ledger.get(job_id).await.is_some() {
            return Err(TelestoreError::Conflict(format!("job {job_id} already exists")).into());
        }
    }

    let proof = bearer.or_explicit(auth_proof)?;
    let credentials = state
        .credentials
        .get_for_proof(&proof, ProofKind::Session)
        .await?;

    let receipt = state
        .fast
        .send_document(&credentials, &file_name, content)
        .await?;

    tracing::info!(
        file_name = %file_name,
        bytes = size,
        message_id = receipt.message_id,
        "Direct upload stored"
    );

    if let Some(job_id) = &job_id {
        if let Err(e) = state
            .ledger
            .record_completed(job_id, &file_name, size, &receipt)
            .await
        {
            tracing::warn!(job_id = %job_id, error = %e, "Direct upload stored but not recorded");
            return Err(e.into());
        }
    }

    Ok(Json(DirectUploadResponse {
        success: true,
        remote_message_id: receipt.message_id,
        remote_file_id: receipt.file_id,
        file_name,
        size,
        job_id,
    }))
}
