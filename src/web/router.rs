//! Router configuration for the transfer API.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use super::dto::{
    CancelUploadRequest, CancelUploadResponse, ChunkUploadResponse, CompleteUploadRequest,
    CompleteUploadResponse, DirectUploadResponse, HealthResponse, InitUploadRequest,
    InitUploadResponse, ProgressResponse,
};
use super::handlers::{
    self, cancel_upload, complete_upload, direct_upload, download, health, init_upload,
    upload_chunk, upload_progress, AppState,
};
use super::middleware::create_cors_layer;
use crate::tier::Tier;
use crate::transfer::JobStatus;

/// Room for multipart framing and the text fields around a chunk.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// OpenAPI document for the transfer API.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::upload::init_upload,
        handlers::upload::upload_chunk,
        handlers::upload::complete_upload,
        handlers::upload::upload_progress,
        handlers::upload::cancel_upload,
        handlers::upload::direct_upload,
        handlers::download::download,
    ),
    components(schemas(
        InitUploadRequest,
        InitUploadResponse,
        ChunkUploadResponse,
        CompleteUploadRequest,
        CompleteUploadResponse,
        CancelUploadRequest,
        CancelUploadResponse,
        ProgressResponse,
        DirectUploadResponse,
        HealthResponse,
        JobStatus,
        Tier,
    )),
    modifiers(&BearerAuth),
    tags(
        (name = "uploads", description = "Chunked and direct uploads"),
        (name = "downloads", description = "Range-serving downloads"),
        (name = "health", description = "Liveness")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

fn body_limit(bytes: u64) -> DefaultBodyLimit {
    DefaultBodyLimit::max(usize::try_from(bytes.saturating_add(MULTIPART_OVERHEAD)).unwrap_or(usize::MAX))
}

/// Create the main API router.
///
/// JSON routes are gzip-compressed; the download route is not, so
/// `Content-Length` and `Content-Range` describe the bytes on the wire.
pub fn create_router(app_state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let chunk_limit = body_limit(app_state.max_chunk_bytes);
    let direct_limit = body_limit(app_state.tiers.upload_threshold);

    let json_routes = Router::new()
        .route("/init-upload", post(init_upload))
        .route("/complete-upload", post(complete_upload))
        .route("/upload-progress/:job_id", get(upload_progress))
        .route("/cancel-upload", post(cancel_upload))
        .layer(CompressionLayer::new());

    let body_routes = Router::new()
        .route("/upload-chunk", post(upload_chunk).layer(chunk_limit))
        .route("/upload", post(direct_upload).layer(direct_limit))
        .route("/download", get(download));

    Router::new()
        .merge(json_routes)
        .merge(body_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(create_cors_layer(cors_origins)),
        )
        .with_state(app_state)
}

/// Create a health check router.
pub fn create_health_router() -> Router {
    Router::new().route("/health", get(health))
}

/// Create the Swagger UI router serving the OpenAPI document.
pub fn create_swagger_router() -> Router {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDoc::openapi())
        .into()
}
