//! API error handling for the TeleStore HTTP surface.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::TelestoreError;

/// API error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad request (400).
    BadRequest,
    /// Unauthorized (401).
    Unauthorized,
    /// Not found (404).
    NotFound,
    /// Conflict (409).
    Conflict,
    /// Completion requested before every chunk arrived (409).
    IncompleteSession,
    /// Payload too large (413).
    PayloadTooLarge,
    /// Range not satisfiable (416).
    RangeNotSatisfiable,
    /// Validation error (422).
    ValidationError,
    /// Remote store failure on a synchronous path (502).
    BadGateway,
    /// Remote store timeout (504).
    GatewayTimeout,
    /// Internal server error (500).
    InternalError,
}

impl ErrorCode {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict | ErrorCode::IncompleteSession => StatusCode::CONFLICT,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            ErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Error details.
    pub error: ErrorDetail,
}

/// Error detail.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured details (field errors, chunk counts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
    content_range: Option<String>,
}

impl ApiError {
    /// Create a new API error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            content_range: None,
        }
    }

    /// Create a new API error with structured details.
    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            details: Some(details),
            ..Self::new(code, message)
        }
    }

    /// Error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Create a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Create a payload too large error.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PayloadTooLarge, message)
    }

    /// Create a validation error without field details.
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an internal server error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// 416 for an object of `total` bytes, with `Content-Range: bytes */total`.
    pub fn range_not_satisfiable(total: u64) -> Self {
        Self {
            content_range: Some(format!("bytes */{total}")),
            ..Self::new(
                ErrorCode::RangeNotSatisfiable,
                format!("Requested range not satisfiable for a {total} byte object"),
            )
        }
    }

    /// Create a validation error with field-level details.
    pub fn validation(details: HashMap<String, Vec<String>>) -> Self {
        Self::with_details(
            ErrorCode::ValidationError,
            "Validation failed",
            serde_json::json!(details),
        )
    }

    /// Create a validation error from validator::ValidationErrors.
    pub fn from_validation_errors(errors: validator::ValidationErrors) -> Self {
        let mut details: HashMap<String, Vec<String>> = HashMap::new();

        for (field, field_errors) in errors.field_errors() {
            let messages: Vec<String> = field_errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("Invalid value for {}", field))
                })
                .collect();
            details.insert(field.to_string(), messages);
        }

        Self::validation(details)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status_code();
        let content_range = self.content_range;
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(value) = content_range.and_then(|v| HeaderValue::from_str(&v).ok()) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
        response
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<TelestoreError> for ApiError {
    fn from(err: TelestoreError) -> Self {
        match err {
            TelestoreError::Validation(msg) => ApiError::unprocessable(msg),
            TelestoreError::IncompleteSession { received, total } => ApiError::with_details(
                ErrorCode::IncompleteSession,
                format!("Received {received} of {total} chunks"),
                serde_json::json!({ "received": received, "total": total }),
            ),
            TelestoreError::Credential(msg) => ApiError::unauthorized(msg),
            TelestoreError::RemoteStore(msg) => {
                tracing::warn!(error = %msg, "Remote store request failed");
                ApiError::new(ErrorCode::BadGateway, msg)
            }
            TelestoreError::RangeNotSatisfiable { total } => ApiError::range_not_satisfiable(total),
            TelestoreError::Timeout(secs) => ApiError::new(
                ErrorCode::GatewayTimeout,
                format!("Remote store timed out after {secs} seconds"),
            ),
            TelestoreError::NotFound(msg) => ApiError::not_found(format!("{msg} not found")),
            TelestoreError::Conflict(msg) => ApiError::conflict(msg),
            err @ (TelestoreError::Cancelled | TelestoreError::Io(_) | TelestoreError::Config(_)) => {
                tracing::error!("Internal error: {}", err);
                ApiError::internal("An internal error occurred")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status() {
        assert_eq!(ErrorCode::BadRequest.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::IncompleteSession.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorCode::RangeNotSatisfiable.status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ErrorCode::ValidationError.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ErrorCode::BadGateway.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_incomplete_session_details() {
        let err = ApiError::from(TelestoreError::IncompleteSession {
            received: 2,
            total: 3,
        });
        assert_eq!(err.code, ErrorCode::IncompleteSession);
        assert_eq!(
            err.details.unwrap(),
            serde_json::json!({ "received": 2, "total": 3 })
        );
    }

    #[test]
    fn test_domain_error_mapping() {
        let err = ApiError::from(TelestoreError::Credential("expired".to_string()));
        assert_eq!(err.code, ErrorCode::Unauthorized);

        let err = ApiError::from(TelestoreError::RemoteStore("flood wait".to_string()));
        assert_eq!(err.code, ErrorCode::BadGateway);
        assert_eq!(err.message, "flood wait");

        let err = ApiError::from(TelestoreError::Io(std::io::Error::other("disk")));
        assert_eq!(err.code, ErrorCode::InternalError);
        assert_eq!(err.message, "An internal error occurred");
    }

    #[test]
    fn test_range_not_satisfiable_header() {
        let response = ApiError::from(TelestoreError::RangeNotSatisfiable { total: 100 }).into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */100"
        );
    }

    #[test]
    fn test_validation_error() {
        let mut details = HashMap::new();
        details.insert("file_name".to_string(), vec!["Required".to_string()]);

        let err = ApiError::validation(details);
        assert_eq!(err.code, ErrorCode::ValidationError);
        assert_eq!(err.message, "Validation failed");
        assert_eq!(err.details.unwrap()["file_name"][0], "Required");
    }
}
