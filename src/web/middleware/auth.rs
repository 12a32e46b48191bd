//! Bearer token extraction and local download-token checks.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::web::error::ApiError;

/// Claims of a download token issued by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTokenClaims {
    /// Subject (backend user id).
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiration timestamp.
    pub exp: u64,
}

/// Verifies download tokens locally before the authority is contacted.
#[derive(Clone)]
pub struct DownloadTokenState {
    /// Decoding key for HS256 verification.
    pub decoding_key: DecodingKey,
    /// Validation settings.
    pub validation: Validation,
}

impl DownloadTokenState {
    /// Create a verifier from the shared secret.
    pub fn new(secret: &str) -> Self {
        let decoding_key = DecodingKey::from_secret(secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        Self {
            decoding_key,
            validation,
        }
    }

    /// Check signature and expiry.
    pub fn verify(&self, token: &str) -> Result<DownloadTokenClaims, ApiError> {
        decode::<DownloadTokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Download token rejected: {}", e);
                ApiError::unauthorized("Invalid or expired download token")
            })
    }
}

/// Token from an `Authorization: Bearer` header, if present.
#[derive(Debug, Clone)]
pub struct BearerToken(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|header| header.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        Ok(BearerToken(token))
    }
}

impl BearerToken {
    /// Prefer an explicit proof from the body or query, then the header.
    pub fn or_explicit(self, explicit: Option<String>) -> Result<String, ApiError> {
        explicit
            .filter(|proof| !proof.trim().is_empty())
            .or(self.0)
            .ok_or_else(|| ApiError::unauthorized("Missing authorization"))
    }
}
