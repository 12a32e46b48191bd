//! Web API Download Tests
//!
//! Integration tests for streaming downloads, byte ranges and download
//! tokens.

mod common;

use axum::http::header::{
    ACCEPT_RANGES, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    RANGE,
};
use axum::http::StatusCode;
use bytes::Bytes;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};

use common::{
    create_test_app, create_test_app_with, create_test_app_without_sessions, payload, TestApp,
    CHANNEL_ID, MB, PROOF,
};

const SECRET: &str = "download-token-secret";

/// Store a 10MB object and return its message id, file id and bytes.
async fn store_object(app: &TestApp) -> (i64, String, Vec<u8>) {
    let data = payload(10 * MB);
    let receipt = app
        .store
        .insert_object(CHANNEL_ID, "video.mp4", Bytes::from(data.clone()))
        .await;
    (receipt.message_id, receipt.file_id, data)
}

fn header_str<'a>(response: &'a axum_test::TestResponse, name: axum::http::HeaderName) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn download_token(exp_offset_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + exp_offset_secs;
    encode(
        &Header::default(),
        &json!({ "sub": "user-1", "exp": exp }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_range_download_over_session_api() {
    let app = create_test_app();
    let (message_id, _, data) = store_object(&app).await;

    let response = app
        .server
        .get(&format!("/download?object_id={}&file_name=video.mp4", message_id))
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .add_header(RANGE, "bytes=1048576-2097151")
        .await;

    response.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, CONTENT_LENGTH), "1048576");
    assert_eq!(
        header_str(&response, CONTENT_RANGE),
        format!("bytes 1048576-2097151/{}", 10 * MB)
    );
    assert_eq!(header_str(&response, ACCEPT_RANGES), "bytes");

    let body = response.as_bytes();
    assert_eq!(body.len(), MB);
    assert_eq!(&body[..], &data[MB..2 * MB]);
}

#[tokio::test]
async fn test_whole_download_with_known_size() {
    let app = create_test_app();
    let (message_id, _, data) = store_object(&app).await;

    let response = app
        .server
        .get(&format!(
            "/download?object_id={}&file_name=video.mp4&size={}",
            message_id,
            data.len()
        ))
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .await;

    response.assert_status_ok();
    assert_eq!(header_str(&response, ACCEPT_RANGES), "bytes");
    assert_eq!(header_str(&response, CONTENT_LENGTH), data.len().to_string());
    assert!(response.headers().get(CONTENT_RANGE).is_none());
    assert_eq!(
        header_str(&response, CONTENT_DISPOSITION),
        "inline; filename=\"video.mp4\""
    );
    assert_eq!(header_str(&response, CONTENT_TYPE), "video/mp4");
    assert_eq!(&response.as_bytes()[..], &data[..]);
}

#[tokio::test]
async fn test_suffix_range_over_fast_api() {
    let app = create_test_app();
    let (message_id, file_id, data) = store_object(&app).await;

    let response = app
        .server
        .get(&format!(
            "/download?object_id={}&file_name=video.mp4&size={}&file_id={}",
            message_id,
            data.len(),
            file_id
        ))
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .add_header(RANGE, "bytes=-500")
        .await;

    response.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_str(&response, CONTENT_LENGTH), "500");
    assert_eq!(&response.as_bytes()[..], &data[data.len() - 500..]);

    // Served by the fast API without touching the session API
    assert_eq!(app.store.resolutions(), 0);
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let app = create_test_app();
    let (message_id, _, _) = store_object(&app).await;

    let response = app
        .server
        .get(&format!("/download?object_id={}", message_id))
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .add_header(RANGE, "bytes=20000000-")
        .await;

    response.assert_status(StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        header_str(&response, CONTENT_RANGE),
        format!("bytes */{}", 10 * MB)
    );
    assert_eq!(app.store.bytes_read(), 0);
}

#[tokio::test]
async fn test_unknown_object() {
    let app = create_test_app();

    let response = app
        .server
        .get("/download?object_id=999")
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .await;

    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_requires_proof() {
    let app = create_test_app();
    let (message_id, _, _) = store_object(&app).await;

    let response = app
        .server
        .get(&format!("/download?object_id={}", message_id))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let response = app
        .server
        .get(&format!("/download?object_id={}&token=nope", message_id))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(response.json::<Value>()["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_download_token_checked_locally() {
    let app = create_test_app_with(|config| {
        config.credentials.download_token_secret = SECRET.to_string();
    });
    let (message_id, _, data) = store_object(&app).await;

    // Expired tokens never reach the authority
    let expired = download_token(-60);
    app.authority.accept(&expired);
    let response = app
        .server
        .get(&format!("/download?object_id={}&token={}", message_id, expired))
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
    assert_eq!(app.authority.calls(), 0);

    let valid = download_token(300);
    app.authority.accept(&valid);
    let response = app
        .server
        .get(&format!("/download?object_id={}&token={}", message_id, valid))
        .add_header(RANGE, "bytes=0-99")
        .await;
    response.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(&response.as_bytes()[..], &data[..100]);
    assert_eq!(app.authority.calls(), 1);
}

#[tokio::test]
async fn test_download_token_not_served_after_ttl() {
    let app = create_test_app_with(|config| {
        config.credentials.download_token_secret = SECRET.to_string();
        config.credentials.ttl_secs = 0;
    });
    let (message_id, _, _) = store_object(&app).await;

    let valid = download_token(300);
    app.authority.accept(&valid);
    app.server
        .get(&format!("/download?object_id={}&token={}", message_id, valid))
        .add_header(RANGE, "bytes=0-9")
        .await
        .assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(app.state.credentials.len().await, 1);

    app.state.sweep().await;
    assert!(app.state.credentials.is_empty().await);
}

#[tokio::test]
async fn test_large_download_without_session_api() {
    let app = create_test_app_without_sessions();
    let (message_id, file_id, data) = store_object(&app).await;

    let response = app
        .server
        .get(&format!("/download?object_id={}", message_id))
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .await;
    response.assert_status(StatusCode::BAD_GATEWAY);
    assert!(response.json::<Value>()["error"]["message"]
        .as_str()
        .unwrap()
        .contains("not configured"));

    // Ranges of a known object still go through the fast API
    let response = app
        .server
        .get(&format!(
            "/download?object_id={}&size={}&file_id={}",
            message_id,
            data.len(),
            file_id
        ))
        .add_header(AUTHORIZATION, format!("Bearer {}", PROOF))
        .add_header(RANGE, "bytes=0-99")
        .await;
    response.assert_status(StatusCode::PARTIAL_CONTENT);
    assert_eq!(&response.as_bytes()[..], &data[..100]);
}

