//! Test helpers for the HTTP API tests.
//!
//! Builds a `TestServer` over the in-process remote store and a scripted
//! credential authority, with scratch space in a temporary directory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::{TestResponse, TestServer};
use serde_json::{json, Value};
use tempfile::TempDir;

use telestore::credentials::{AuthorityError, CredentialAuthority, CredentialsRecord, ProofKind};
use telestore::remote::{MemoryStore, SessionStore, UnconfiguredSessionStore};
use telestore::web::{build_app, AppState};
use telestore::Config;

/// Proof the scripted authority accepts.
pub const PROOF: &str = "session-proof";

/// Channel every stored object lives in.
pub const CHANNEL_ID: i64 = -1001234567890;

pub const MB: usize = 1024 * 1024;

/// Credential authority that accepts [`PROOF`] plus any proofs added
/// with [`ScriptedAuthority::accept`], and rejects everything else.
pub struct ScriptedAuthority {
    calls: AtomicU32,
    accepted: Mutex<Vec<String>>,
}

impl ScriptedAuthority {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            accepted: Mutex::new(vec![PROOF.to_string()]),
        }
    }

    pub fn accept(&self, proof: &str) {
        self.accepted.lock().unwrap().push(proof.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn credentials() -> CredentialsRecord {
    serde_json::from_value(json!({
        "channel_id": CHANNEL_ID,
        "bot_token": "1:test",
        "telegram_session": "session",
        "telegram_api_id": 1,
        "telegram_api_hash": "hash",
        "user_id": "user-1",
    }))
    .expect("valid credentials fixture")
}

#[async_trait]
impl CredentialAuthority for ScriptedAuthority {
    async fn verify(
        &self,
        auth_proof: &str,
        _kind: ProofKind,
    ) -> Result<CredentialsRecord, AuthorityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let known = self.accepted.lock().unwrap().iter().any(|p| p == auth_proof);
        if known {
            Ok(credentials())
        } else {
            Err(AuthorityError::Rejected("unknown proof".to_string()))
        }
    }
}

/// Everything a test needs to drive and inspect the service.
pub struct TestApp {
    pub server: TestServer,
    pub store: MemoryStore,
    pub authority: Arc<ScriptedAuthority>,
    pub state: Arc<AppState>,
    _scratch: TempDir,
}

/// Configuration used by the tests.
///
/// The 1MB upload threshold sends anything bigger through the session
/// API so the multi-part path is exercised.
pub fn create_test_config(scratch: &TempDir) -> Config {
    let mut config = Config::default();
    config.transfer.scratch_path = scratch.path().to_string_lossy().into_owned();
    config.transfer.upload_small_limit_mb = 1;
    config.transfer.resolve_backoff_ms = 1;
    config
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(|_| {})
}

/// Create a test app, letting the caller adjust the configuration first.
pub fn create_test_app_with(adjust: impl FnOnce(&mut Config)) -> TestApp {
    build_test_app(adjust, true)
}

/// Create a test app whose session API refuses every connection.
///
/// The in-process store still serves the fast API.
pub fn create_test_app_without_sessions() -> TestApp {
    build_test_app(|_| {}, false)
}

fn build_test_app(adjust: impl FnOnce(&mut Config), with_sessions: bool) -> TestApp {
    let scratch = TempDir::new().expect("Failed to create scratch directory");
    let mut config = create_test_config(&scratch);
    adjust(&mut config);

    let store = MemoryStore::new();
    let authority = Arc::new(ScriptedAuthority::new());
    let sessions: Arc<dyn SessionStore> = if with_sessions {
        Arc::new(store.clone())
    } else {
        Arc::new(UnconfiguredSessionStore)
    };
    let state = Arc::new(
        AppState::new(&config, authority.clone(), Arc::new(store.clone()), sessions)
            .expect("Failed to create app state"),
    );

    let router = build_app(Arc::clone(&state), &config.server.cors_origins);
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        store,
        authority,
        state,
        _scratch: scratch,
    }
}

/// Deterministic, non-repeating-per-MB payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / MB) % 251) as u8).collect()
}

pub async fn init_upload(
    server: &TestServer,
    session_id: &str,
    file_name: &str,
    total_chunks: u32,
    total_size: usize,
) -> TestResponse {
    server
        .post("/init-upload")
        .json(&json!({
            "session_id": session_id,
            "file_name": file_name,
            "total_chunks": total_chunks,
            "total_size": total_size,
        }))
        .await
}

pub async fn upload_chunk(
    server: &TestServer,
    session_id: &str,
    file_name: &str,
    chunk_index: u32,
    total_chunks: u32,
    bytes: &[u8],
) -> TestResponse {
    let form = MultipartForm::new()
        .add_text("session_id", session_id)
        .add_text("chunk_index", chunk_index)
        .add_text("total_chunks", total_chunks)
        .add_text("file_name", file_name)
        .add_part(
            "chunk",
            Part::bytes(bytes.to_vec())
                .file_name("blob")
                .mime_type("application/octet-stream"),
        );

    server.post("/upload-chunk").multipart(form).await
}

pub async fn complete_upload(server: &TestServer, session_id: &str) -> TestResponse {
    server
        .post("/complete-upload")
        .add_header(axum::http::header::AUTHORIZATION, format!("Bearer {}", PROOF))
        .json(&json!({ "session_id": session_id }))
        .await
}

/// Upload `data` as `chunk_size` chunks in the given index order.
pub async fn upload_in_order(
    server: &TestServer,
    session_id: &str,
    file_name: &str,
    data: &[u8],
    chunk_size: usize,
    order: &[u32],
) {
    let chunks: Vec<&[u8]> = data.chunks(chunk_size).collect();
    let total = chunks.len() as u32;

    init_upload(server, session_id, file_name, total, data.len())
        .await
        .assert_status_ok();

    for &index in order {
        upload_chunk(server, session_id, file_name, index, total, chunks[index as usize])
            .await
            .assert_status_ok();
    }
}

/// Poll a job until it leaves the uploading state.
pub async fn wait_for_job(server: &TestServer, job_id: &str) -> Value {
    for _ in 0..200 {
        let response = server.get(&format!("/upload-progress/{}", job_id)).await;
        response.assert_status_ok();
        let body = response.json::<Value>();
        if body["status"] != "uploading" {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not finish");
}
