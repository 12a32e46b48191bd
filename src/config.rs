//! Configuration module for TeleStore.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::{Result, TelestoreError};

const MB: u64 = 1024 * 1024;

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origins (empty = any origin, no credentials).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

/// Chunked transfer pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Directory holding scratch chunks and reassembled files.
    #[serde(default = "default_scratch_path")]
    pub scratch_path: String,
    /// Per-chunk ceiling for upload-chunk calls, in megabytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size_mb: u64,
    /// Internal part size used against the session API, in kilobytes.
    #[serde(default = "default_internal_chunk_size")]
    pub internal_chunk_size_kb: u64,
    /// Largest upload routed to the fast API, in megabytes.
    #[serde(default = "default_upload_small_limit")]
    pub upload_small_limit_mb: u64,
    /// Largest download routed to the fast API, in megabytes.
    #[serde(default = "default_download_small_limit")]
    pub download_small_limit_mb: u64,
    /// Largest file accepted by the pipeline, in megabytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_mb: u64,
    /// Ceiling for one detached transfer, in seconds.
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,
    /// Attempts at resolving the destination channel before failing a job.
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    /// Linear backoff step between resolution attempts, in milliseconds.
    #[serde(default = "default_resolve_backoff")]
    pub resolve_backoff_ms: u64,
    /// How long terminal jobs stay pollable, in seconds.
    #[serde(default = "default_job_retention")]
    pub job_retention_secs: u64,
    /// How long an idle upload session keeps its scratch data, in seconds.
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,
    /// Interval of the retention sweeper, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Whether completed transfers are reported to the backend webhook.
    #[serde(default)]
    pub notify_backend: bool,
}

fn default_scratch_path() -> String {
    "data/uploads".to_string()
}

fn default_max_chunk_size() -> u64 {
    5
}

fn default_internal_chunk_size() -> u64 {
    1024 // 1MB
}

fn default_upload_small_limit() -> u64 {
    50
}

fn default_download_small_limit() -> u64 {
    20
}

fn default_max_file_size() -> u64 {
    2000
}

fn default_transfer_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_resolve_attempts() -> u32 {
    3
}

fn default_resolve_backoff() -> u64 {
    500
}

fn default_job_retention() -> u64 {
    3600
}

fn default_session_retention() -> u64 {
    86400
}

fn default_sweep_interval() -> u64 {
    300
}

impl TransferConfig {
    /// Per-chunk ceiling in bytes.
    pub fn max_chunk_bytes(&self) -> u64 {
        self.max_chunk_size_mb * MB
    }

    /// Internal part size in bytes.
    pub fn internal_chunk_bytes(&self) -> usize {
        (self.internal_chunk_size_kb * 1024) as usize
    }

    /// Upload SMALL_PATH threshold in bytes.
    pub fn upload_small_limit_bytes(&self) -> u64 {
        self.upload_small_limit_mb * MB
    }

    /// Download SMALL_PATH threshold in bytes.
    pub fn download_small_limit_bytes(&self) -> u64 {
        self.download_small_limit_mb * MB
    }

    /// Maximum accepted file size in bytes.
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb * MB
    }

    /// Detached transfer ceiling.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            scratch_path: default_scratch_path(),
            max_chunk_size_mb: default_max_chunk_size(),
            internal_chunk_size_kb: default_internal_chunk_size(),
            upload_small_limit_mb: default_upload_small_limit(),
            download_small_limit_mb: default_download_small_limit(),
            max_file_size_mb: default_max_file_size(),
            timeout_secs: default_transfer_timeout(),
            resolve_attempts: default_resolve_attempts(),
            resolve_backoff_ms: default_resolve_backoff(),
            job_retention_secs: default_job_retention(),
            session_retention_secs: default_session_retention(),
            sweep_interval_secs: default_sweep_interval(),
            notify_backend: false,
        }
    }
}

/// Credential authority configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsConfig {
    /// Base URL of the backend that issues credentials.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// How long a fetched record is served from cache, in seconds.
    #[serde(default = "default_credentials_ttl")]
    pub ttl_secs: u64,
    /// Timeout for calls to the authority, in seconds.
    #[serde(default = "default_authority_timeout")]
    pub request_timeout_secs: u64,
    /// Shared HS256 secret for local download token checks (empty = disabled).
    #[serde(default)]
    pub download_token_secret: String,
}

fn default_backend_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_credentials_ttl() -> u64 {
    3600 // 1 hour
}

fn default_authority_timeout() -> u64 {
    10
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            ttl_secs: default_credentials_ttl(),
            request_timeout_secs: default_authority_timeout(),
            download_token_secret: String::new(),
        }
    }
}

/// Which remote store implementation to wire at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBackend {
    /// Real bot API for the fast path.
    BotApi,
    /// In-process store for both paths (development only).
    Memory,
}

/// Remote object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Backend implementation.
    #[serde(default = "default_remote_backend")]
    pub backend: RemoteBackend,
    /// Base URL of the bot API.
    #[serde(default = "default_bot_api_base")]
    pub bot_api_base: String,
    /// Timeout for a single fast-API call, in seconds.
    #[serde(default = "default_remote_timeout")]
    pub request_timeout_secs: u64,
}

fn default_remote_backend() -> RemoteBackend {
    RemoteBackend::BotApi
}

fn default_bot_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_remote_timeout() -> u64 {
    300 // 5 minutes
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: default_remote_backend(),
            bot_api_base: default_bot_api_base(),
            request_timeout_secs: default_remote_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file (empty = console only).
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/telestore.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Transfer pipeline configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Credential authority configuration.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Remote store configuration.
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(TelestoreError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TelestoreError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `PORT`: listen port (set by most PaaS hosts)
    /// - `TELESTORE_BACKEND_URL`: credential authority base URL
    /// - `TELESTORE_DOWNLOAD_TOKEN_SECRET`: download token secret
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }

        if let Ok(url) = std::env::var("TELESTORE_BACKEND_URL") {
            if !url.is_empty() {
                self.credentials.backend_url = url;
            }
        }

        if let Ok(secret) = std::env::var("TELESTORE_DOWNLOAD_TOKEN_SECRET") {
            if !secret.is_empty() {
                self.credentials.download_token_secret = secret;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.max_chunk_size_mb == 0 {
            return Err(TelestoreError::Config(
                "transfer.max_chunk_size_mb must be greater than 0".to_string(),
            ));
        }
        if t.internal_chunk_size_kb == 0 {
            return Err(TelestoreError::Config(
                "transfer.internal_chunk_size_kb must be greater than 0".to_string(),
            ));
        }
        if t.upload_small_limit_mb > t.max_file_size_mb {
            return Err(TelestoreError::Config(
                "transfer.upload_small_limit_mb exceeds transfer.max_file_size_mb".to_string(),
            ));
        }
        if t.resolve_attempts == 0 {
            return Err(TelestoreError::Config(
                "transfer.resolve_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 10000);
        assert!(config.server.cors_origins.is_empty());

        assert_eq!(config.transfer.scratch_path, "data/uploads");
        assert_eq!(config.transfer.max_chunk_bytes(), 5 * 1024 * 1024);
        assert_eq!(config.transfer.internal_chunk_bytes(), 1024 * 1024);
        assert_eq!(config.transfer.upload_small_limit_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.transfer.download_small_limit_bytes(), 20 * 1024 * 1024);
        assert_eq!(config.transfer.max_file_bytes(), 2000 * 1024 * 1024);
        assert_eq!(config.transfer.timeout_secs, 1800);
        assert_eq!(config.transfer.resolve_attempts, 3);
        assert_eq!(config.transfer.job_retention_secs, 3600);
        assert!(!config.transfer.notify_backend);

        assert_eq!(config.credentials.ttl_secs, 3600);
        assert_eq!(config.credentials.request_timeout_secs, 10);
        assert!(config.credentials.download_token_secret.is_empty());

        assert_eq!(config.remote.backend, RemoteBackend::BotApi);
        assert_eq!(config.remote.bot_api_base, "https://api.telegram.org");

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/telestore.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 8080
cors_origins = ["http://localhost:3000"]

[transfer]
scratch_path = "/tmp/scratch"
max_chunk_size_mb = 8
internal_chunk_size_kb = 512
upload_small_limit_mb = 40
download_small_limit_mb = 10
max_file_size_mb = 1000
timeout_secs = 600
resolve_attempts = 5
resolve_backoff_ms = 100
job_retention_secs = 60
session_retention_secs = 120
sweep_interval_secs = 30
notify_backend = true

[credentials]
backend_url = "https://backend.example.com"
ttl_secs = 1200
request_timeout_secs = 5
download_token_secret = "secret"

[remote]
backend = "memory"
bot_api_base = "http://localhost:8081"
request_timeout_secs = 60

[logging]
level = "debug"
file = ""
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.cors_origins.len(), 1);

        assert_eq!(config.transfer.scratch_path, "/tmp/scratch");
        assert_eq!(config.transfer.max_chunk_bytes(), 8 * 1024 * 1024);
        assert_eq!(config.transfer.internal_chunk_bytes(), 512 * 1024);
        assert_eq!(config.transfer.upload_small_limit_mb, 40);
        assert_eq!(config.transfer.download_small_limit_mb, 10);
        assert_eq!(config.transfer.max_file_size_mb, 1000);
        assert_eq!(config.transfer.timeout(), Duration::from_secs(600));
        assert_eq!(config.transfer.resolve_attempts, 5);
        assert_eq!(config.transfer.resolve_backoff_ms, 100);
        assert_eq!(config.transfer.job_retention_secs, 60);
        assert_eq!(config.transfer.session_retention_secs, 120);
        assert_eq!(config.transfer.sweep_interval_secs, 30);
        assert!(config.transfer.notify_backend);

        assert_eq!(config.credentials.backend_url, "https://backend.example.com");
        assert_eq!(config.credentials.ttl_secs, 1200);
        assert_eq!(config.credentials.download_token_secret, "secret");

        assert_eq!(config.remote.backend, RemoteBackend::Memory);
        assert_eq!(config.remote.request_timeout_secs, 60);

        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.file.is_empty());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[transfer]
max_chunk_size_mb = 10
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.transfer.max_chunk_size_mb, 10);
        assert_eq!(config.transfer.upload_small_limit_mb, 50);
        assert_eq!(config.server.port, 10000);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");

        assert!(result.is_err());
        if let Err(TelestoreError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_parse_unknown_backend() {
        let result = Config::parse("[remote]\nbackend = \"carrier_pigeon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(TelestoreError::Io(_))));
    }

    #[test]
    fn test_apply_env_overrides_backend_url() {
        let original = std::env::var("TELESTORE_BACKEND_URL").ok();

        std::env::set_var("TELESTORE_BACKEND_URL", "https://env.example.com");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.credentials.backend_url, "https://env.example.com");

        if let Some(val) = original {
            std::env::set_var("TELESTORE_BACKEND_URL", val);
        } else {
            std::env::remove_var("TELESTORE_BACKEND_URL");
        }
    }

    #[test]
    fn test_validate_default() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_chunk_size() {
        let mut config = Config::default();
        config.transfer.max_chunk_size_mb = 0;

        let result = config.validate();
        assert!(matches!(result, Err(TelestoreError::Config(msg)) if msg.contains("max_chunk_size_mb")));
    }

    #[test]
    fn test_validate_small_limit_above_max() {
        let mut config = Config::default();
        config.transfer.upload_small_limit_mb = 3000;

        assert!(config.validate().is_err());
    }
}
