use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use telestore::config::RemoteBackend;
use telestore::credentials::HttpAuthority;
use telestore::remote::{
    BotApiClient, FastStore, MemoryStore, SessionStore, UnconfiguredSessionStore,
};
use telestore::web::{AppState, WebServer};
use telestore::Config;

#[tokio::main]
async fn main() {
    // Load configuration
    let mut config = match Config::load("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };
    config.apply_env_overrides();

    // Initialize logging
    if let Err(e) = telestore::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        telestore::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        std::process::exit(1);
    }

    info!("TeleStore transfer worker");
    info!(
        "Server configured on {}:{}",
        config.server.host, config.server.port
    );

    if let Err(e) = run(config).await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> telestore::Result<()> {
    let authority = HttpAuthority::new(
        &config.credentials.backend_url,
        Duration::from_secs(config.credentials.request_timeout_secs),
    )?;

    let (fast, sessions): (Arc<dyn FastStore>, Arc<dyn SessionStore>) =
        match config.remote.backend {
            RemoteBackend::BotApi => {
                warn!(
                    "No session API client configured; transfers above the fast API limit will fail"
                );
                let client = BotApiClient::new(
                    &config.remote.bot_api_base,
                    Duration::from_secs(config.remote.request_timeout_secs),
                )?;
                let fast: Arc<dyn FastStore> = Arc::new(client);
                let sessions: Arc<dyn SessionStore> = Arc::new(UnconfiguredSessionStore);
                (fast, sessions)
            }
            RemoteBackend::Memory => {
                let memory = Arc::new(MemoryStore::new());
                let fast: Arc<dyn FastStore> = memory.clone();
                let sessions: Arc<dyn SessionStore> = memory;
                (fast, sessions)
            }
        };
    info!(backend = ?config.remote.backend, "Remote store configured");

    let state = AppState::new(&config, Arc::new(authority), fast, sessions)?;
    let server = WebServer::new(&config.server, Arc::new(state))?;

    server.run().await?;
    Ok(())
}
