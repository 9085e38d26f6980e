//! # hubshare-hub
//!
//! Hub server binary. Reads its configuration from the environment, opens
//! the SQLite database and serves the HTTP/WebSocket API until Ctrl+C.

use tracing::info;
use tracing_subscriber::EnvFilter;

use hubshare_server::{api, spawn_maintenance, AppState, HubConfig};
use hubshare_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,hubshare_server=debug,hubshare_store=info")
            }),
        )
        .init();

    info!("Starting hubshare hub v{}", env!("CARGO_PKG_VERSION"));

    let config = HubConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.auth_pubkey == [0u8; 32] {
        tracing::warn!("HUB_AUTH_PUBKEY is not set, every session will be rejected");
    }

    let db = Database::open_at(&config.database_path)?;
    let http_addr = config.http_addr;
    let state = AppState::new(config, db);

    spawn_maintenance(&state);

    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
