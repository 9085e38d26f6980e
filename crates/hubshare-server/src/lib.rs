//! # hubshare-server
//!
//! The hub: authenticates peers, keeps the file registry and its access
//! control state, issues download tokens and records every security
//! decision in the audit log. It never sees file bytes.
//!
//! The binary in `main.rs` wires these pieces to a real database and
//! socket; tests and embedders use [`AppState`] and [`api::serve_listener`]
//! directly.

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod peers;
pub mod rate_limit;
pub mod registry;
pub mod session;
pub mod tokens;

use std::time::Duration;

pub use api::{build_router, AppState};
pub use config::HubConfig;
pub use error::{HubError, HubResult};

/// Spawn the periodic housekeeping tasks: expired token purge and stale
/// rate-limit bucket eviction.
pub fn spawn_maintenance(state: &AppState) {
    let tokens = state.tokens.clone();
    let period = Duration::from_secs(state.config.token_purge_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            tokens.purge_expired().await;
        }
    });

    // every 5 minutes, evict buckets idle for more than 10
    let http = state.rate_limiter.clone();
    let sessions = state.session_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http.purge_stale(600.0).await;
            sessions.purge_stale(600.0).await;
        }
    });
}
