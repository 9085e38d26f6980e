use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::Method,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use hubshare_shared::session::SessionToken;
use hubshare_shared::types::AuditStatus;
use hubshare_shared::ShareError;
use hubshare_store::Database;

use crate::audit::AuditLog;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::peers::PeerDirectory;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::registry::Registry;
use crate::session;
use crate::tokens::TokenIssuer;

/// Everything a request handler or session actor may touch. Cloning is
/// cheap; every field is a handle onto shared state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub tokens: TokenIssuer,
    pub peers: PeerDirectory,
    pub audit: AuditLog,
    pub rate_limiter: RateLimiter,
    /// Per-nickname budget for requests on an open session.
    pub session_limiter: RateLimiter<String>,
    pub config: Arc<HubConfig>,
}

impl AppState {
    pub fn new(config: HubConfig, db: Database) -> Self {
        let db = Arc::new(Mutex::new(db));
        let registry = Registry::new(db.clone());
        let tokens = TokenIssuer::new(
            registry.clone(),
            chrono::Duration::seconds(config.token_ttl_secs),
        );

        Self {
            registry,
            tokens,
            peers: PeerDirectory::new(),
            audit: AuditLog::new(db),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            session_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(hub_info))
        .route("/ws", get(ws_upgrade))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct HubInfoResponse {
    name: String,
    version: &'static str,
    online_peers: usize,
    /// Files announced through `fileIndex` by the peers online now
    announced_files: usize,
    token_ttl_secs: i64,
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn hub_info(State(state): State<AppState>) -> Json<HubInfoResponse> {
    let online = state.peers.online().await;
    let mut announced_files = 0;
    for (nickname, _) in &online {
        announced_files += state.peers.index_of(nickname).await.len();
    }

    Json(HubInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online_peers: online.len(),
        announced_files,
        token_ttl_secs: state.config.token_ttl_secs,
    })
}

/// Authenticate the session credential before upgrading. A bad or missing
/// credential never reaches the WebSocket layer.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
) -> Result<Response, HubError> {
    let Some(raw) = params.token.as_deref() else {
        state
            .audit
            .login(None, AuditStatus::Denied, format!("missing credential from {remote_addr}"))
            .await;
        return Err(ShareError::AuthenticationFailed.into());
    };

    let token = match SessionToken::decode(raw) {
        Ok(token) => token,
        Err(e) => {
            state
                .audit
                .login(None, AuditStatus::Denied, format!("malformed credential from {remote_addr}"))
                .await;
            return Err(e.into());
        }
    };

    let nickname = match token.verify(&state.config.auth_pubkey) {
        Ok(nickname) => nickname.to_string(),
        Err(e) => {
            state
                .audit
                .login(
                    Some(&token.nickname),
                    AuditStatus::Denied,
                    format!("rejected credential from {remote_addr}"),
                )
                .await;
            return Err(e.into());
        }
    };

    state
        .audit
        .login(Some(&nickname), AuditStatus::Success, remote_addr.to_string())
        .await;

    Ok(ws
        .on_upgrade(move |socket| session::run(socket, state, nickname, remote_addr))
        .into_response())
}

/// Serve on an already bound listener until the future is dropped.
pub async fn serve_listener(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting hub HTTP/WebSocket server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_listener(state, listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    async fn spawn_hub(authority: &SigningKey) -> (SocketAddr, AppState) {
        let config = HubConfig {
            auth_pubkey: authority.verifying_key().to_bytes(),
            ..HubConfig::default()
        };
        let state = AppState::new(config, Database::open_in_memory().unwrap());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_listener(state.clone(), listener));
        (addr, state)
    }

    #[tokio::test]
    async fn rejects_missing_and_forged_credentials() {
        let authority = SigningKey::generate(&mut OsRng);
        let (addr, state) = spawn_hub(&authority).await;

        let missing = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
        assert!(missing.is_err());

        let forger = SigningKey::generate(&mut OsRng);
        let forged = SessionToken::create("alice", Utc::now() + Duration::hours(1), &forger);
        let url = format!("ws://{addr}/ws?token={}", forged.encode().unwrap());
        assert!(tokio_tungstenite::connect_async(url).await.is_err());

        let logins = state.audit.recent(10).await.unwrap();
        assert_eq!(logins.len(), 2);
        assert!(logins.iter().all(|e| e.status == AuditStatus::Denied));
        assert_eq!(logins[0].acting_user.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn accepts_valid_credential_and_greets() {
        use futures::StreamExt;
        use hubshare_shared::protocol::HubEvent;

        let authority = SigningKey::generate(&mut OsRng);
        let (addr, _state) = spawn_hub(&authority).await;

        let token = SessionToken::create("alice", Utc::now() + Duration::hours(1), &authority);
        let url = format!("ws://{addr}/ws?token={}", token.encode().unwrap());
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let event = HubEvent::from_json(frame.to_text().unwrap()).unwrap();
        assert_eq!(event, HubEvent::Welcome { nickname: "alice".into() });
    }
}
