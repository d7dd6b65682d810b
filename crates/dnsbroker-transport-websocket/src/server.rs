//! HTTP front door for tunnel sessions
//!
//! Routes:
//! - `GET /` greeting
//! - `GET /health` JSON status
//! - `GET <path>?uuid=<tenant>` WebSocket upgrade into a tunnel

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use dnsbroker_control::SessionAcceptor;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::stream::client_stream;

pub const DEFAULT_PATH: &str = "/dns";

const GREETING: &str = "dnsbroker: DNS over WebSocket relay\n";

#[derive(Debug, Error)]
pub enum WsServerError {
    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub bind_addr: SocketAddr,
    /// Path that accepts WebSocket upgrades
    pub path: String,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: DEFAULT_PATH.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub uuid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub tenants: usize,
    pub active_tunnels: usize,
}

pub struct WsServer {
    config: WsServerConfig,
    acceptor: SessionAcceptor,
}

impl WsServer {
    pub fn new(config: WsServerConfig, acceptor: SessionAcceptor) -> Self {
        Self { config, acceptor }
    }

    pub fn config(&self) -> &WsServerConfig {
        &self.config
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/health", get(health_check))
            .route(&self.config.path, get(connect))
            .layer(TraceLayer::new_for_http())
            .with_state(self.acceptor.clone())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), WsServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| WsServerError::BindError {
                address: self.config.bind_addr,
                reason: e.to_string(),
            })?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), WsServerError> {
        let local_addr = listener.local_addr()?;
        info!("Accepting tunnels on ws://{}{}", local_addr, self.config.path);

        let router = self.build_router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("WebSocket server stopped");
        Ok(())
    }
}

async fn index() -> &'static str {
    GREETING
}

async fn health_check(State(acceptor): State<SessionAcceptor>) -> Json<HealthResponse> {
    let registry = acceptor.registry();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tenants: registry.len(),
        active_tunnels: registry.active_tunnels(),
    })
}

async fn connect(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(acceptor): State<SessionAcceptor>,
) -> Response {
    debug!(peer = %peer, tenant = ?params.uuid, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| async move {
        let stream = client_stream(socket).with_peer_addr(peer);
        match acceptor.accept(params.uuid.as_deref(), stream).await {
            Ok(tunnel) => debug!(
                session = %tunnel.session_id(),
                tenant = %tunnel.tenant_id(),
                "Session handed to tunnel"
            ),
            Err(reason) => debug!(peer = %peer, "Session rejected: {}", reason),
        }
    })
}
