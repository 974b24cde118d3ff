//! WebSocket server run by each worker process.
//!
//! Accepts upgrades on any path (token and version travel in the query
//! string or headers), binds with `SO_REUSEPORT` so every worker shares the
//! same port, and shuts down gracefully on SIGINT/SIGTERM.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use websocketd_core::error::{Result, WebsocketdError};

use crate::app_state::AppState;
use crate::auth::MasterTenantCell;
use crate::config::Config;
use crate::session::SessionFactory;

/// Worker-process entry point.
pub async fn run_worker(config: Config) -> Result<()> {
    let master_tenant = Arc::new(MasterTenantCell::from_env()?);
    let state = AppState::new(config, master_tenant);
    WebsocketServer::new(state).serve().await
}

pub struct WebsocketServer {
    state: AppState,
}

impl WebsocketServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn serve(self) -> Result<()> {
        let websocket = &self.state.config().websocket;
        if websocket.certificate.is_some() || websocket.private_key.is_some() {
            tracing::warn!(
                "websocket.certificate/private_key are deprecated; terminate TLS at the reverse proxy"
            );
        }

        let addr: SocketAddr = format!("{}:{}", websocket.listen, websocket.port)
            .parse()
            .map_err(|e| {
                WebsocketdError::Internal(format!("invalid websocket.listen address: {e}"))
            })?;
        let listener = reuse_port_listener(addr)?;

        tracing::info!("starting websocket server on pid: {}", std::process::id());
        self.state.bus().start().await;

        let app = build_router(self.state.clone());
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        self.state.bus().stop().await;
        tracing::info!("stopping websocket server on pid: {}", std::process::id());

        served.map_err(|e| WebsocketdError::Internal(format!("server failed: {e}")))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new().fallback(get(ws_upgrade)).with_state(state)
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        SessionFactory::new(state)
            .run_session(socket, query, headers, remote)
            .await;
    })
}

/// `SO_REUSEPORT` listener: every worker binds the same port and the kernel
/// spreads accepted connections across them.
fn reuse_port_listener(addr: SocketAddr) -> Result<TcpListener> {
    let internal = |e: std::io::Error| WebsocketdError::Internal(format!("unable to bind: {e}"));

    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(internal)?;
    socket.set_reuse_address(true).map_err(internal)?;
    socket.set_reuse_port(true).map_err(internal)?;
    socket.bind(&addr.into()).map_err(internal)?;
    socket.listen(1024).map_err(internal)?;

    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true).map_err(internal)?;
    TcpListener::from_std(listener).map_err(internal)
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("unable to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
