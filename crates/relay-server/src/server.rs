//! `RelayServer`: Axum HTTP + WebSocket gateway over a [`SessionHub`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use relay_session::{OpsSnapshot, SessionHub};
use relay_settings::RelaySettings;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::IdentityVerifier;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session core.
    pub hub: Arc<SessionHub>,
    /// Token verification.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The relay gateway.
pub struct RelayServer {
    settings: RelaySettings,
    hub: Arc<SessionHub>,
    verifier: Arc<dyn IdentityVerifier>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    /// Create a server. Nothing is bound until [`listen`](Self::listen).
    pub fn new(
        settings: RelaySettings,
        hub: Arc<SessionHub>,
        verifier: Arc<dyn IdentityVerifier>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            settings,
            hub,
            verifier,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build the router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            verifier: Arc::clone(&self.verifier),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/ops", get(ops_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, start serving, and start the background sweeps.
    ///
    /// Returns the bound address and the serve task, which ends once
    /// shutdown begins.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        self.tasks
            .lock()
            .extend(self.hub.spawn_sweeps(&self.shutdown.token()));

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server error");
            }
        });

        info!(addr = %local_addr, "relay server listening");
        Ok((local_addr, handle))
    }

    /// Stop accepting work, stop the sweeps, and close every connection
    /// with `server_shutdown`.
    pub async fn shutdown(&self, timeout: Duration) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        self.shutdown
            .graceful_shutdown(handles, Some(timeout))
            .await;
        let closed = self.hub.shutdown(timeout).await;
        info!(connections = closed, "relay server stopped");
    }

    /// Session core.
    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    /// Shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Settings in effect.
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let auth_timeout = state.hub.settings().server.auth_timeout();
    let max_message_size = state.hub.settings().server.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state.hub, state.verifier, auth_timeout))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        &state.hub,
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /ops
async fn ops_handler(State(state): State<AppState>) -> Json<OpsSnapshot> {
    Json(state.hub.ops_snapshot())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
