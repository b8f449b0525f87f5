//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::relay::directory::RelayDirectory;
use crate::relay::dispatcher::Dispatcher;
use crate::relay::identity::Identity;
use crate::relay::session::run_ws_session;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry and identity mailboxes.
    pub directory: Arc<RelayDirectory>,
    /// Event router over `directory`.
    pub dispatcher: Dispatcher,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Resolved server configuration.
    pub config: Arc<ServerConfig>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
}

/// Query string of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Identity the connection claims.
    #[serde(rename = "callerId")]
    pub caller_id: Option<String>,
}

/// The signaling relay server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    directory: Arc<RelayDirectory>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: PrometheusHandle,
}

impl RelayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        Self {
            config: Arc::new(config),
            directory: Arc::new(RelayDirectory::new()),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            directory: self.directory.clone(),
            dispatcher: Dispatcher::new(self.directory.clone()),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve in the background.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task,
    /// which finishes once the shutdown token is cancelled.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let router = self.router();
        let token = self.shutdown.token();
        info!(%local_addr, "relay server listening");

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });

        Ok((local_addr, handle))
    }

    /// Get the directory.
    pub fn directory(&self) -> &Arc<RelayDirectory> {
        &self.directory
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn reject(status: StatusCode, reason: &'static str, message: &str) -> Response {
    counter!(WS_REJECTED_TOTAL, "reason" => reason).increment(1);
    debug!(reason, "rejecting upgrade");
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// GET /ws?callerId=<identity>
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(identity) = params.caller_id.and_then(Identity::parse) else {
        return reject(
            StatusCode::BAD_REQUEST,
            "missing_identity",
            "callerId is required",
        );
    };
    if state.shutdown.is_shutting_down() {
        return reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "server is shutting down",
        );
    }
    if state.directory.connection_count() >= state.config.max_connections {
        return reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "connection_limit",
            "connection limit reached",
        );
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            counter!(WS_REJECTED_TOTAL, "reason" => "not_websocket").increment(1);
            return rejection.into_response();
        }
    };

    let max_message_size = state.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let shutdown = state.shutdown.clone();
            let _ = shutdown.spawn_session(run_ws_session(socket, identity, state));
        })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.directory.connection_count(),
        state.directory.mailbox_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    crate::metrics::render(&state.metrics)
}
