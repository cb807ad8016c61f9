use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::tls::{load_server_config, TlsPaths};
use super::{FixedWindowLimiter, ProxyService};
use crate::config_sync::ConfigStore;
use crate::reporters::RequestCounters;
use crate::session::SessionState;
use crate::types::{HealthCheckResult, HealthStatus, ProxyRequest};

#[derive(Clone)]
pub struct ServerState {
    pub node_id: String,
    pub proxy: Arc<ProxyService>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub counters: RequestCounters,
    pub config: ConfigStore,
    pub session: watch::Receiver<SessionState>,
    pub health: watch::Receiver<Option<HealthCheckResult>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/v1/proxy", post(proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /v1/proxy - Forward an AI request upstream
async fn proxy(State(state): State<ServerState>, Json(req): Json<ProxyRequest>) -> Response {
    if !state.limiter.try_acquire() {
        let retry_after = state.limiter.retry_after().as_secs().max(1);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            Json(json!({"success": false, "error": "rate limit exceeded"})),
        )
            .into_response();
    }

    let _active = state.counters.track();
    Json(state.proxy.handle(req).await).into_response()
}

/// GET /health - Latest health check, 503 when unhealthy
async fn health(State(state): State<ServerState>) -> Response {
    let latest = state.health.borrow().clone();
    match latest {
        Some(result) => {
            let code = if result.status == HealthStatus::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (code, Json(result)).into_response()
        }
        None => (
            StatusCode::OK,
            Json(json!({"nodeId": state.node_id, "status": "starting"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    node_id: String,
    session: SessionState,
    config_version: Option<String>,
    enabled_services: usize,
    active_connections: u64,
    total_requests: u64,
}

/// GET /status - Session and configuration summary
async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    let session = *state.session.borrow();
    Json(StatusResponse {
        node_id: state.node_id.clone(),
        session,
        config_version: state.config.version(),
        enabled_services: state.config.enabled_service_count(),
        active_connections: state.counters.active(),
        total_requests: state.counters.total(),
    })
}

/// The local listener, bound and with TLS material loaded before anything
/// else starts.
pub struct LocalServer {
    listener: std::net::TcpListener,
    tls: Option<RustlsConfig>,
}

impl LocalServer {
    pub fn bind(addr: SocketAddr, tls: Option<&TlsPaths>) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("Failed to bind local server to {}", addr))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;

        let tls = tls
            .map(|paths| load_server_config(paths).map(|c| RustlsConfig::from_config(Arc::new(c))))
            .transpose()?;

        Ok(Self { listener, tls })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local server address")
    }

    /// Serve until `cancel` fires, then drain in-flight requests.
    pub async fn run(self, app: Router, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;

        match self.tls {
            None => {
                info!("Local server listening on http://{}", addr);
                let listener = tokio::net::TcpListener::from_std(self.listener)?;
                axum::serve(listener, app)
                    .with_graceful_shutdown(cancel.cancelled_owned())
                    .await?;
            }
            Some(config) => {
                info!("Local server listening on https://{}", addr);
                let handle = Handle::new();
                let shutdown = handle.clone();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
                });

                axum_server::from_tcp_rustls(self.listener, config)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
        }

        info!("Local server stopped");
        Ok(())
    }
}
