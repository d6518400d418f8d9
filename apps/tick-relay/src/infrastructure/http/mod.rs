//! HTTP Server
//!
//! One axum server carries every external surface of the relay.
//!
//! # Endpoints
//!
//! - `POST /streams/start` - acquire a stream lease and connect upstream
//! - `POST /streams/stop` - stop a stream wherever it runs
//! - `POST /streams/interest` - change the instruments of a local stream
//! - `GET /streams/health?stream_key=` - per-stream lease health
//! - `GET /streams` - all leases plus the last sweep report
//! - `POST /quotes` - cache-first bulk latest prices
//! - `GET /ws` - push channel (WebSocket)
//! - `GET /health`, `/healthz`, `/readyz`, `/metrics` - process health

mod control;
mod health;
mod push;
mod quotes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::KeyValueStore;
use crate::application::services::{
    BulkQuoteService, ClientFanout, ControlError, HealthMonitor, StreamController,
    StreamRegistry, SubscriberBridge,
};
use crate::domain::streaming::ClientContract;

pub use health::{HealthResponse, HealthStatus};
pub use push::ClientRequest;

// =============================================================================
// State
// =============================================================================

/// Everything the handlers reach.
pub struct AppState {
    /// Start/stop control.
    pub controller: Arc<StreamController>,
    /// Bulk reads.
    pub quotes: Arc<BulkQuoteService>,
    /// Lease health.
    pub monitor: Arc<HealthMonitor>,
    /// Lease listing.
    pub registry: StreamRegistry,
    /// Push sessions.
    pub fanout: Arc<ClientFanout>,
    /// Broadcast topic subscription.
    pub bridge: Arc<SubscriberBridge>,
    /// Store, for readiness pings.
    pub store: Arc<dyn KeyValueStore>,
    /// Bound on a readiness ping.
    pub store_timeout: Duration,
    /// Contract sent to push clients.
    pub contract: ClientContract,
    /// Segment for bare instrument ids.
    pub default_segment: String,
    /// Build version.
    pub version: String,
    /// Process start.
    pub started_at: Instant,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("version", &self.version)
            .field("default_segment", &self.default_segment)
            .finish_non_exhaustive()
    }
}

/// Shared handler state.
pub type SharedState = Arc<AppState>;

/// Create the router with all endpoints.
#[must_use]
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/streams", get(control::list_streams))
        .route("/streams/start", post(control::start_stream))
        .route("/streams/stop", post(control::stop_stream))
        .route("/streams/interest", post(control::update_interest))
        .route("/streams/health", get(control::stream_health))
        .route("/quotes", post(quotes::bulk_quotes))
        .route("/ws", get(push::push_handler))
        .route("/health", get(health::health_handler))
        .route("/healthz", get(health::liveness_handler))
        .route("/readyz", get(health::readiness_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

// =============================================================================
// Server
// =============================================================================

/// HTTP server bound to one port.
pub struct HttpServer {
    port: u16,
    state: SharedState,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Create a new server.
    #[must_use]
    pub const fn new(port: u16, state: SharedState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if binding fails or the server encounters
    /// a fatal error while running.
    pub async fn run(self) -> Result<(), HttpServerError> {
        let app = create_router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HttpServerError::ServerFailed(e.to_string()))?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum HttpServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Errors
// =============================================================================

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable kind.
    pub status: &'static str,
    /// Human-readable detail.
    pub message: String,
}

/// Handler error.
#[derive(Debug)]
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(error: ControlError) -> Self {
        Self(error)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ControlError::InvalidRequest(rejection.body_text()))
    }
}

impl ApiError {
    const fn parts(&self) -> (StatusCode, &'static str) {
        match self.0 {
            ControlError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ControlError::UpstreamUnavailable(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
            ControlError::TemporarilyUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.parts();
        if code.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            status,
            message: self.0.to_string(),
        };
        (code, Json(body)).into_response()
    }
}
