//! Process health, readiness and metrics handlers.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AppState, SharedState};
use crate::application::ports::bounded;
use crate::application::services::SweepReport;
use crate::infrastructure::metrics::get_metrics_handle;

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Store reachable and broadcast topic subscribed.
    Healthy,
    /// One of the two is down.
    Degraded,
    /// Both are down.
    Unhealthy,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Relay version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Whether the shared store answered a ping.
    pub store_reachable: bool,
    /// Whether the broadcast subscription is live.
    pub broadcast_subscribed: bool,
    /// Streams with a worker in this process.
    pub local_streams: usize,
    /// Connected push sessions.
    pub push_sessions: usize,
    /// Most recent lease sweep.
    pub last_sweep: Option<SweepReport>,
}

pub(super) async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let response = build_health_response(&state).await;
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

pub(super) async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub(super) async fn readiness_handler(State(state): State<SharedState>) -> impl IntoResponse {
    // Ready once the store answers and ticks can reach push clients.
    if store_reachable(&state).await && state.bridge.is_subscribed() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

pub(super) async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

async fn build_health_response(state: &AppState) -> HealthResponse {
    let store_reachable = store_reachable(state).await;
    let broadcast_subscribed = state.bridge.is_subscribed();

    HealthResponse {
        status: determine_health_status(store_reachable, broadcast_subscribed),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        store_reachable,
        broadcast_subscribed,
        local_streams: state.controller.local_streams().len(),
        push_sessions: state.fanout.session_count(),
        last_sweep: state.monitor.last_report(),
    }
}

async fn store_reachable(state: &AppState) -> bool {
    bounded(state.store_timeout, state.store.ping()).await.is_ok()
}

const fn determine_health_status(store_reachable: bool, broadcast_subscribed: bool) -> HealthStatus {
    match (store_reachable, broadcast_subscribed) {
        (true, true) => HealthStatus::Healthy,
        (false, false) => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
    }

    #[test]
    fn status_from_dependencies() {
        assert_eq!(determine_health_status(true, true), HealthStatus::Healthy);
        assert_eq!(determine_health_status(true, false), HealthStatus::Degraded);
        assert_eq!(determine_health_status(false, true), HealthStatus::Degraded);
        assert_eq!(determine_health_status(false, false), HealthStatus::Unhealthy);
    }
}
