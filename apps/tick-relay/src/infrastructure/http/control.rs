//! Stream control and lease inspection handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use super::{ApiError, SharedState};
use crate::application::services::{
    ControlError, InterestRequest, StartRequest, StartResponse, StopRequest, StopResponse,
    StreamHealth, SweepReport,
};
use crate::domain::lease::StreamLease;
use crate::domain::streaming::StreamKey;

/// Query for `/streams/health`.
#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    /// Stream key to inspect.
    pub stream_key: String,
}

/// Body of `/streams/interest` replies.
#[derive(Debug, Serialize)]
pub struct InterestResponse {
    /// Canonical stream key.
    pub stream_key: String,
    /// Whether a worker in this process took the new set.
    pub accepted: bool,
}

/// Body of `/streams` replies.
#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    /// Every lease in the store.
    pub leases: Vec<StreamLease>,
    /// Most recent health sweep.
    pub last_sweep: Option<SweepReport>,
    /// Streams with a worker in this process.
    pub local_streams: Vec<String>,
}

pub(super) async fn start_stream(
    State(state): State<SharedState>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(request) = payload?;
    tracing::info!(
        subscription_type = %request.subscription_type,
        instruments = request.instrument_keys.len(),
        background = request.background,
        "Start requested"
    );
    Ok(Json(state.controller.start(request).await?))
}

pub(super) async fn stop_stream(
    State(state): State<SharedState>,
    payload: Result<Json<StopRequest>, JsonRejection>,
) -> Result<Json<StopResponse>, ApiError> {
    let Json(request) = payload?;
    tracing::info!(stream_key = %request.stream_key, "Stop requested");
    Ok(Json(state.controller.stop(&request.stream_key).await?))
}

pub(super) async fn update_interest(
    State(state): State<SharedState>,
    payload: Result<Json<InterestRequest>, JsonRejection>,
) -> Result<Json<InterestResponse>, ApiError> {
    let Json(request) = payload?;
    let accepted = state
        .controller
        .update_interest(&request.stream_key, &request.instrument_keys)?;
    let stream_key: StreamKey = request.stream_key.parse().map_err(ControlError::from)?;
    Ok(Json(InterestResponse {
        stream_key: stream_key.to_string(),
        accepted,
    }))
}

pub(super) async fn stream_health(
    State(state): State<SharedState>,
    Query(query): Query<HealthQuery>,
) -> Result<Json<StreamHealth>, ApiError> {
    let stream_key: StreamKey = query.stream_key.parse().map_err(ControlError::from)?;
    let health = state
        .monitor
        .stream_health(&stream_key)
        .await
        .map_err(ControlError::from)?;
    Ok(Json(health))
}

pub(super) async fn list_streams(
    State(state): State<SharedState>,
) -> Result<Json<StreamsResponse>, ApiError> {
    let leases = state
        .registry
        .leases()
        .await
        .map_err(ControlError::from)?
        .into_iter()
        .map(|record| record.lease)
        .collect();
    Ok(Json(StreamsResponse {
        leases,
        last_sweep: state.monitor.last_report(),
        local_streams: state
            .controller
            .local_streams()
            .iter()
            .map(ToString::to_string)
            .collect(),
    }))
}
