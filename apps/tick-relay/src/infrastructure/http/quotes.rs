//! Bulk quote handler.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;

use super::{ApiError, SharedState};
use crate::application::services::{QuoteRequest, QuoteResponse};

pub(super) async fn bulk_quotes(
    State(state): State<SharedState>,
    payload: Result<Json<QuoteRequest>, JsonRejection>,
) -> Result<Json<QuoteResponse>, ApiError> {
    let Json(request) = payload?;
    Ok(Json(state.quotes.get_quotes(&request.instrument_keys).await?))
}
