//! Guarantee monitoring handlers

use crate::extractors::AdminContext;
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use readerloop_common::{
    engine::{CheckOutcome, MonitoringStats},
    errors::Result,
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CheckResultRequest {
    pub still_exists: bool,
}

/// Result of an out-of-band existence check for one monitoring record
pub async fn report_check_result(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    Json(request): Json<CheckResultRequest>,
) -> Result<Json<CheckOutcome>> {
    Ok(Json(
        state
            .engine
            .report_check_result(record_id, request.still_exists)
            .await?,
    ))
}

pub async fn stats(
    State(state): State<AppState>,
    _admin: AdminContext,
) -> Result<Json<MonitoringStats>> {
    Ok(Json(state.engine.get_monitoring_stats().await?))
}
