//! Reader ledger handlers

use crate::extractors::{AdminContext, Identity};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use readerloop_common::{
    db::models::LedgerEntry,
    engine::{LedgerAdjustment, LedgerBalance},
    errors::Result,
};
use uuid::Uuid;

pub async fn balance(
    State(state): State<AppState>,
    identity: Identity,
    Path(reader_id): Path<Uuid>,
) -> Result<Json<LedgerBalance>> {
    identity.ensure_reader(reader_id)?;
    Ok(Json(state.engine.get_ledger_balance(reader_id).await?))
}

/// Full ledger history, oldest entry first
pub async fn entries(
    State(state): State<AppState>,
    identity: Identity,
    Path(reader_id): Path<Uuid>,
) -> Result<Json<Vec<LedgerEntry>>> {
    identity.ensure_reader(reader_id)?;
    Ok(Json(
        state
            .engine
            .repository()
            .ledger_entries_for_reader(reader_id)
            .await?,
    ))
}

/// Admin payout, bonus or reversal
pub async fn record_adjustment(
    State(state): State<AppState>,
    admin: AdminContext,
    Path(reader_id): Path<Uuid>,
    Json(adjustment): Json<LedgerAdjustment>,
) -> Result<(StatusCode, Json<LedgerEntry>)> {
    let entry = state
        .engine
        .record_ledger_adjustment(reader_id, adjustment, admin.admin_id)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}
