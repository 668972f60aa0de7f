//! Issue handlers

use crate::extractors::AdminContext;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use readerloop_common::{
    db::models::Issue,
    engine::{CreateIssue, ResolveIssue, ResubmissionRequest},
    errors::Result,
};
use uuid::Uuid;

pub async fn create_issue(
    State(state): State<AppState>,
    admin: AdminContext,
    Path(review_id): Path<Uuid>,
    Json(request): Json<CreateIssue>,
) -> Result<(StatusCode, Json<Issue>)> {
    let issue = state
        .engine
        .create_issue(review_id, request, admin.admin_id)
        .await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

pub async fn resolve_issue(
    State(state): State<AppState>,
    admin: AdminContext,
    Path(issue_id): Path<Uuid>,
    Json(request): Json<ResolveIssue>,
) -> Result<Json<Issue>> {
    Ok(Json(
        state
            .engine
            .resolve_issue(issue_id, request, admin.admin_id)
            .await?,
    ))
}

pub async fn request_resubmission(
    State(state): State<AppState>,
    admin: AdminContext,
    Path(issue_id): Path<Uuid>,
    Json(request): Json<ResubmissionRequest>,
) -> Result<Json<Issue>> {
    Ok(Json(
        state
            .engine
            .request_resubmission_with_deadline(issue_id, request, admin.admin_id)
            .await?,
    ))
}
