//! Review submission and admin decision handlers

use crate::extractors::{AdminContext, ReaderContext};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use readerloop_common::{
    collaborators::Actor,
    db::models::{Issue, Review, ReviewStatus},
    engine::{
        BulkDecisionReport, IssueDetails, ReaderReviewView, ReplacementOutcome, ReviewAction,
        SubmitReview,
    },
    errors::{AppError, Result},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound on ids accepted by one bulk decision
const MAX_BULK_REVIEWS: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub action: ReviewAction,
    /// Issue fields, required for every action but APPROVE
    #[serde(flatten)]
    pub details: IssueDetails,
}

#[derive(Debug, Deserialize)]
pub struct BulkDecisionRequest {
    pub review_ids: Vec<Uuid>,
    pub action: ReviewAction,
    #[serde(flatten)]
    pub details: IssueDetails,
}

#[derive(Debug, Deserialize)]
pub struct ListReviewsQuery {
    #[serde(default = "default_list_status")]
    pub status: ReviewStatus,
    #[serde(default)]
    pub offset: u64,
    #[serde(default = "default_list_limit")]
    pub limit: u64,
}

fn default_list_status() -> ReviewStatus {
    ReviewStatus::Submitted
}

fn default_list_limit() -> u64 {
    50
}

#[derive(Serialize)]
pub struct ReviewListResponse {
    pub reviews: Vec<Review>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Reader submits (or resubmits) the review for an assignment
pub async fn submit_review(
    State(state): State<AppState>,
    reader: ReaderContext,
    Json(request): Json<SubmitReview>,
) -> Result<(StatusCode, Json<Review>)> {
    let review = state.engine.submit_review(reader.reader_id, request).await?;

    tracing::info!(
        review_id = %review.id,
        reader_id = %reader.reader_id,
        "Review submitted"
    );

    Ok((StatusCode::CREATED, Json(review)))
}

/// Admin review queue, one status at a time
pub async fn list_reviews(
    State(state): State<AppState>,
    _admin: AdminContext,
    Query(query): Query<ListReviewsQuery>,
) -> Result<Json<ReviewListResponse>> {
    let limit = query.limit.clamp(1, 200);
    let (reviews, total) = state
        .engine
        .repository()
        .list_reviews_by_status(query.status, query.offset, limit)
        .await?;

    Ok(Json(ReviewListResponse {
        reviews,
        total,
        offset: query.offset,
        limit,
    }))
}

pub async fn get_review(
    State(state): State<AppState>,
    _admin: AdminContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Review>> {
    Ok(Json(state.engine.repository().get_review(id).await?))
}

pub async fn get_review_issues(
    State(state): State<AppState>,
    _admin: AdminContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Issue>>> {
    let repo = state.engine.repository();
    repo.get_review(id).await?;
    Ok(Json(repo.issues_for_review(id).await?))
}

/// Reader's view of their own review
pub async fn get_reader_review(
    State(state): State<AppState>,
    reader: ReaderContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ReaderReviewView>> {
    Ok(Json(state.engine.reader_view(id, reader.reader_id).await?))
}

/// Reader looks up the review filed against one of their assignments
pub async fn get_assignment_review(
    State(state): State<AppState>,
    reader: ReaderContext,
    Path(assignment_id): Path<Uuid>,
) -> Result<Json<ReaderReviewView>> {
    let review = state
        .engine
        .repository()
        .find_review_by_assignment(assignment_id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "Review for assignment".to_string(),
            id: assignment_id.to_string(),
        })?;

    Ok(Json(state.engine.reader_view(review.id, reader.reader_id).await?))
}

pub async fn decide(
    State(state): State<AppState>,
    admin: AdminContext,
    Path(id): Path<Uuid>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<Review>> {
    let review = state
        .engine
        .decide(id, request.action, Some(request.details), admin.admin_id)
        .await?;

    Ok(Json(review))
}

/// Apply one action to many reviews; per-id failures are reported, not raised
pub async fn bulk_decide(
    State(state): State<AppState>,
    admin: AdminContext,
    Json(request): Json<BulkDecisionRequest>,
) -> Result<Json<BulkDecisionReport>> {
    if request.review_ids.is_empty() {
        return Err(AppError::MissingField {
            field: "review_ids".to_string(),
        });
    }
    if request.review_ids.len() > MAX_BULK_REVIEWS {
        return Err(AppError::Validation {
            message: format!("At most {} reviews per bulk decision", MAX_BULK_REVIEWS),
            field: Some("review_ids".to_string()),
        });
    }

    let report = state
        .engine
        .bulk_decide(
            &request.review_ids,
            request.action,
            Some(request.details),
            admin.admin_id,
        )
        .await;

    tracing::info!(
        action = request.action.as_str(),
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        "Bulk decision applied"
    );

    Ok(Json(report))
}

/// Retry replacement dispatch for a removed review still awaiting one
pub async fn redispatch_replacement(
    State(state): State<AppState>,
    admin: AdminContext,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplacementOutcome>> {
    let outcome = state
        .engine
        .redispatch_replacement(id, Actor::Admin(admin.admin_id))
        .await?;
    Ok(Json(outcome))
}

/// Removed reviews of a book still owed a replacement
pub async fn pending_replacements(
    State(state): State<AppState>,
    _admin: AdminContext,
    Path(book_id): Path<Uuid>,
) -> Result<Json<Vec<Review>>> {
    Ok(Json(state.engine.pending_replacements(book_id).await?))
}
