//! Issue tracker
//!
//! Issues record problems raised against a review. Resolution can send the
//! review back to the reader for resubmission or take the assignment away
//! from them. `reviews.has_open_issue` is recomputed from the issues table
//! on every change.

use super::review::transition;
use super::EngineContext;
use crate::collaborators::{Actor, AuditEvent, AuditSeverity, EventKind};
use crate::db::models::*;
use crate::db::repository::{load_assignment, load_issue, load_review};
use crate::errors::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, PaginatorTrait,
    QueryFilter, Set, TransactionTrait,
};
use serde::Deserialize;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Standalone issue opened by an admin
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateIssue {
    pub issue_type: IssueType,
    #[serde(default = "default_severity")]
    pub severity: IssueSeverity,
    #[validate(length(min = 1, max = 5000))]
    pub description: String,
}

fn default_severity() -> IssueSeverity {
    IssueSeverity::Medium
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    pub notify_reader: bool,
    pub request_resubmission: bool,
    pub trigger_reassignment: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ResolveIssue {
    pub status: IssueStatus,
    #[validate(length(min = 1, max = 5000))]
    pub resolution: String,
    #[serde(flatten)]
    pub options: ResolveOptions,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ResubmissionRequest {
    #[validate(length(min = 1, max = 5000))]
    pub instructions: String,
    #[validate(range(min = 1, max = 720))]
    pub deadline_hours: i64,
}

/// Fields of an issue opened by the engine
pub(crate) struct NewIssue {
    pub review_id: Uuid,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub status: IssueStatus,
    pub description: String,
    pub resolution: Option<String>,
    pub admin_id: Option<Uuid>,
    pub reader_notified: bool,
    pub resubmission_requested: bool,
    pub reassignment_triggered: bool,
    pub resubmission_instructions: Option<String>,
    pub resubmission_deadline: Option<DateTime<Utc>>,
}

impl NewIssue {
    pub fn open(review_id: Uuid, issue_type: IssueType, severity: IssueSeverity, description: String) -> Self {
        Self {
            review_id,
            issue_type,
            severity,
            status: IssueStatus::Open,
            description,
            resolution: None,
            admin_id: None,
            reader_notified: false,
            resubmission_requested: false,
            reassignment_triggered: false,
            resubmission_instructions: None,
            resubmission_deadline: None,
        }
    }
}

pub(crate) async fn insert_issue<C: ConnectionTrait>(
    conn: &C,
    new: NewIssue,
    now: DateTime<Utc>,
) -> Result<Issue> {
    let closed = !new.status.is_open();
    let issue = IssueActiveModel {
        id: Set(Uuid::new_v4()),
        review_id: Set(new.review_id),
        issue_type: Set(new.issue_type),
        severity: Set(new.severity),
        status: Set(new.status),
        description: Set(new.description),
        resolution: Set(new.resolution),
        created_by_admin_id: Set(new.admin_id),
        resolved_by_admin_id: Set(if closed { new.admin_id } else { None }),
        resolved_at: Set(if closed { Some(now.into()) } else { None }),
        reader_notified: Set(new.reader_notified),
        resubmission_requested: Set(new.resubmission_requested),
        reassignment_triggered: Set(new.reassignment_triggered),
        resubmission_instructions: Set(new.resubmission_instructions),
        resubmission_deadline: Set(new.resubmission_deadline.map(Into::into)),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    };

    Ok(issue.insert(conn).await?)
}

/// Recompute the cached open-issue flag of a review
pub(crate) async fn refresh_open_issue_flag<C: ConnectionTrait>(
    conn: &C,
    review_id: Uuid,
) -> Result<bool> {
    let open = IssueEntity::find()
        .filter(IssueColumn::ReviewId.eq(review_id))
        .filter(IssueColumn::Status.is_in(IssueStatus::OPEN_STATUSES))
        .count(conn)
        .await?
        > 0;

    ReviewEntity::update_many()
        .col_expr(ReviewColumn::HasOpenIssue, Expr::value(open))
        .filter(ReviewColumn::Id.eq(review_id))
        .exec(conn)
        .await?;

    Ok(open)
}

/// Review statuses an issue resolution can request a resubmission from
const RESUBMITTABLE: [ReviewStatus; 4] = [
    ReviewStatus::Submitted,
    ReviewStatus::Flagged,
    ReviewStatus::Rejected,
    ReviewStatus::PendingSubmission,
];

fn accepts_resubmission(status: ReviewStatus) -> bool {
    RESUBMITTABLE.contains(&status)
}

/// First deadline strictly after both `now` and the current one
pub(crate) fn extended_deadline(
    current: Option<DateTimeWithTimeZone>,
    now: DateTime<Utc>,
    extension: Duration,
) -> DateTime<Utc> {
    let base = current
        .map(|d| d.with_timezone(&Utc))
        .map_or(now, |d| d.max(now));
    base + extension
}

/// Hand the review back to its reader.
///
/// Review returns to PENDING_SUBMISSION and the assignment to IN_PROGRESS;
/// a new deadline replaces the old one when given. The review must still be
/// in one of `from`.
pub(crate) async fn revert_for_resubmission<C: ConnectionTrait>(
    conn: &C,
    review_id: Uuid,
    assignment: Assignment,
    from: &[ReviewStatus],
    deadline: Option<(DateTime<Utc>, String)>,
    now: DateTime<Utc>,
) -> Result<(Review, Assignment)> {
    let review = transition(
        conn,
        review_id,
        from,
        "request resubmission for",
        ReviewActiveModel {
            status: Set(ReviewStatus::PendingSubmission),
            updated_at: Set(now.into()),
            ..Default::default()
        },
    )
    .await?;

    let mut assignment = assignment.into_active_model();
    assignment.status = Set(AssignmentStatus::InProgress);
    if let Some((deadline_at, reason)) = deadline {
        assignment.deadline_at = Set(Some(deadline_at.into()));
        assignment.deadline_extension_reason = Set(Some(reason));
    }
    assignment.updated_at = Set(now.into());
    let assignment = assignment.update(conn).await?;

    Ok((review, assignment))
}

/// Close every open issue of a review with `resolution`
pub(crate) async fn close_open_issues<C: ConnectionTrait>(
    conn: &C,
    review_id: Uuid,
    admin_id: Uuid,
    resolution: &str,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = IssueEntity::update_many()
        .set(IssueActiveModel {
            status: Set(IssueStatus::Resolved),
            resolution: Set(Some(resolution.to_string())),
            resolved_by_admin_id: Set(Some(admin_id)),
            resolved_at: Set(Some(now.into())),
            updated_at: Set(now.into()),
            ..Default::default()
        })
        .filter(IssueColumn::ReviewId.eq(review_id))
        .filter(IssueColumn::Status.is_in(IssueStatus::OPEN_STATUSES))
        .exec(conn)
        .await?;

    if result.rows_affected > 0 {
        debug!(review_id = %review_id, closed = result.rows_affected, "Open issues closed");
        refresh_open_issue_flag(conn, review_id).await?;
    }
    Ok(result.rows_affected)
}

/// Take the assignment away from its reader
pub(crate) async fn reassign<C: ConnectionTrait>(
    conn: &C,
    assignment: Assignment,
    admin_id: Option<Uuid>,
    reason: String,
    now: DateTime<Utc>,
) -> Result<Assignment> {
    let mut assignment = assignment.into_active_model();
    assignment.status = Set(AssignmentStatus::Reassigned);
    assignment.reassigned_at = Set(Some(now.into()));
    assignment.reassigned_by = Set(admin_id);
    assignment.reassignment_reason = Set(Some(reason));
    assignment.updated_at = Set(now.into());
    Ok(assignment.update(conn).await?)
}

pub struct IssueTracker {
    ctx: EngineContext,
}

impl IssueTracker {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Open a standalone issue; the review keeps its status
    #[instrument(skip(self, input), fields(review_id = %review_id))]
    pub async fn create(&self, review_id: Uuid, input: CreateIssue, admin_id: Uuid) -> Result<Issue> {
        input.validate()?;
        let now = self.ctx.clock.now();

        let txn = self.ctx.db.write().begin().await?;
        load_review(&txn, review_id).await?;

        let mut new = NewIssue::open(review_id, input.issue_type, input.severity, input.description);
        new.admin_id = Some(admin_id);
        let issue = insert_issue(&txn, new, now).await?;
        refresh_open_issue_flag(&txn, review_id).await?;
        txn.commit().await?;

        info!(issue_id = %issue.id, issue_type = ?issue.issue_type, "Issue opened");

        self.ctx
            .collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "issue.create", "issue", issue.id)
                    .changes(serde_json::json!({
                        "review_id": review_id,
                        "type": issue.issue_type,
                        "severity": issue.severity,
                    })),
            )
            .await;

        Ok(issue)
    }

    #[instrument(skip(self, input), fields(issue_id = %issue_id, status = ?input.status))]
    pub async fn resolve(&self, issue_id: Uuid, input: ResolveIssue, admin_id: Uuid) -> Result<Issue> {
        input.validate()?;
        let options = input.options;
        let now = self.ctx.clock.now();

        let txn = self.ctx.db.write().begin().await?;
        let issue = load_issue(&txn, issue_id).await?;
        if issue.status.is_closed() {
            return Err(AppError::Conflict {
                message: format!("Issue {} is already {:?}", issue_id, issue.status),
            });
        }

        let mut review = load_review(&txn, issue.review_id).await?;
        let mut assignment = load_assignment(&txn, review.assignment_id).await?;

        if options.request_resubmission {
            if !accepts_resubmission(review.status) {
                return Err(AppError::InvalidTransition {
                    review_id: review.id,
                    status: review.status.to_string(),
                    action: "request resubmission for".to_string(),
                });
            }
            let deadline = extended_deadline(
                assignment.deadline_at,
                now,
                self.ctx.settings.default_resubmission,
            );
            (review, assignment) = revert_for_resubmission(
                &txn,
                review.id,
                assignment,
                &RESUBMITTABLE,
                Some((deadline, input.resolution.clone())),
                now,
            )
            .await?;
        }

        if options.trigger_reassignment && assignment.status != AssignmentStatus::Reassigned {
            assignment = reassign(&txn, assignment, Some(admin_id), input.resolution.clone(), now).await?;
        }

        let notify_reader =
            options.notify_reader || options.request_resubmission || options.trigger_reassignment;

        let mut active = issue.into_active_model();
        active.status = Set(input.status);
        active.resolution = Set(Some(input.resolution.clone()));
        active.resolved_by_admin_id = Set(Some(admin_id));
        active.resolved_at = Set(Some(now.into()));
        active.reader_notified = Set(notify_reader);
        active.resubmission_requested = Set(options.request_resubmission);
        active.reassignment_triggered = Set(options.trigger_reassignment);
        active.updated_at = Set(now.into());
        let issue = active.update(&txn).await?;

        refresh_open_issue_flag(&txn, review.id).await?;
        txn.commit().await?;

        info!(
            review_id = %review.id,
            resubmission = options.request_resubmission,
            reassignment = options.trigger_reassignment,
            "Issue resolved"
        );

        let collaborators = &self.ctx.collaborators;
        if options.request_resubmission {
            collaborators
                .notify(
                    review.reader_id,
                    EventKind::ResubmissionRequested,
                    serde_json::json!({
                        "review_id": review.id,
                        "instructions": input.resolution,
                        "deadline_at": assignment.deadline_at,
                    }),
                )
                .await;
        }
        if options.trigger_reassignment {
            collaborators
                .notify(
                    review.reader_id,
                    EventKind::AssignmentReassigned,
                    serde_json::json!({
                        "assignment_id": assignment.id,
                        "book_id": assignment.book_id,
                        "reason": input.resolution,
                    }),
                )
                .await;
        }
        if options.notify_reader && !options.request_resubmission && !options.trigger_reassignment {
            collaborators
                .notify(
                    review.reader_id,
                    EventKind::IssueResolved,
                    serde_json::json!({
                        "review_id": review.id,
                        "resolution": input.resolution,
                    }),
                )
                .await;
        }

        collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "issue.resolve", "issue", issue.id)
                    .changes(serde_json::json!({
                        "status": issue.status,
                        "resubmission_requested": options.request_resubmission,
                        "reassignment_triggered": options.trigger_reassignment,
                    })),
            )
            .await;

        Ok(issue)
    }

    /// Give the reader `deadline_hours` from now to resubmit
    #[instrument(skip(self, request), fields(issue_id = %issue_id))]
    pub async fn request_resubmission_with_deadline(
        &self,
        issue_id: Uuid,
        request: ResubmissionRequest,
        admin_id: Uuid,
    ) -> Result<Issue> {
        request.validate()?;
        let now = self.ctx.clock.now();
        let deadline = now + Duration::hours(request.deadline_hours);

        let txn = self.ctx.db.write().begin().await?;
        let issue = load_issue(&txn, issue_id).await?;
        if issue.status.is_closed() {
            return Err(AppError::Conflict {
                message: format!("Issue {} is already {:?}", issue_id, issue.status),
            });
        }

        let review = load_review(&txn, issue.review_id).await?;
        if !accepts_resubmission(review.status) {
            return Err(AppError::InvalidTransition {
                review_id: review.id,
                status: review.status.to_string(),
                action: "request resubmission for".to_string(),
            });
        }
        let assignment = load_assignment(&txn, review.assignment_id).await?;

        let (review, _) = revert_for_resubmission(
            &txn,
            review.id,
            assignment,
            &RESUBMITTABLE,
            Some((deadline, request.instructions.clone())),
            now,
        )
        .await?;

        let mut active = issue.into_active_model();
        active.status = Set(IssueStatus::ResubmissionPending);
        active.reader_notified = Set(true);
        active.resubmission_requested = Set(true);
        active.resubmission_instructions = Set(Some(request.instructions.clone()));
        active.resubmission_deadline = Set(Some(deadline.into()));
        active.updated_at = Set(now.into());
        let issue = active.update(&txn).await?;

        refresh_open_issue_flag(&txn, review.id).await?;
        txn.commit().await?;

        info!(review_id = %review.id, deadline = %deadline, "Resubmission requested");

        self.ctx
            .collaborators
            .notify(
                review.reader_id,
                EventKind::ResubmissionRequested,
                serde_json::json!({
                    "review_id": review.id,
                    "instructions": request.instructions,
                    "deadline_at": deadline,
                }),
            )
            .await;

        self.ctx
            .collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "issue.request_resubmission", "issue", issue.id)
                    .changes(serde_json::json!({
                        "review_id": review.id,
                        "deadline_hours": request.deadline_hours,
                    }))
                    .severity(AuditSeverity::Info),
            )
            .await;

        Ok(issue)
    }
}
