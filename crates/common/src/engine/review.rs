//! Review state machine
//!
//! `PENDING_SUBMISSION -> SUBMITTED -> VALIDATED | REJECTED | FLAGGED`, with
//! resubmission looping a review back to `PENDING_SUBMISSION` and monitoring
//! moving `VALIDATED -> REMOVED_BY_AMAZON`. Admin decisions arrive as one
//! closed `Decision` type with one handler per variant.

use super::compensation::{self, CompensationOutcome};
use super::issues::{self, NewIssue};
use super::{ledger, monitoring, EngineContext};
use crate::collaborators::{Actor, AuditEvent, AuditSeverity, EventKind};
use crate::db::models::*;
use crate::db::repository::{load_assignment, load_review};
use crate::errors::{AppError, ErrorCode, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewAction {
    Approve,
    Reject,
    Flag,
    RequestResubmission,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Reject => "reject",
            ReviewAction::Flag => "flag",
            ReviewAction::RequestResubmission => "request_resubmission",
        }
    }

    /// Review statuses this action may start from
    pub fn allowed_from(&self) -> &'static [ReviewStatus] {
        match self {
            // VALIDATED: a retried approval, which is an idempotent no-op
            ReviewAction::Approve => &[
                ReviewStatus::Submitted,
                ReviewStatus::Flagged,
                ReviewStatus::Validated,
            ],
            ReviewAction::Reject => &[ReviewStatus::Submitted, ReviewStatus::Flagged],
            ReviewAction::Flag => &[ReviewStatus::Submitted],
            ReviewAction::RequestResubmission => &[ReviewStatus::Submitted, ReviewStatus::Flagged],
        }
    }

    fn default_severity(&self) -> IssueSeverity {
        match self {
            ReviewAction::Reject => IssueSeverity::High,
            ReviewAction::Flag => IssueSeverity::Medium,
            _ => IssueSeverity::Low,
        }
    }
}

/// Issue fields supplied with a REJECT, FLAG or REQUEST_RESUBMISSION
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct IssueDetails {
    pub issue_type: Option<IssueType>,
    pub severity: Option<IssueSeverity>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    /// Reader-facing resubmission instructions
    #[validate(length(max = 5000))]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssueSpec {
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub description: String,
    pub instructions: Option<String>,
}

/// An admin decision on a review
#[derive(Debug, Clone)]
pub enum Decision {
    Approve,
    Reject(IssueSpec),
    Flag(IssueSpec),
    RequestResubmission(IssueSpec),
}

impl Decision {
    /// Build a decision, requiring an issue type for every action but APPROVE
    pub fn new(action: ReviewAction, details: Option<IssueDetails>) -> Result<Self> {
        if action == ReviewAction::Approve {
            return Ok(Decision::Approve);
        }

        let details = details.unwrap_or_default();
        details.validate()?;
        let issue_type = details.issue_type.ok_or_else(|| AppError::MissingIssueType {
            action: action.as_str().replace('_', " "),
        })?;

        let spec = IssueSpec {
            issue_type,
            severity: details.severity.unwrap_or_else(|| action.default_severity()),
            description: details
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| format!("{:?}", issue_type)),
            instructions: details.instructions.filter(|i| !i.trim().is_empty()),
        };

        Ok(match action {
            ReviewAction::Approve => Decision::Approve,
            ReviewAction::Reject => Decision::Reject(spec),
            ReviewAction::Flag => Decision::Flag(spec),
            ReviewAction::RequestResubmission => Decision::RequestResubmission(spec),
        })
    }

    pub fn action(&self) -> ReviewAction {
        match self {
            Decision::Approve => ReviewAction::Approve,
            Decision::Reject(_) => ReviewAction::Reject,
            Decision::Flag(_) => ReviewAction::Flag,
            Decision::RequestResubmission(_) => ReviewAction::RequestResubmission,
        }
    }
}

/// Reader submission of a review
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitReview {
    pub assignment_id: Uuid,
    #[validate(length(min = 1, max = 2048))]
    pub review_link: String,
    #[validate(range(min = 1, max = 5))]
    pub star_rating: i32,
    #[validate(length(max = 20000))]
    pub feedback_text: String,
    pub published_confirmed: bool,
    #[validate(range(min = 0, max = 100))]
    pub completion_percent: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub review_id: Uuid,
    pub code: ErrorCode,
    pub message: String,
}

/// Per-id outcome of a bulk decision
#[derive(Debug, Clone, Serialize)]
pub struct BulkDecisionReport {
    pub action: ReviewAction,
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<BulkFailure>,
}

/// What a reader may see of their own review
#[derive(Debug, Clone, Serialize)]
pub struct ReaderReviewView {
    pub review_id: Uuid,
    pub status: ReviewStatus,
    pub star_rating: i32,
    pub submitted_at: DateTimeWithTimeZone,
    pub validated_at: Option<DateTimeWithTimeZone>,
    pub compensation_paid: bool,
    pub resubmission_instructions: Option<String>,
    pub deadline_at: Option<DateTimeWithTimeZone>,
}

pub struct ReviewStateMachine {
    ctx: EngineContext,
}

fn ensure_allowed(review: &Review, action: ReviewAction) -> Result<()> {
    if action.allowed_from().contains(&review.status) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            review_id: review.id,
            status: review.status.to_string(),
            action: action.as_str().replace('_', " "),
        })
    }
}

/// Compare-and-set a review that must still be in one of `from`.
///
/// Fails with `InvalidTransition`, leaving the row untouched, when another
/// writer moved the review since it was read.
pub(crate) async fn transition<C: ConnectionTrait>(
    conn: &C,
    review_id: Uuid,
    from: &[ReviewStatus],
    action: &str,
    changes: ReviewActiveModel,
) -> Result<Review> {
    let result = ReviewEntity::update_many()
        .set(changes)
        .filter(ReviewColumn::Id.eq(review_id))
        .filter(ReviewColumn::Status.is_in(from.iter().copied()))
        .exec(conn)
        .await?;

    let review = load_review(conn, review_id).await?;
    if result.rows_affected == 0 {
        return Err(AppError::InvalidTransition {
            review_id,
            status: review.status.to_string(),
            action: action.to_string(),
        });
    }
    Ok(review)
}

/// Errors an approval attempt returns after losing a race with another writer
fn lost_race(err: &AppError) -> bool {
    err.is_unique_violation() || matches!(err, AppError::Conflict { .. })
}

/// Run `attempt` a second time when the first lost a race
async fn retry_once<T, F, Fut>(review_id: Uuid, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match attempt().await {
        Err(e) if lost_race(&e) => {
            // The retry sees what the concurrent approval committed
            warn!(review_id = %review_id, error = %e, "Concurrent approval detected, retrying");
            attempt().await
        }
        other => other,
    }
}

impl ReviewStateMachine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Create (or, after a resubmission request, replace) the review of an assignment
    #[instrument(skip(self, input), fields(reader_id = %reader_id, assignment_id = %input.assignment_id))]
    pub async fn submit(&self, reader_id: Uuid, input: SubmitReview) -> Result<Review> {
        input.validate()?;
        let min_chars = self.ctx.settings.min_feedback_chars;
        if input.feedback_text.trim().chars().count() < min_chars {
            return Err(AppError::Validation {
                message: format!("feedback must be at least {} characters", min_chars),
                field: Some("feedback_text".to_string()),
            });
        }

        let now = self.ctx.clock.now();
        let txn = self.ctx.db.write().begin().await?;

        let assignment = load_assignment(&txn, input.assignment_id).await?;
        if assignment.reader_id != reader_id {
            return Err(AppError::Forbidden {
                message: "assignment belongs to another reader".to_string(),
            });
        }

        let existing = ReviewEntity::find()
            .filter(ReviewColumn::AssignmentId.eq(assignment.id))
            .one(&txn)
            .await?;
        if matches!(&existing, Some(r) if r.status != ReviewStatus::PendingSubmission) {
            return Err(AppError::DuplicateReview {
                assignment_id: assignment.id,
            });
        }

        if !assignment.accepts_submission() {
            return Err(AppError::Conflict {
                message: format!(
                    "assignment {} is {:?} and does not accept submissions",
                    assignment.id, assignment.status
                ),
            });
        }
        if let Some(deadline) = assignment.deadline_at {
            if now > deadline.with_timezone(&Utc) {
                return Err(AppError::DeadlinePassed {
                    assignment_id: assignment.id,
                });
            }
        }

        let resubmission = existing.is_some();
        let review = match existing {
            Some(pending) => {
                let mut active = pending.into_active_model();
                active.review_link = Set(input.review_link);
                active.star_rating = Set(input.star_rating);
                active.feedback_text = Set(input.feedback_text);
                active.published_confirmed = Set(input.published_confirmed);
                active.completion_percent = Set(input.completion_percent);
                active.status = Set(ReviewStatus::Submitted);
                active.submitted_at = Set(now.into());
                active.updated_at = Set(now.into());
                active.update(&txn).await?
            }
            None => new_review(&assignment, input, now)
                .insert(&txn)
                .await
                .map_err(|e| {
                    let err = AppError::from(e);
                    if err.is_unique_violation() {
                        AppError::DuplicateReview {
                            assignment_id: assignment.id,
                        }
                    } else {
                        err
                    }
                })?,
        };

        let replaces = assignment.replaces_review_id;
        let mut active = assignment.into_active_model();
        active.status = Set(AssignmentStatus::Submitted);
        active.updated_at = Set(now.into());
        active.update(&txn).await?;

        if let Some(original_id) = replaces {
            ReviewEntity::update_many()
                .set(ReviewActiveModel {
                    replacement_review_id: Set(Some(review.id)),
                    updated_at: Set(now.into()),
                    ..Default::default()
                })
                .filter(ReviewColumn::Id.eq(original_id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        info!(review_id = %review.id, resubmission, "Review submitted");

        self.ctx
            .collaborators
            .audit(
                AuditEvent::new(Actor::Reader(reader_id), "review.submit", "review", review.id)
                    .changes(serde_json::json!({
                        "assignment_id": review.assignment_id,
                        "star_rating": review.star_rating,
                        "resubmission": resubmission,
                    })),
            )
            .await;

        Ok(review)
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    #[instrument(skip(self, decision), fields(review_id = %review_id, action = decision.action().as_str()))]
    pub async fn decide(&self, review_id: Uuid, decision: Decision, admin_id: Uuid) -> Result<Review> {
        let action = decision.action();
        let result = match decision {
            Decision::Approve => self.approve(review_id, admin_id).await,
            Decision::Reject(spec) => self.reject(review_id, spec, admin_id).await,
            Decision::Flag(spec) => self.flag(review_id, spec, admin_id).await,
            Decision::RequestResubmission(spec) => {
                self.request_resubmission(review_id, spec, admin_id).await
            }
        };

        metrics::record_decision(action.as_str(), result.is_ok());
        if let Err(ref e) = result {
            debug!(error = %e, "Decision refused");
        }
        result
    }

    /// Apply one action to many reviews; every id succeeds or fails on its own
    #[instrument(skip(self, review_ids, details), fields(count = review_ids.len(), action = action.as_str()))]
    pub async fn bulk_decide(
        &self,
        review_ids: &[Uuid],
        action: ReviewAction,
        details: Option<IssueDetails>,
        admin_id: Uuid,
    ) -> BulkDecisionReport {
        let mut report = BulkDecisionReport {
            action,
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let decision = match Decision::new(action, details) {
            Ok(decision) => decision,
            Err(e) => {
                report.failed = review_ids
                    .iter()
                    .map(|id| BulkFailure {
                        review_id: *id,
                        code: e.code(),
                        message: e.to_string(),
                    })
                    .collect();
                return report;
            }
        };

        for review_id in review_ids {
            match self.decide(*review_id, decision.clone(), admin_id).await {
                Ok(_) => report.succeeded.push(*review_id),
                Err(e) => report.failed.push(BulkFailure {
                    review_id: *review_id,
                    code: e.code(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Bulk decision completed"
        );
        report
    }

    async fn approve(&self, review_id: Uuid, admin_id: Uuid) -> Result<Review> {
        let approval = retry_once(review_id, move || self.approve_once(review_id, admin_id)).await?;

        let Approval {
            review,
            assignment,
            first_approval,
            compensation,
        } = approval;

        let format = match assignment.format {
            BookFormat::Ebook => "EBOOK",
            BookFormat::Audiobook => "AUDIOBOOK",
        };
        match compensation {
            CompensationOutcome::Paid { amount_cents, .. } => {
                metrics::record_compensation(format, amount_cents, true)
            }
            CompensationOutcome::AlreadyPaid => metrics::record_compensation(format, 0, false),
        }

        info!(
            first_approval,
            compensation = ?compensation,
            "Review approved"
        );

        let collaborators = &self.ctx.collaborators;
        if first_approval {
            collaborators
                .notify(
                    review.reader_id,
                    EventKind::ReviewValidated,
                    serde_json::json!({ "review_id": review.id, "book_id": review.book_id }),
                )
                .await;
        }
        if let CompensationOutcome::Paid { amount_cents, .. } = compensation {
            collaborators
                .notify(
                    review.reader_id,
                    EventKind::CompensationCredited,
                    serde_json::json!({ "review_id": review.id, "amount_cents": amount_cents }),
                )
                .await;
        }

        collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "review.approve", "review", review.id)
                    .changes(serde_json::json!({
                        "status": review.status,
                        "first_approval": first_approval,
                        "compensation": compensation,
                    })),
            )
            .await;

        Ok(review)
    }

    /// One attempt at the whole approval, in a single transaction
    async fn approve_once(&self, review_id: Uuid, admin_id: Uuid) -> Result<Approval> {
        let now = self.ctx.clock.now();
        let settings = &self.ctx.settings;
        let txn = self.ctx.db.write().begin().await?;

        let review = load_review(&txn, review_id).await?;
        ensure_allowed(&review, ReviewAction::Approve)?;
        let assignment = load_assignment(&txn, review.assignment_id).await?;

        let first_approval = review.status != ReviewStatus::Validated;
        let (review, assignment) = if first_approval {
            let validated = mark_validated(&txn, review.id, assignment, admin_id, now)
                .await
                .map_err(|e| match e {
                    AppError::InvalidTransition { review_id, status, .. } => AppError::Conflict {
                        message: format!("Review {} moved to {} during approval", review_id, status),
                    },
                    other => other,
                })?;
            issues::close_open_issues(&txn, review_id, admin_id, "Review approved", now).await?;
            validated
        } else {
            (review, assignment)
        };

        let validated_at = review
            .validated_at
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);
        monitoring::start_monitoring(&txn, &review, validated_at, settings, now).await?;

        let compensation =
            compensation::compensate(&txn, &review, &assignment, &settings.compensation, now).await?;

        txn.commit().await?;

        // Compensation changed the stored review
        let review = load_review(self.ctx.db.write(), review_id).await?;

        Ok(Approval {
            review,
            assignment,
            first_approval,
            compensation,
        })
    }

    async fn reject(&self, review_id: Uuid, spec: IssueSpec, admin_id: Uuid) -> Result<Review> {
        let now = self.ctx.clock.now();
        let txn = self.ctx.db.write().begin().await?;

        let review = load_review(&txn, review_id).await?;
        ensure_allowed(&review, ReviewAction::Reject)?;
        let assignment = load_assignment(&txn, review.assignment_id).await?;

        let review = transition(
            &txn,
            review.id,
            ReviewAction::Reject.allowed_from(),
            "reject",
            ReviewActiveModel {
                status: Set(ReviewStatus::Rejected),
                updated_at: Set(now.into()),
                ..Default::default()
            },
        )
        .await?;

        let mut issue = NewIssue::open(review.id, spec.issue_type, spec.severity, spec.description.clone());
        issue.status = IssueStatus::Resolved;
        issue.resolution = Some(format!("Review rejected: {}", spec.description));
        issue.admin_id = Some(admin_id);
        issue.reader_notified = true;
        issue.reassignment_triggered = true;
        let issue = issues::insert_issue(&txn, issue, now).await?;
        issues::refresh_open_issue_flag(&txn, review.id).await?;

        let assignment =
            issues::reassign(&txn, assignment, Some(admin_id), spec.description.clone(), now).await?;
        ledger::increment_rejections(&txn, review.reader_id, now).await?;

        txn.commit().await?;

        info!(issue_id = %issue.id, assignment_id = %assignment.id, "Review rejected");

        let collaborators = &self.ctx.collaborators;
        collaborators
            .notify(
                review.reader_id,
                EventKind::ReviewRejected,
                serde_json::json!({
                    "review_id": review.id,
                    "book_id": review.book_id,
                    "reason": spec.description,
                }),
            )
            .await;
        collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "review.reject", "review", review.id)
                    .changes(serde_json::json!({
                        "issue_id": issue.id,
                        "issue_type": issue.issue_type,
                        "assignment_id": assignment.id,
                    }))
                    .severity(AuditSeverity::Warning),
            )
            .await;

        self.reload(review_id).await
    }

    async fn flag(&self, review_id: Uuid, spec: IssueSpec, admin_id: Uuid) -> Result<Review> {
        let now = self.ctx.clock.now();
        let txn = self.ctx.db.write().begin().await?;

        let review = load_review(&txn, review_id).await?;
        ensure_allowed(&review, ReviewAction::Flag)?;

        let review = transition(
            &txn,
            review.id,
            ReviewAction::Flag.allowed_from(),
            "flag",
            ReviewActiveModel {
                status: Set(ReviewStatus::Flagged),
                updated_at: Set(now.into()),
                ..Default::default()
            },
        )
        .await?;

        let mut issue = NewIssue::open(review.id, spec.issue_type, spec.severity, spec.description);
        issue.admin_id = Some(admin_id);
        let issue = issues::insert_issue(&txn, issue, now).await?;
        issues::refresh_open_issue_flag(&txn, review.id).await?;

        txn.commit().await?;

        info!(issue_id = %issue.id, "Review flagged");

        self.ctx
            .collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "review.flag", "review", review.id)
                    .changes(serde_json::json!({
                        "issue_id": issue.id,
                        "issue_type": issue.issue_type,
                        "severity": issue.severity,
                    }))
                    .severity(AuditSeverity::Warning),
            )
            .await;

        self.reload(review_id).await
    }

    async fn request_resubmission(
        &self,
        review_id: Uuid,
        spec: IssueSpec,
        admin_id: Uuid,
    ) -> Result<Review> {
        let now = self.ctx.clock.now();
        let txn = self.ctx.db.write().begin().await?;

        let review = load_review(&txn, review_id).await?;
        ensure_allowed(&review, ReviewAction::RequestResubmission)?;
        let assignment = load_assignment(&txn, review.assignment_id).await?;

        let deadline =
            issues::extended_deadline(assignment.deadline_at, now, self.ctx.settings.default_resubmission);
        let instructions = spec.instructions.clone().unwrap_or_else(|| spec.description.clone());

        let (review, _) = issues::revert_for_resubmission(
            &txn,
            review.id,
            assignment,
            ReviewAction::RequestResubmission.allowed_from(),
            Some((deadline, instructions.clone())),
            now,
        )
        .await?;

        let mut issue = NewIssue::open(review.id, spec.issue_type, spec.severity, spec.description);
        issue.status = IssueStatus::ResubmissionPending;
        issue.admin_id = Some(admin_id);
        issue.reader_notified = true;
        issue.resubmission_requested = true;
        issue.resubmission_instructions = Some(instructions.clone());
        issue.resubmission_deadline = Some(deadline);
        let issue = issues::insert_issue(&txn, issue, now).await?;
        issues::refresh_open_issue_flag(&txn, review.id).await?;

        txn.commit().await?;

        info!(issue_id = %issue.id, deadline = %deadline, "Resubmission requested");

        let collaborators = &self.ctx.collaborators;
        collaborators
            .notify(
                review.reader_id,
                EventKind::ResubmissionRequested,
                serde_json::json!({
                    "review_id": review.id,
                    "instructions": instructions,
                    "deadline_at": deadline,
                }),
            )
            .await;
        collaborators
            .audit(
                AuditEvent::new(
                    Actor::Admin(admin_id),
                    "review.request_resubmission",
                    "review",
                    review.id,
                )
                .changes(serde_json::json!({ "issue_id": issue.id, "deadline_at": deadline })),
            )
            .await;

        self.reload(review_id).await
    }

    // ========================================================================
    // Compensation and reads
    // ========================================================================

    /// Pay a validated review outside the approval path
    #[instrument(skip(self), fields(review_id = %review_id))]
    pub async fn compensate(&self, review_id: Uuid) -> Result<CompensationOutcome> {
        let now = self.ctx.clock.now();
        let txn = self.ctx.db.write().begin().await?;

        let review = load_review(&txn, review_id).await?;
        if review.status != ReviewStatus::Validated {
            return Err(AppError::InvalidTransition {
                review_id,
                status: review.status.to_string(),
                action: "compensate".to_string(),
            });
        }
        let assignment = load_assignment(&txn, review.assignment_id).await?;

        let outcome =
            compensation::compensate(&txn, &review, &assignment, &self.ctx.settings.compensation, now)
                .await;
        let outcome = match outcome {
            Err(e) if e.is_unique_violation() => {
                txn.rollback().await?;
                return Ok(CompensationOutcome::AlreadyPaid);
            }
            other => other?,
        };
        txn.commit().await?;

        Ok(outcome)
    }

    pub async fn reader_view(&self, review_id: Uuid, reader_id: Uuid) -> Result<ReaderReviewView> {
        let conn = self.ctx.db.read();
        let review = load_review(conn, review_id).await?;
        if review.reader_id != reader_id {
            return Err(AppError::Forbidden {
                message: "review belongs to another reader".to_string(),
            });
        }

        let assignment = load_assignment(conn, review.assignment_id).await?;
        let latest_request = IssueEntity::find()
            .filter(IssueColumn::ReviewId.eq(review_id))
            .filter(IssueColumn::ResubmissionRequested.eq(true))
            .order_by_desc(IssueColumn::CreatedAt)
            .one(conn)
            .await?;

        let resubmission_instructions = if review.status == ReviewStatus::PendingSubmission {
            latest_request.and_then(|issue| issue.resubmission_instructions.or(issue.resolution))
        } else {
            None
        };

        Ok(ReaderReviewView {
            review_id: review.id,
            status: review.status,
            star_rating: review.star_rating,
            submitted_at: review.submitted_at,
            validated_at: review.validated_at,
            compensation_paid: review.compensation_paid,
            resubmission_instructions,
            deadline_at: assignment.deadline_at,
        })
    }

    async fn reload(&self, review_id: Uuid) -> Result<Review> {
        load_review(self.ctx.db.write(), review_id).await
    }
}

struct Approval {
    review: Review,
    assignment: Assignment,
    first_approval: bool,
    compensation: CompensationOutcome,
}

async fn mark_validated(
    txn: &DatabaseTransaction,
    review_id: Uuid,
    assignment: Assignment,
    admin_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(Review, Assignment)> {
    let review = transition(
        txn,
        review_id,
        &[ReviewStatus::Submitted, ReviewStatus::Flagged],
        "approve",
        ReviewActiveModel {
            status: Set(ReviewStatus::Validated),
            validated_at: Set(Some(now.into())),
            validated_by_admin_id: Set(Some(admin_id)),
            updated_at: Set(now.into()),
            ..Default::default()
        },
    )
    .await?;

    let mut active = assignment.into_active_model();
    active.status = Set(AssignmentStatus::Validated);
    active.validated_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    let assignment = active.update(txn).await?;

    Ok((review, assignment))
}

fn new_review(assignment: &Assignment, input: SubmitReview, now: DateTime<Utc>) -> ReviewActiveModel {
    ReviewActiveModel {
        id: Set(Uuid::new_v4()),
        assignment_id: Set(assignment.id),
        book_id: Set(assignment.book_id),
        reader_id: Set(assignment.reader_id),
        review_link: Set(input.review_link),
        star_rating: Set(input.star_rating),
        feedback_text: Set(input.feedback_text),
        published_confirmed: Set(input.published_confirmed),
        completion_percent: Set(input.completion_percent),
        status: Set(ReviewStatus::Submitted),
        submitted_at: Set(now.into()),
        validated_at: Set(None),
        validated_by_admin_id: Set(None),
        has_open_issue: Set(false),
        removed_from_marketplace: Set(false),
        removal_detected_at: Set(None),
        removal_date: Set(None),
        guarantee_eligible: Set(None),
        replacement_provided: Set(false),
        replacement_assignment_id: Set(None),
        replacement_review_id: Set(None),
        compensation_paid: Set(false),
        compensation_amount_cents: Set(None),
        compensation_paid_at: Set(None),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{feedback, harness, harness_with, t0, Harness};
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn approve(h: &Harness, review_id: Uuid) -> Result<Review> {
        h.engine
            .decide(review_id, ReviewAction::Approve, None, h.admin)
            .await
    }

    fn details(issue_type: IssueType) -> Option<IssueDetails> {
        Some(IssueDetails {
            issue_type: Some(issue_type),
            description: Some("Feedback does not match the book".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_decision_requires_issue_type() {
        for action in [ReviewAction::Reject, ReviewAction::Flag, ReviewAction::RequestResubmission] {
            let err = Decision::new(action, None).unwrap_err();
            assert!(matches!(err, AppError::MissingIssueType { .. }));
        }
        assert!(matches!(
            Decision::new(ReviewAction::Approve, None),
            Ok(Decision::Approve)
        ));
    }

    #[test]
    fn test_decision_defaults() {
        let decision = Decision::new(
            ReviewAction::Reject,
            Some(IssueDetails {
                issue_type: Some(IssueType::LowQuality),
                ..Default::default()
            }),
        )
        .unwrap();

        match decision {
            Decision::Reject(spec) => {
                assert_eq!(spec.severity, IssueSeverity::High);
                assert_eq!(spec.description, "LowQuality");
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_action_wire_names() {
        let action: ReviewAction = serde_json::from_str("\"REQUEST_RESUBMISSION\"").unwrap();
        assert_eq!(action, ReviewAction::RequestResubmission);
    }

    #[tokio::test]
    async fn test_submit_creates_submitted_review() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let assignment = h
            .assignment(&campaign, BookFormat::Ebook, AssignmentStatus::InProgress)
            .await;

        let review = h
            .engine
            .submit_review(assignment.reader_id, h.submission(&assignment))
            .await
            .unwrap();

        assert_eq!(review.status, ReviewStatus::Submitted);
        assert_eq!(review.book_id, campaign.book_id);
        assert_eq!(h.assignment_of(&review).await.status, AssignmentStatus::Submitted);
    }

    #[tokio::test]
    async fn test_submit_rejects_short_feedback() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let assignment = h
            .assignment(&campaign, BookFormat::Ebook, AssignmentStatus::InProgress)
            .await;

        let mut input = h.submission(&assignment);
        input.feedback_text = "Too short".into();
        let err = h
            .engine
            .submit_review(assignment.reader_id, input)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));

        let mut input = h.submission(&assignment);
        input.star_rating = 6;
        let err = h
            .engine
            .submit_review(assignment.reader_id, input)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_submit_twice_is_duplicate() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;
        let assignment = h.assignment_of(&review).await;

        let err = h
            .engine
            .submit_review(review.reader_id, h.submission(&assignment))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateReview { .. }));
    }

    #[tokio::test]
    async fn test_submit_for_someone_elses_assignment() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let assignment = h
            .assignment(&campaign, BookFormat::Ebook, AssignmentStatus::InProgress)
            .await;

        let err = h
            .engine
            .submit_review(Uuid::new_v4(), h.submission(&assignment))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn test_submit_after_deadline() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let assignment = h
            .assignment(&campaign, BookFormat::Ebook, AssignmentStatus::InProgress)
            .await;

        h.clock.advance(Duration::days(30));
        let err = h
            .engine
            .submit_review(assignment.reader_id, h.submission(&assignment))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DeadlinePassed { .. }));
    }

    #[tokio::test]
    async fn test_approve_pays_and_starts_monitoring() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let review = approve(&h, review.id).await.unwrap();

        assert_eq!(review.status, ReviewStatus::Validated);
        assert_eq!(review.validated_by_admin_id, Some(h.admin));
        assert!(review.compensation_paid);
        assert_eq!(review.compensation_amount_cents, Some(100));
        assert_eq!(h.assignment_of(&review).await.status, AssignmentStatus::Validated);

        let record = h
            .engine
            .repository()
            .find_monitoring_by_review(review.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.active);
        assert_eq!(record.window_end, t0() + Duration::days(14));

        let campaign = h.campaign_state(campaign.id).await;
        assert_eq!(campaign.credits_remaining, 9);
        assert_eq!(campaign.credits_consumed, 1);
        assert_eq!(campaign.reviews_delivered, 1);

        assert_eq!(
            h.notifier.kinds(),
            vec![EventKind::ReviewValidated, EventKind::CompensationCredited]
        );
    }

    #[tokio::test]
    async fn test_approve_twice_pays_once() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Audiobook).await;

        approve(&h, review.id).await.unwrap();
        approve(&h, review.id).await.unwrap();
        assert_eq!(
            h.engine.compensate(review.id).await.unwrap(),
            CompensationOutcome::AlreadyPaid
        );

        let repo = h.engine.repository();
        assert_eq!(repo.ledger_entries_for_review(review.id).await.unwrap().len(), 1);
        assert_eq!(repo.credit_entries_for_review(review.id).await.unwrap().len(), 1);

        let balance = h.engine.get_ledger_balance(review.reader_id).await.unwrap();
        assert_eq!(balance.balance_cents, 200);
        assert_eq!(balance.completed_reviews, 1);

        let campaign = h.campaign_state(campaign.id).await;
        assert_eq!(campaign.credits_remaining, 8);
        assert_eq!(campaign.reviews_delivered, 1);
    }

    #[tokio::test]
    async fn test_approval_retries_after_losing_the_ledger_race() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;
        let (review_id, reader_id) = (review.id, review.reader_id);

        let machine = h.engine.reviews();
        let attempts = AtomicUsize::new(0);
        let (h, machine, attempts) = (&h, &machine, &attempts);

        let approval = retry_once(review_id, move || async move {
            if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                return machine.approve_once(review_id, h.admin).await;
            }
            // Another approval commits first and this attempt's earning hits the guard
            approve(h, review_id).await?;
            let txn = h.engine.context().db.write().begin().await?;
            let err = ledger::credit_earning(&txn, reader_id, review_id, 100, "late".into(), t0())
                .await
                .unwrap_err();
            txn.rollback().await?;
            Err(err)
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(!approval.first_approval);
        assert_eq!(approval.compensation, CompensationOutcome::AlreadyPaid);
        assert_eq!(approval.review.status, ReviewStatus::Validated);

        let repo = h.engine.repository();
        assert_eq!(repo.ledger_entries_for_review(review_id).await.unwrap().len(), 1);
        assert_eq!(h.engine.get_ledger_balance(reader_id).await.unwrap().balance_cents, 100);
        assert_eq!(h.campaign_state(campaign.id).await.credits_remaining, 9);
    }

    #[test]
    fn test_only_lost_races_are_retried() {
        assert!(lost_race(&AppError::Conflict {
            message: "moved".into()
        }));
        assert!(!lost_race(&AppError::InvalidTransition {
            review_id: Uuid::new_v4(),
            status: "REJECTED".into(),
            action: "approve".into(),
        }));
    }

    #[tokio::test]
    async fn test_balance_conservation() {
        let h = harness().await;
        let campaign = h.campaign(100).await;
        let reader = Uuid::new_v4();

        let formats = [
            BookFormat::Ebook,
            BookFormat::Audiobook,
            BookFormat::Ebook,
            BookFormat::Ebook,
            BookFormat::Audiobook,
        ];
        for format in formats {
            let review = h.submitted_review_for(&campaign, reader, format).await;
            approve(&h, review.id).await.unwrap();
        }

        let balance = h.engine.get_ledger_balance(reader).await.unwrap();
        assert_eq!(balance.balance_cents, 3 * 100 + 2 * 200);
        assert_eq!(balance.lifetime_earned_cents, 700);

        let entries = h.engine.repository().ledger_entries_for_reader(reader).await.unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries.iter().map(|e| e.amount_cents).sum::<i64>(), 700);

        let credits = h
            .engine
            .repository()
            .credit_entries_for_campaign(campaign.id)
            .await
            .unwrap();
        assert_eq!(credits.iter().map(|e| e.amount).sum::<i32>(), -(3 + 2 * 2));
        assert_eq!(h.campaign_state(campaign.id).await.credits_remaining, 100 - 7);
    }

    #[tokio::test]
    async fn test_replacement_review_is_free_for_author() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let assignment = h
            .assignment(&campaign, BookFormat::Ebook, AssignmentStatus::InProgress)
            .await;
        let original = Uuid::new_v4();
        h.mark_replacement(assignment.id, original).await;

        let review = h
            .engine
            .submit_review(assignment.reader_id, h.submission(&assignment))
            .await
            .unwrap();
        let review = approve(&h, review.id).await.unwrap();

        assert_eq!(review.compensation_amount_cents, Some(100));
        assert!(h
            .engine
            .repository()
            .credit_entries_for_review(review.id)
            .await
            .unwrap()
            .is_empty());

        let campaign = h.campaign_state(campaign.id).await;
        assert_eq!(campaign.credits_remaining, 10);
        assert_eq!(campaign.reviews_delivered, 1);
    }

    #[tokio::test]
    async fn test_overdrawn_campaign_still_pays() {
        let h = harness().await;
        let campaign = h.campaign(1).await;
        let review = h.submitted_review(&campaign, BookFormat::Audiobook).await;

        approve(&h, review.id).await.unwrap();

        let credits = h.engine.repository().credit_entries_for_review(review.id).await.unwrap();
        assert_eq!(credits[0].balance_after, -1);
        assert_eq!(h.campaign_state(campaign.id).await.credits_remaining, -1);
    }

    #[tokio::test]
    async fn test_reject_without_issue_type_keeps_status() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let err = h
            .engine
            .decide(review.id, ReviewAction::Reject, None, h.admin)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::MissingIssueType { .. }));
        assert_eq!(err.code(), ErrorCode::MissingIssueType);
        assert_eq!(h.review(review.id).await.status, ReviewStatus::Submitted);
    }

    #[tokio::test]
    async fn test_reject_reassigns_and_counts() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let review = h
            .engine
            .decide(review.id, ReviewAction::Reject, details(IssueType::OffTopic), h.admin)
            .await
            .unwrap();

        assert_eq!(review.status, ReviewStatus::Rejected);
        assert!(!review.compensation_paid);

        let issues = h.engine.repository().issues_for_review(review.id).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].reassignment_triggered);
        assert!(issues[0].resolution.is_some());

        let assignment = h.assignment_of(&review).await;
        assert_eq!(assignment.status, AssignmentStatus::Reassigned);
        assert_eq!(assignment.reassigned_by, Some(h.admin));

        let balance = h.engine.get_ledger_balance(review.reader_id).await.unwrap();
        assert_eq!(balance.rejected_reviews, 1);
        assert_eq!(balance.balance_cents, 0);
        assert_eq!(h.notifier.kinds(), vec![EventKind::ReviewRejected]);
    }

    #[tokio::test]
    async fn test_reject_survives_notifier_failure() {
        let h = harness_with(true).await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let review = h
            .engine
            .decide(review.id, ReviewAction::Reject, details(IssueType::LowQuality), h.admin)
            .await
            .unwrap();

        assert_eq!(review.status, ReviewStatus::Rejected);
        assert_eq!(h.review(review.id).await.status, ReviewStatus::Rejected);
    }

    #[tokio::test]
    async fn test_approve_survives_collaborator_failure() {
        let h = harness_with(true).await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let review = approve(&h, review.id).await.unwrap();
        assert!(review.compensation_paid);
    }

    #[tokio::test]
    async fn test_flag_holds_assignment() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let review = h
            .engine
            .decide(review.id, ReviewAction::Flag, details(IssueType::SuspectedFraud), h.admin)
            .await
            .unwrap();

        assert_eq!(review.status, ReviewStatus::Flagged);
        assert!(review.has_open_issue);
        assert_eq!(h.assignment_of(&review).await.status, AssignmentStatus::Submitted);

        let issues = h.engine.repository().issues_for_review(review.id).await.unwrap();
        assert_eq!(issues[0].status, IssueStatus::Open);

        // A flagged review can still be approved
        let review = approve(&h, review.id).await.unwrap();
        assert_eq!(review.status, ReviewStatus::Validated);
    }

    #[tokio::test]
    async fn test_approving_flagged_review_closes_its_issue() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        h.engine
            .decide(review.id, ReviewAction::Flag, details(IssueType::SuspectedFraud), h.admin)
            .await
            .unwrap();
        let review = approve(&h, review.id).await.unwrap();

        assert_eq!(review.status, ReviewStatus::Validated);
        assert!(!review.has_open_issue);

        let issues = h.engine.repository().issues_for_review(review.id).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].status, IssueStatus::Resolved);
        assert_eq!(issues[0].resolution.as_deref(), Some("Review approved"));
        assert_eq!(issues[0].resolved_by_admin_id, Some(h.admin));
        assert!(issues[0].resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_stale_rejection_cannot_undo_approval() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;
        approve(&h, review.id).await.unwrap();

        // A rejection that read the review while it was still SUBMITTED
        let err = transition(
            h.engine.context().db.write(),
            review.id,
            ReviewAction::Reject.allowed_from(),
            "reject",
            ReviewActiveModel {
                status: Set(ReviewStatus::Rejected),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        match err {
            AppError::InvalidTransition { status, .. } => {
                assert_eq!(status, ReviewStatus::Validated.to_string())
            }
            other => panic!("unexpected error {:?}", other),
        }

        let review = h.review(review.id).await;
        assert_eq!(review.status, ReviewStatus::Validated);
        assert!(review.compensation_paid);
        assert_eq!(h.assignment_of(&review).await.status, AssignmentStatus::Validated);
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;
        approve(&h, review.id).await.unwrap();

        for action in [ReviewAction::Reject, ReviewAction::Flag, ReviewAction::RequestResubmission] {
            let err = h
                .engine
                .decide(review.id, action, details(IssueType::Other), h.admin)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::InvalidTransition { .. }), "{:?}", action);
        }
        assert_eq!(h.review(review.id).await.status, ReviewStatus::Validated);

        let err = approve(&h, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::ReviewNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resubmission_round_trip() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;
        let original_deadline = h.assignment_of(&review).await.deadline_at.unwrap();

        let review = h
            .engine
            .decide(
                review.id,
                ReviewAction::RequestResubmission,
                Some(IssueDetails {
                    issue_type: Some(IssueType::InsufficientLength),
                    instructions: Some("Add a paragraph about the ending".into()),
                    ..Default::default()
                }),
                h.admin,
            )
            .await
            .unwrap();

        assert_eq!(review.status, ReviewStatus::PendingSubmission);
        let assignment = h.assignment_of(&review).await;
        assert_eq!(assignment.status, AssignmentStatus::InProgress);
        assert!(assignment.deadline_at.unwrap() > original_deadline);

        let issues = h.engine.repository().issues_for_review(review.id).await.unwrap();
        assert_eq!(issues[0].status, IssueStatus::ResubmissionPending);
        assert!(issues[0].reader_notified);
        assert!(issues[0].resubmission_requested);

        let view = h.engine.reader_view(review.id, review.reader_id).await.unwrap();
        assert_eq!(
            view.resubmission_instructions.as_deref(),
            Some("Add a paragraph about the ending")
        );
        assert_eq!(view.deadline_at, assignment.deadline_at);

        // The reader resubmits in place
        let mut input = h.submission(&assignment);
        input.star_rating = 5;
        let resubmitted = h
            .engine
            .submit_review(review.reader_id, input)
            .await
            .unwrap();
        assert_eq!(resubmitted.id, review.id);
        assert_eq!(resubmitted.status, ReviewStatus::Submitted);
        assert_eq!(resubmitted.star_rating, 5);

        let review = approve(&h, review.id).await.unwrap();
        assert!(review.compensation_paid);
    }

    #[tokio::test]
    async fn test_bulk_approve_isolates_failures() {
        let h = harness().await;
        let campaign = h.campaign(100).await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(h.submitted_review(&campaign, BookFormat::Ebook).await.id);
        }
        h.engine
            .decide(ids[2], ReviewAction::Reject, details(IssueType::PolicyViolation), h.admin)
            .await
            .unwrap();

        let report = h
            .engine
            .bulk_decide(&ids, ReviewAction::Approve, None, h.admin)
            .await;

        assert_eq!(report.succeeded, vec![ids[0], ids[1], ids[3], ids[4]]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].review_id, ids[2]);
        assert_eq!(report.failed[0].code, ErrorCode::InvalidTransition);

        let repo = h.engine.repository();
        for id in [ids[0], ids[1], ids[3], ids[4]] {
            assert_eq!(repo.ledger_entries_for_review(id).await.unwrap().len(), 1);
        }
        assert!(repo.ledger_entries_for_review(ids[2]).await.unwrap().is_empty());
        assert_eq!(h.campaign_state(campaign.id).await.credits_remaining, 96);
    }

    #[tokio::test]
    async fn test_bulk_reject_without_type_fails_every_id() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let a = h.submitted_review(&campaign, BookFormat::Ebook).await;
        let b = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let report = h
            .engine
            .bulk_decide(&[a.id, b.id], ReviewAction::Reject, None, h.admin)
            .await;

        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.code == ErrorCode::MissingIssueType));
    }

    #[tokio::test]
    async fn test_reader_view_hides_other_readers() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let err = h.engine.reader_view(review.id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden { .. }));

        let view = h.engine.reader_view(review.id, review.reader_id).await.unwrap();
        assert_eq!(view.status, ReviewStatus::Submitted);
        assert!(!view.compensation_paid);
        assert_eq!(view.resubmission_instructions, None);
    }

    #[tokio::test]
    async fn test_compensate_requires_validated_review() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let review = h.submitted_review(&campaign, BookFormat::Ebook).await;

        let err = h.engine.compensate(review.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn test_feedback_fixture_is_long_enough() {
        assert!(feedback().chars().count() >= 150);
    }
}
