//! Replacement dispatch after a guarantee violation
//!
//! The original assignment is marked reassigned and the book's earliest
//! waiting reader is promoted to scheduled-today. Promotion is a
//! compare-and-set in the queue provider that also marks the reader as the
//! replacement, so two removals racing on the same book cannot claim the
//! same reader and a promoted reader is never billed to the author. The
//! removed review records at most one replacement.

use super::EngineContext;
use crate::collaborators::{Actor, AuditEvent, AuditSeverity, EventKind, QueuedAssignment};
use crate::db::models::*;
use crate::db::repository::load_review;
use crate::errors::{AppError, Result};
use crate::metrics;
use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Waiting entries tried before giving up on a contended queue
const MAX_CLAIM_ATTEMPTS: usize = 5;

const GUARANTEE_VIOLATION: &str = "Guarantee violation: review removed from marketplace";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementOutcome {
    pub replacement_assigned: bool,
    pub assignment_id: Option<Uuid>,
}

pub struct ReplacementDispatcher {
    ctx: EngineContext,
}

impl ReplacementDispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Dispatch again for a removed review still waiting for its replacement
    #[instrument(skip(self), fields(review_id = %review_id))]
    pub async fn redispatch(&self, review_id: Uuid, actor: Actor) -> Result<ReplacementOutcome> {
        let review = load_review(self.ctx.db.write(), review_id).await?;
        if !review.awaiting_replacement() {
            return Err(AppError::Conflict {
                message: format!("Review {} is not awaiting a replacement", review_id),
            });
        }

        info!(actor = %actor, "Replacement redispatch requested");
        self.dispatch(&review).await
    }

    #[instrument(skip(self, review), fields(review_id = %review.id, book_id = %review.book_id))]
    pub async fn dispatch(&self, review: &Review) -> Result<ReplacementOutcome> {
        let now = self.ctx.clock.now();

        // 1. the original reader loses the assignment
        AssignmentEntity::update_many()
            .set(AssignmentActiveModel {
                status: Set(AssignmentStatus::Reassigned),
                reassigned_at: Set(Some(now.into())),
                reassigned_by: Set(None),
                reassignment_reason: Set(Some(GUARANTEE_VIOLATION.to_string())),
                updated_at: Set(now.into()),
                ..Default::default()
            })
            .filter(AssignmentColumn::Id.eq(review.assignment_id))
            .filter(AssignmentColumn::Status.ne(AssignmentStatus::Reassigned))
            .exec(self.ctx.db.write())
            .await?;

        // 2-3. reuse a reader an earlier dispatch promoted, else claim the earliest waiting one
        let promoted = match self.promoted_for(review.id).await? {
            Some(entry) => {
                debug!(assignment_id = %entry.assignment_id, "Reader already promoted for this review");
                Some(entry)
            }
            None => self.claim_next(review.book_id, review.id, now.date_naive()).await?,
        };

        let linked = match &promoted {
            Some(entry) => self.link(review.id, entry.assignment_id, now).await?,
            None => false,
        };
        if promoted.is_some() && !linked {
            warn!("Review already records a replacement");
        }

        let outcome = ReplacementOutcome {
            replacement_assigned: promoted.is_some(),
            assignment_id: promoted.as_ref().map(|e| e.assignment_id),
        };
        metrics::record_replacement(outcome.replacement_assigned);

        let collaborators = &self.ctx.collaborators;
        collaborators
            .notify(
                review.reader_id,
                EventKind::ReviewRemoved,
                serde_json::json!({ "review_id": review.id, "book_id": review.book_id }),
            )
            .await;
        if let (Some(entry), true) = (&promoted, linked) {
            collaborators
                .notify(
                    entry.reader_id,
                    EventKind::ReplacementScheduled,
                    serde_json::json!({
                        "assignment_id": entry.assignment_id,
                        "book_id": entry.book_id,
                        "scheduled_for": now.date_naive(),
                    }),
                )
                .await;
        }

        // 4. audit trail
        let days_since_validation = review
            .validated_at
            .map(|v| (now - v.with_timezone(&Utc)).num_days());
        collaborators
            .audit(
                AuditEvent::new(Actor::System, "review.replacement_dispatch", "review", review.id)
                    .changes(serde_json::json!({
                        "days_since_validation": days_since_validation,
                        "replacement_assigned": outcome.replacement_assigned,
                        "replacement_assignment_id": outcome.assignment_id,
                    }))
                    .severity(AuditSeverity::Warning),
            )
            .await;

        info!(
            replacement_assigned = outcome.replacement_assigned,
            days_since_validation = ?days_since_validation,
            "Replacement dispatched"
        );

        Ok(outcome)
    }

    /// A live assignment already promoted as the replacement of `review_id`
    async fn promoted_for(&self, review_id: Uuid) -> Result<Option<QueuedAssignment>> {
        let existing = AssignmentEntity::find()
            .filter(AssignmentColumn::ReplacesReviewId.eq(review_id))
            .filter(AssignmentColumn::Status.ne(AssignmentStatus::Reassigned))
            .one(self.ctx.db.write())
            .await?;
        Ok(existing.map(Into::into))
    }

    /// Record the replacement on the removed review unless one is recorded already
    async fn link(&self, review_id: Uuid, assignment_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = ReviewEntity::update_many()
            .set(ReviewActiveModel {
                replacement_provided: Set(true),
                replacement_assignment_id: Set(Some(assignment_id)),
                updated_at: Set(now.into()),
                ..Default::default()
            })
            .filter(ReviewColumn::Id.eq(review_id))
            .filter(ReviewColumn::ReplacementProvided.eq(false))
            .exec(self.ctx.db.write())
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn claim_next(
        &self,
        book_id: Uuid,
        review_id: Uuid,
        date: chrono::NaiveDate,
    ) -> Result<Option<QueuedAssignment>> {
        let queue = &self.ctx.collaborators.queue;

        for attempt in 0..MAX_CLAIM_ATTEMPTS {
            let Some(entry) = queue.next_waiting(book_id).await? else {
                debug!("No reader waiting in queue");
                return Ok(None);
            };
            if queue
                .promote_to_scheduled(entry.assignment_id, date, review_id)
                .await?
            {
                return Ok(Some(entry));
            }
            debug!(attempt, assignment_id = %entry.assignment_id, "Queue entry claimed elsewhere");
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CheckOutcome, ReviewAction};
    use crate::test_support::{harness, t0, Harness};
    use chrono::Duration;

    async fn approved_and_monitored(h: &Harness, campaign: &AuthorCampaign) -> (Review, Uuid) {
        let review = h.submitted_review(campaign, BookFormat::Ebook).await;
        let review = h
            .engine
            .decide(review.id, ReviewAction::Approve, None, h.admin)
            .await
            .unwrap();
        let record = h
            .engine
            .repository()
            .find_monitoring_by_review(review.id)
            .await
            .unwrap()
            .unwrap();
        (review, record.id)
    }

    #[tokio::test]
    async fn test_removal_promotes_waiting_reader() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let later = h.queued(&campaign, 2).await;
        let w2 = h.queued(&campaign, 1).await;

        let (r1, record_id) = approved_and_monitored(&h, &campaign).await;
        assert_eq!(
            h.engine.get_ledger_balance(r1.reader_id).await.unwrap().balance_cents,
            100
        );
        let ledger = h.engine.repository().ledger_entries_for_review(r1.id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].amount_cents, 100);

        h.clock.advance(Duration::days(10));
        let outcome = h.engine.report_check_result(record_id, false).await.unwrap();

        let replacement = match outcome {
            CheckOutcome::Removed {
                guarantee_eligible: true,
                replacement: Some(replacement),
                ..
            } => replacement,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(
            replacement,
            ReplacementOutcome {
                replacement_assigned: true,
                assignment_id: Some(w2.id),
            }
        );

        let repo = h.engine.repository();
        let promoted = repo.get_assignment(w2.id).await.unwrap();
        assert_eq!(promoted.status, AssignmentStatus::Scheduled);
        assert_eq!(promoted.scheduled_for, Some((t0() + Duration::days(10)).date_naive()));
        assert!(!promoted.is_buffer);
        assert_eq!(promoted.replaces_review_id, Some(r1.id));
        assert_eq!(repo.get_assignment(later.id).await.unwrap().status, AssignmentStatus::Waiting);

        let original = repo.get_assignment(r1.assignment_id).await.unwrap();
        assert_eq!(original.status, AssignmentStatus::Reassigned);
        assert_eq!(original.reassigned_by, None);
        assert_eq!(original.reassignment_reason.as_deref(), Some(GUARANTEE_VIOLATION));

        let r1 = h.review(r1.id).await;
        assert_eq!(r1.status, ReviewStatus::RemovedByAmazon);
        assert_eq!(r1.guarantee_eligible, Some(true));
        assert!(r1.replacement_provided);
        assert_eq!(r1.replacement_assignment_id, Some(w2.id));
        assert!(h.notifier.kinds().contains(&EventKind::ReplacementScheduled));
        assert!(h.audit.actions().contains(&"review.replacement_dispatch".to_string()));
    }

    #[tokio::test]
    async fn test_removal_with_empty_queue() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let (r1, record_id) = approved_and_monitored(&h, &campaign).await;

        h.clock.advance(Duration::days(10));
        let outcome = h.engine.report_check_result(record_id, false).await.unwrap();
        match outcome {
            CheckOutcome::Removed {
                guarantee_eligible: true,
                replacement: Some(replacement),
                ..
            } => {
                assert!(!replacement.replacement_assigned);
                assert_eq!(replacement.assignment_id, None);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let r1 = h.review(r1.id).await;
        assert!(r1.awaiting_replacement());
        assert_eq!(
            h.engine.repository().get_assignment(r1.assignment_id).await.unwrap().status,
            AssignmentStatus::Reassigned
        );
        assert_eq!(
            h.engine.pending_replacements(campaign.book_id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_redispatch_after_reader_joins() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let (r1, record_id) = approved_and_monitored(&h, &campaign).await;

        h.clock.advance(Duration::days(5));
        h.engine.report_check_result(record_id, false).await.unwrap();

        let joined = h.queued(&campaign, 1).await;
        let outcome = h
            .engine
            .redispatch_replacement(r1.id, Actor::Admin(h.admin))
            .await
            .unwrap();
        assert_eq!(outcome.assignment_id, Some(joined.id));
        assert!(h.engine.pending_replacements(campaign.book_id).await.unwrap().is_empty());

        // Nothing left to replace
        let err = h
            .engine
            .redispatch_replacement(r1.id, Actor::System)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_two_removals_never_share_a_reader() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let only = h.queued(&campaign, 1).await;
        let (a, record_a) = approved_and_monitored(&h, &campaign).await;
        let (b, record_b) = approved_and_monitored(&h, &campaign).await;

        h.clock.advance(Duration::days(3));
        let monitoring = h.engine.monitoring();
        let (first, second) = tokio::join!(
            monitoring.report_check_result(record_a, false),
            monitoring.report_check_result(record_b, false),
        );
        first.unwrap();
        second.unwrap();

        let a = h.review(a.id).await;
        let b = h.review(b.id).await;
        let assigned: Vec<_> = [a, b]
            .iter()
            .filter_map(|r| r.replacement_assignment_id)
            .collect();
        assert_eq!(assigned, vec![only.id]);
    }

    #[tokio::test]
    async fn test_redispatch_reuses_reader_promoted_before_a_crash() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let (r1, record_id) = approved_and_monitored(&h, &campaign).await;

        h.clock.advance(Duration::days(4));
        h.engine.report_check_result(record_id, false).await.unwrap();

        // Promoted as r1's replacement, but the review side was never written
        let first = h.queued(&campaign, 1).await;
        let orphan = h.queued(&campaign, 2).await;
        h.set_assignment_status(orphan.id, AssignmentStatus::Scheduled).await;
        h.mark_replacement(orphan.id, r1.id).await;

        let outcome = h
            .engine
            .redispatch_replacement(r1.id, Actor::Admin(h.admin))
            .await
            .unwrap();
        assert_eq!(outcome.assignment_id, Some(orphan.id));

        let repo = h.engine.repository();
        assert_eq!(repo.get_assignment(first.id).await.unwrap().status, AssignmentStatus::Waiting);
        let r1 = h.review(r1.id).await;
        assert!(r1.replacement_provided);
        assert_eq!(r1.replacement_assignment_id, Some(orphan.id));
    }

    #[tokio::test]
    async fn test_stale_dispatch_keeps_the_first_replacement() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let first = h.queued(&campaign, 1).await;
        let (stale, record_id) = approved_and_monitored(&h, &campaign).await;

        h.clock.advance(Duration::days(1));
        h.engine.report_check_result(record_id, false).await.unwrap();
        let second = h.queued(&campaign, 2).await;

        let outcome = h.engine.replacements().dispatch(&stale).await.unwrap();
        assert_eq!(outcome.assignment_id, Some(first.id));

        let repo = h.engine.repository();
        assert_eq!(repo.get_assignment(second.id).await.unwrap().status, AssignmentStatus::Waiting);
        assert_eq!(h.review(stale.id).await.replacement_assignment_id, Some(first.id));
        let scheduled = h
            .notifier
            .kinds()
            .into_iter()
            .filter(|k| *k == EventKind::ReplacementScheduled)
            .count();
        assert_eq!(scheduled, 1);
    }

    #[tokio::test]
    async fn test_replacement_review_links_back() {
        let h = harness().await;
        let campaign = h.campaign(10).await;
        let w2 = h.queued(&campaign, 1).await;
        let (r1, record_id) = approved_and_monitored(&h, &campaign).await;

        h.clock.advance(Duration::days(2));
        h.engine.report_check_result(record_id, false).await.unwrap();

        // The assignment subsystem starts the promoted assignment
        h.set_assignment_status(w2.id, AssignmentStatus::InProgress).await;
        let replacement = h
            .engine
            .submit_review(w2.reader_id, h.submission(&w2))
            .await
            .unwrap();

        assert_eq!(h.review(r1.id).await.replacement_review_id, Some(replacement.id));
    }
}
