//! Guarantee monitoring
//!
//! A record is created when a review is approved and stays active until the
//! review disappears from the marketplace or the guarantee window closes.
//! The monitor worker calls `run_due_checks` periodically; checks can also
//! be reported directly with `report_check_result`.

use super::replacement::{ReplacementDispatcher, ReplacementOutcome};
use super::review::transition;
use super::{EngineContext, EngineSettings};
use crate::collaborators::{Actor, AuditEvent, AuditSeverity, ExistenceChecker};
use crate::db::models::*;
use crate::db::repository::{load_monitoring_record, load_review};
use crate::errors::{AppError, Result};
use crate::metrics;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Removal at exactly `validated_at + window` is still covered
pub fn is_guarantee_eligible(
    validated_at: DateTime<Utc>,
    removed_at: DateTime<Utc>,
    window: Duration,
) -> bool {
    removed_at - validated_at <= window
}

/// Result of one reported check
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckOutcome {
    StillPresent {
        /// The guarantee window closed with the review intact
        window_closed: bool,
    },
    Removed {
        review_id: Uuid,
        guarantee_eligible: bool,
        /// `None` when the review was outside the window or dispatch failed
        replacement: Option<ReplacementOutcome>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckSweepReport {
    pub checked: usize,
    pub still_present: usize,
    pub removed: usize,
    /// Window closed with the review intact
    pub expired: usize,
    /// Checker errors; retried one interval later
    pub inconclusive: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitoringStats {
    pub active: u64,
    pub due_now: u64,
    pub completed: u64,
    pub removed: u64,
    pub guarantee_eligible: u64,
    pub replacements_provided: u64,
    pub awaiting_replacement: u64,
}

enum SweepItem {
    Present,
    Expired,
    Removed,
    Inconclusive,
    Failed,
}

/// Create the monitoring record of a newly validated review.
///
/// Returns the existing record when the review is already monitored.
pub(crate) async fn start_monitoring<C: ConnectionTrait>(
    conn: &C,
    review: &Review,
    window_start: DateTime<Utc>,
    settings: &EngineSettings,
    now: DateTime<Utc>,
) -> Result<MonitoringRecord> {
    let existing = MonitoringRecordEntity::find()
        .filter(MonitoringRecordColumn::ReviewId.eq(review.id))
        .one(conn)
        .await?;
    if let Some(record) = existing {
        return Ok(record);
    }

    let record = MonitoringRecordActiveModel {
        id: Set(Uuid::new_v4()),
        review_id: Set(review.id),
        review_link: Set(review.review_link.clone()),
        window_start: Set(window_start.into()),
        window_end: Set((window_start + settings.guarantee_window).into()),
        next_check_at: Set((window_start + settings.check_interval).into()),
        last_checked_at: Set(None),
        check_count: Set(0),
        active: Set(true),
        still_exists: Set(true),
        removal_detected_at: Set(None),
        created_at: Set(now.into()),
    }
    .insert(conn)
    .await?;

    debug!(record_id = %record.id, review_id = %review.id, "Monitoring started");
    Ok(record)
}

/// Apply `changes` only while the record is still active.
///
/// Two reports racing on one record both pass the `active` read; only the
/// first update matches.
async fn update_if_active<C: ConnectionTrait>(
    conn: &C,
    record_id: Uuid,
    changes: MonitoringRecordActiveModel,
) -> Result<()> {
    let result = MonitoringRecordEntity::update_many()
        .set(changes)
        .filter(MonitoringRecordColumn::Id.eq(record_id))
        .filter(MonitoringRecordColumn::Active.eq(true))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::Conflict {
            message: format!("Monitoring record {} is no longer active", record_id),
        });
    }
    Ok(())
}

pub struct MonitoringScheduler {
    ctx: EngineContext,
}

impl MonitoringScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Active records whose next check is due, oldest first
    pub async fn due_records(&self, limit: u64) -> Result<Vec<MonitoringRecord>> {
        let now = self.ctx.clock.now().fixed_offset();
        MonitoringRecordEntity::find()
            .filter(MonitoringRecordColumn::Active.eq(true))
            .filter(MonitoringRecordColumn::NextCheckAt.lte(now))
            .order_by_asc(MonitoringRecordColumn::NextCheckAt)
            .limit(limit)
            .all(self.ctx.db.write())
            .await
            .map_err(Into::into)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn report_check_result(&self, record_id: Uuid, still_exists: bool) -> Result<CheckOutcome> {
        let now = self.ctx.clock.now();
        let settings = &self.ctx.settings;

        let txn = self.ctx.db.write().begin().await?;
        let record = load_monitoring_record(&txn, record_id).await?;
        if !record.active {
            return Err(AppError::Conflict {
                message: format!("Monitoring record {} is no longer active", record_id),
            });
        }

        let window_end = record.window_end.with_timezone(&Utc);
        let check_count = record.check_count + 1;
        let mut changes = MonitoringRecordActiveModel {
            last_checked_at: Set(Some(now.into())),
            check_count: Set(check_count),
            ..Default::default()
        };

        if still_exists {
            let window_closed = now >= window_end;
            changes.next_check_at = Set((now + settings.check_interval).into());
            if window_closed {
                changes.active = Set(false);
            }
            update_if_active(&txn, record_id, changes).await?;
            txn.commit().await?;

            metrics::record_check("present");
            if window_closed {
                info!(check_count, "Guarantee window closed with review intact");
            }
            return Ok(CheckOutcome::StillPresent { window_closed });
        }

        changes.active = Set(false);
        changes.still_exists = Set(false);
        changes.removal_detected_at = Set(Some(now.into()));
        update_if_active(&txn, record_id, changes).await?;

        let review = load_review(&txn, record.review_id).await?;
        let validated_at = review
            .validated_at
            .unwrap_or(record.window_start)
            .with_timezone(&Utc);
        // Computed once here and never again
        let eligible = review
            .guarantee_eligible
            .unwrap_or_else(|| is_guarantee_eligible(validated_at, now, settings.guarantee_window));

        let review = transition(
            &txn,
            review.id,
            &[ReviewStatus::Validated],
            "remove",
            ReviewActiveModel {
                status: Set(ReviewStatus::RemovedByAmazon),
                removed_from_marketplace: Set(true),
                removal_detected_at: Set(Some(now.into())),
                removal_date: Set(Some(now.into())),
                guarantee_eligible: Set(Some(eligible)),
                updated_at: Set(now.into()),
                ..Default::default()
            },
        )
        .await?;

        txn.commit().await?;

        metrics::record_check("removed");
        metrics::record_removal(eligible);
        let days_since_validation = (now - validated_at).num_days();
        warn!(
            review_id = %review.id,
            days_since_validation,
            guarantee_eligible = eligible,
            "Review removed from marketplace"
        );

        self.ctx
            .collaborators
            .audit(
                AuditEvent::new(Actor::System, "review.removed", "review", review.id)
                    .changes(serde_json::json!({
                        "record_id": record.id,
                        "days_since_validation": days_since_validation,
                        "guarantee_eligible": eligible,
                    }))
                    .severity(AuditSeverity::Warning),
            )
            .await;

        let replacement = if eligible {
            match ReplacementDispatcher::new(self.ctx.clone()).dispatch(&review).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    // The review stays awaiting replacement and can be redispatched
                    error!(review_id = %review.id, error = %e, "Replacement dispatch failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(CheckOutcome::Removed {
            review_id: review.id,
            guarantee_eligible: eligible,
            replacement,
        })
    }

    /// Push an inconclusive check one interval forward
    async fn defer_check(&self, record_id: Uuid) -> Result<()> {
        let next = self.ctx.clock.now() + self.ctx.settings.check_interval;
        MonitoringRecordEntity::update_many()
            .set(MonitoringRecordActiveModel {
                next_check_at: Set(next.into()),
                ..Default::default()
            })
            .filter(MonitoringRecordColumn::Id.eq(record_id))
            .filter(MonitoringRecordColumn::Active.eq(true))
            .exec(self.ctx.db.write())
            .await?;
        Ok(())
    }

    async fn check_one(&self, checker: &dyn ExistenceChecker, record: MonitoringRecord) -> SweepItem {
        let still_exists = match checker.still_published(&record.review_link).await {
            Ok(still_exists) => still_exists,
            Err(e) => {
                warn!(record_id = %record.id, error = %e, "Existence check inconclusive");
                metrics::record_check("inconclusive");
                metrics::record_collaborator_failure("existence_checker");
                return match self.defer_check(record.id).await {
                    Ok(()) => SweepItem::Inconclusive,
                    Err(e) => {
                        error!(record_id = %record.id, error = %e, "Failed to reschedule check");
                        SweepItem::Failed
                    }
                };
            }
        };

        match self.report_check_result(record.id, still_exists).await {
            Ok(CheckOutcome::StillPresent { window_closed: true }) => SweepItem::Expired,
            Ok(CheckOutcome::StillPresent { window_closed: false }) => SweepItem::Present,
            Ok(CheckOutcome::Removed { .. }) => SweepItem::Removed,
            Err(e) => {
                error!(record_id = %record.id, error = %e, "Failed to record check result");
                SweepItem::Failed
            }
        }
    }

    /// Check every due record; one record's failure never fails the sweep
    #[instrument(skip(self, checker))]
    pub async fn run_due_checks(&self, checker: &dyn ExistenceChecker) -> Result<CheckSweepReport> {
        let started = Instant::now();
        let due = self.due_records(self.ctx.settings.sweep_batch_size).await?;
        if due.is_empty() {
            debug!("No monitoring records due");
            return Ok(CheckSweepReport::default());
        }

        let items: Vec<SweepItem> = stream::iter(due)
            .map(|record| self.check_one(checker, record))
            .buffer_unordered(self.ctx.settings.max_concurrent_checks)
            .collect()
            .await;

        let mut report = CheckSweepReport {
            checked: items.len(),
            ..Default::default()
        };
        for item in items {
            match item {
                SweepItem::Present => report.still_present += 1,
                SweepItem::Expired => report.expired += 1,
                SweepItem::Removed => report.removed += 1,
                SweepItem::Inconclusive => report.inconclusive += 1,
                SweepItem::Failed => report.failed += 1,
            }
        }

        metrics::record_sweep(started.elapsed().as_secs_f64());
        info!(
            checked = report.checked,
            removed = report.removed,
            expired = report.expired,
            inconclusive = report.inconclusive,
            failed = report.failed,
            "Monitoring sweep completed"
        );

        Ok(report)
    }

    pub async fn stats(&self) -> Result<MonitoringStats> {
        let conn = self.ctx.db.read();
        let now = self.ctx.clock.now().fixed_offset();

        let records = || MonitoringRecordEntity::find();
        let reviews = || ReviewEntity::find();

        Ok(MonitoringStats {
            active: records()
                .filter(MonitoringRecordColumn::Active.eq(true))
                .count(conn)
                .await?,
            due_now: records()
                .filter(MonitoringRecordColumn::Active.eq(true))
                .filter(MonitoringRecordColumn::NextCheckAt.lte(now))
                .count(conn)
                .await?,
            completed: records()
                .filter(MonitoringRecordColumn::Active.eq(false))
                .filter(MonitoringRecordColumn::StillExists.eq(true))
                .count(conn)
                .await?,
            removed: records()
                .filter(MonitoringRecordColumn::StillExists.eq(false))
                .count(conn)
                .await?,
            guarantee_eligible: reviews()
                .filter(ReviewColumn::GuaranteeEligible.eq(true))
                .count(conn)
                .await?,
            replacements_provided: reviews()
                .filter(ReviewColumn::ReplacementProvided.eq(true))
                .count(conn)
                .await?,
            awaiting_replacement: reviews()
                .filter(ReviewColumn::Status.eq(ReviewStatus::RemovedByAmazon))
                .filter(ReviewColumn::GuaranteeEligible.eq(true))
                .filter(ReviewColumn::ReplacementProvided.eq(false))
                .count(conn)
                .await?,
        })
    }
}
