//! Review lifecycle engine
//!
//! The five components share one `EngineContext`:
//! - `ledger`: append-only reader ledger and running balances
//! - `review`: the review state machine and its admin decisions
//! - `monitoring`: the guarantee window existence checks
//! - `replacement`: promotion of the next queued reader after a removal
//! - `issues`: problems raised against a review and their resolution
//!
//! `ReviewEngine` is the surface the gateway and the monitor worker use.

pub mod compensation;
pub mod issues;
pub mod ledger;
pub mod monitoring;
pub mod replacement;
pub mod review;

pub use compensation::CompensationOutcome;
pub use issues::{CreateIssue, IssueTracker, ResolveIssue, ResolveOptions, ResubmissionRequest};
pub use ledger::{LedgerAdjustment, LedgerBalance};
pub use monitoring::{
    is_guarantee_eligible, CheckOutcome, CheckSweepReport, MonitoringScheduler, MonitoringStats,
};
pub use replacement::{ReplacementDispatcher, ReplacementOutcome};
pub use review::{
    BulkDecisionReport, BulkFailure, Decision, IssueDetails, ReaderReviewView, ReviewAction,
    ReviewStateMachine, SubmitReview,
};

use crate::collaborators::{
    Actor, Clock, Collaborators, DbQueueProvider, LogAuditRecorder, LogNotifier, NoopNotifier,
    NotificationSender, SqsNotifier, SystemClock,
};
use crate::config::{AppConfig, CompensationConfig};
use crate::db::models::{LedgerEntry, Review};
use crate::db::{DbPool, Repository};
use crate::errors::{AppError, Result};
use crate::queue::{Queue, QueueConfig};
use chrono::Duration;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// The configuration the engine components read
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub compensation: CompensationConfig,
    pub guarantee_window: Duration,
    pub check_interval: Duration,
    pub sweep_batch_size: u64,
    pub max_concurrent_checks: usize,
    pub min_feedback_chars: usize,
    pub default_resubmission: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            compensation: config.compensation.clone(),
            guarantee_window: Duration::days(config.monitoring.guarantee_window_days),
            check_interval: Duration::hours(config.monitoring.check_interval_hours),
            sweep_batch_size: config.monitoring.batch_size.max(1),
            max_concurrent_checks: config.monitoring.max_concurrent_checks.max(1),
            min_feedback_chars: config.review.min_feedback_chars,
            default_resubmission: Duration::hours(config.review.default_resubmission_hours),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            compensation: CompensationConfig::default(),
            guarantee_window: Duration::days(14),
            check_interval: Duration::hours(24),
            sweep_batch_size: 200,
            max_concurrent_checks: 8,
            min_feedback_chars: 150,
            default_resubmission: Duration::hours(72),
        }
    }
}

/// Shared handles of every engine component
#[derive(Clone)]
pub struct EngineContext {
    pub db: DbPool,
    pub collaborators: Collaborators,
    pub clock: Arc<dyn Clock>,
    pub settings: Arc<EngineSettings>,
}

/// Build the collaborators a deployment is configured for
pub async fn collaborators_from_config(
    config: &AppConfig,
    db: &DbPool,
    clock: Arc<dyn Clock>,
) -> Result<Collaborators> {
    let notifier: Arc<dyn NotificationSender> = match config.notifications.provider.as_str() {
        "log" => Arc::new(LogNotifier),
        "none" => Arc::new(NoopNotifier),
        "sqs" => {
            let url = config.notifications.queue_url.clone().ok_or_else(|| {
                AppError::Configuration {
                    message: "notifications.queue_url is required for the sqs provider"
                        .to_string(),
                }
            })?;
            let queue = Queue::new(QueueConfig {
                url,
                ..Default::default()
            })
            .await?;
            Arc::new(SqsNotifier::new(Arc::new(queue)))
        }
        other => {
            return Err(AppError::Configuration {
                message: format!("Unknown notification provider: {}", other),
            })
        }
    };

    info!(provider = %config.notifications.provider, "Notification sender configured");

    Ok(Collaborators::new(
        notifier,
        Arc::new(LogAuditRecorder),
        Arc::new(DbQueueProvider::new(db.clone(), clock)),
    ))
}

/// Facade over the engine components
#[derive(Clone)]
pub struct ReviewEngine {
    ctx: EngineContext,
}

impl ReviewEngine {
    pub fn new(
        db: DbPool,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ctx: EngineContext {
                db,
                collaborators,
                clock,
                settings: Arc::new(settings),
            },
        }
    }

    /// Engine with the system clock and the configured collaborators
    pub async fn from_config(config: &AppConfig, db: DbPool) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let collaborators = collaborators_from_config(config, &db, clock.clone()).await?;
        Ok(Self::new(
            db,
            collaborators,
            clock,
            EngineSettings::from_config(config),
        ))
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn repository(&self) -> Repository {
        Repository::new(self.ctx.db.clone())
    }

    pub fn reviews(&self) -> ReviewStateMachine {
        ReviewStateMachine::new(self.ctx.clone())
    }

    pub fn issues(&self) -> IssueTracker {
        IssueTracker::new(self.ctx.clone())
    }

    pub fn monitoring(&self) -> MonitoringScheduler {
        MonitoringScheduler::new(self.ctx.clone())
    }

    pub fn replacements(&self) -> ReplacementDispatcher {
        ReplacementDispatcher::new(self.ctx.clone())
    }

    // ========================================================================
    // Review lifecycle
    // ========================================================================

    pub async fn submit_review(&self, reader_id: Uuid, input: SubmitReview) -> Result<Review> {
        self.reviews().submit(reader_id, input).await
    }

    pub async fn decide(
        &self,
        review_id: Uuid,
        action: ReviewAction,
        details: Option<IssueDetails>,
        admin_id: Uuid,
    ) -> Result<Review> {
        let decision = Decision::new(action, details)?;
        self.reviews().decide(review_id, decision, admin_id).await
    }

    pub async fn bulk_decide(
        &self,
        review_ids: &[Uuid],
        action: ReviewAction,
        details: Option<IssueDetails>,
        admin_id: Uuid,
    ) -> BulkDecisionReport {
        self.reviews()
            .bulk_decide(review_ids, action, details, admin_id)
            .await
    }

    /// Pay a validated review; a second call is a no-op
    pub async fn compensate(&self, review_id: Uuid) -> Result<CompensationOutcome> {
        self.reviews().compensate(review_id).await
    }

    pub async fn reader_view(&self, review_id: Uuid, reader_id: Uuid) -> Result<ReaderReviewView> {
        self.reviews().reader_view(review_id, reader_id).await
    }

    // ========================================================================
    // Issues
    // ========================================================================

    pub async fn create_issue(
        &self,
        review_id: Uuid,
        input: CreateIssue,
        admin_id: Uuid,
    ) -> Result<crate::db::models::Issue> {
        self.issues().create(review_id, input, admin_id).await
    }

    pub async fn resolve_issue(
        &self,
        issue_id: Uuid,
        input: ResolveIssue,
        admin_id: Uuid,
    ) -> Result<crate::db::models::Issue> {
        self.issues().resolve(issue_id, input, admin_id).await
    }

    pub async fn request_resubmission_with_deadline(
        &self,
        issue_id: Uuid,
        request: ResubmissionRequest,
        admin_id: Uuid,
    ) -> Result<crate::db::models::Issue> {
        self.issues()
            .request_resubmission_with_deadline(issue_id, request, admin_id)
            .await
    }

    // ========================================================================
    // Monitoring and replacement
    // ========================================================================

    pub async fn report_check_result(
        &self,
        record_id: Uuid,
        still_exists: bool,
    ) -> Result<CheckOutcome> {
        self.monitoring()
            .report_check_result(record_id, still_exists)
            .await
    }

    pub async fn get_monitoring_stats(&self) -> Result<MonitoringStats> {
        self.monitoring().stats().await
    }

    pub async fn redispatch_replacement(
        &self,
        review_id: Uuid,
        actor: Actor,
    ) -> Result<ReplacementOutcome> {
        self.replacements().redispatch(review_id, actor).await
    }

    pub async fn pending_replacements(&self, book_id: Uuid) -> Result<Vec<Review>> {
        self.repository().reviews_awaiting_replacement(book_id).await
    }

    // ========================================================================
    // Ledger
    // ========================================================================

    pub async fn get_ledger_balance(&self, reader_id: Uuid) -> Result<LedgerBalance> {
        ledger::balance(self.ctx.db.read(), reader_id).await
    }

    pub async fn record_ledger_adjustment(
        &self,
        reader_id: Uuid,
        adjustment: LedgerAdjustment,
        admin_id: Uuid,
    ) -> Result<LedgerEntry> {
        ledger::Ledger::new(self.ctx.clone())
            .record_adjustment(reader_id, adjustment, admin_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_default_config() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "database": { "url": "sqlite::memory:" }
        }))
        .unwrap();

        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.guarantee_window, Duration::days(14));
        assert_eq!(settings.check_interval, Duration::hours(24));
        assert_eq!(settings.min_feedback_chars, 150);
        assert_eq!(settings.compensation.ebook_payout_cents, 100);
    }
}
