//! External collaborators of the review engine
//!
//! Each collaborator is a capability trait with a no-op implementation, so
//! minimal deployments and tests never special-case a missing service.
//! Notification and audit failures are advisory: the `Collaborators`
//! helpers log them and carry on.

pub mod audit;
pub mod clock;
pub mod existence;
pub mod notify;
pub mod queue_provider;

pub use audit::{Actor, AuditEvent, AuditRecorder, AuditSeverity, LogAuditRecorder, NoopAuditRecorder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use existence::{ExistenceChecker, HttpExistenceChecker};
pub use notify::{EventKind, LogNotifier, NoopNotifier, NotificationSender, SqsNotifier};
pub use queue_provider::{DbQueueProvider, QueueProvider, QueuedAssignment};

use crate::metrics;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// The collaborators the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn NotificationSender>,
    pub audit: Arc<dyn AuditRecorder>,
    pub queue: Arc<dyn QueueProvider>,
}

impl Collaborators {
    pub fn new(
        notifier: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditRecorder>,
        queue: Arc<dyn QueueProvider>,
    ) -> Self {
        Self {
            notifier,
            audit,
            queue,
        }
    }

    /// Send a notification; failures are logged and swallowed
    pub async fn notify(&self, user_id: Uuid, kind: EventKind, data: serde_json::Value) {
        if let Err(e) = self.notifier.send(user_id, kind, data).await {
            warn!(
                user_id = %user_id,
                kind = kind.as_str(),
                error = %e,
                "Notification failed"
            );
            metrics::record_collaborator_failure("notifier");
        }
    }

    /// Record an audit event; failures are logged and swallowed
    pub async fn audit(&self, event: AuditEvent) {
        let action = event.action.clone();
        let entity_id = event.entity_id;
        if let Err(e) = self.audit.record(event).await {
            warn!(
                action = %action,
                entity_id = %entity_id,
                error = %e,
                "Audit record failed"
            );
            metrics::record_collaborator_failure("audit");
        }
    }
}
