//! Notification sender capability
//!
//! Templating and delivery belong to the notification service; the engine
//! only emits an event kind, a recipient and a JSON payload.

use crate::errors::Result;
use crate::queue::{NotificationMessage, Queue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Events the engine tells users about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ReviewValidated,
    CompensationCredited,
    ReviewRejected,
    ResubmissionRequested,
    AssignmentReassigned,
    ReplacementScheduled,
    ReviewRemoved,
    IssueResolved,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ReviewValidated => "review_validated",
            EventKind::CompensationCredited => "compensation_credited",
            EventKind::ReviewRejected => "review_rejected",
            EventKind::ResubmissionRequested => "resubmission_requested",
            EventKind::AssignmentReassigned => "assignment_reassigned",
            EventKind::ReplacementScheduled => "replacement_scheduled",
            EventKind::ReviewRemoved => "review_removed",
            EventKind::IssueResolved => "issue_resolved",
        }
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, user_id: Uuid, kind: EventKind, data: serde_json::Value) -> Result<()>;
}

/// Drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl NotificationSender for NoopNotifier {
    async fn send(&self, _user_id: Uuid, _kind: EventKind, _data: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Writes notifications to the log; useful in development
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSender for LogNotifier {
    async fn send(&self, user_id: Uuid, kind: EventKind, data: serde_json::Value) -> Result<()> {
        info!(user_id = %user_id, kind = kind.as_str(), data = %data, "Notification");
        Ok(())
    }
}

/// Publishes notifications to the notification service's SQS queue
pub struct SqsNotifier {
    queue: Arc<Queue>,
}

impl SqsNotifier {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl NotificationSender for SqsNotifier {
    async fn send(&self, user_id: Uuid, kind: EventKind, data: serde_json::Value) -> Result<()> {
        let message = NotificationMessage {
            message_id: Uuid::new_v4(),
            user_id,
            kind,
            data,
        };
        self.queue.send(&message).await?;
        Ok(())
    }
}
