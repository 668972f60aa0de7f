//! Audit recorder capability
//!
//! Audit persistence lives outside the engine. Every state transition is
//! described as an `AuditEvent`; recording it is advisory.

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

/// Who performed an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Admin(Uuid),
    Reader(Uuid),
    /// The engine itself (monitoring, replacement dispatch)
    System,
}

impl Actor {
    /// Admin id to stamp on records, if an admin acted
    pub fn admin_id(&self) -> Option<Uuid> {
        match self {
            Actor::Admin(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Admin(id) => write!(f, "admin:{}", id),
            Actor::Reader(id) => write!(f, "reader:{}", id),
            Actor::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: Actor,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub changes: serde_json::Value,
    pub severity: AuditSeverity,
}

impl AuditEvent {
    pub fn new(actor: Actor, action: &str, entity_type: &str, entity_id: Uuid) -> Self {
        Self {
            actor,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            changes: serde_json::Value::Null,
            severity: AuditSeverity::Info,
        }
    }

    pub fn changes(mut self, changes: serde_json::Value) -> Self {
        self.changes = changes;
        self
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditRecorder;

#[async_trait]
impl AuditRecorder for NoopAuditRecorder {
    async fn record(&self, _event: AuditEvent) -> Result<()> {
        Ok(())
    }
}

/// Emits audit events as structured log lines under the `audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditRecorder;

#[async_trait]
impl AuditRecorder for LogAuditRecorder {
    async fn record(&self, event: AuditEvent) -> Result<()> {
        info!(
            target: "audit",
            actor = %event.actor,
            action = %event.action,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            severity = ?event.severity,
            changes = %event.changes,
            "Audit event"
        );
        Ok(())
    }
}
