//! Issue entity: problems raised against a review
//!
//! Issues are never deleted; they only move through `resolve` and the
//! resubmission operations of the issue tracker.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    #[sea_orm(string_value = "LOW_QUALITY")]
    LowQuality,
    #[sea_orm(string_value = "INSUFFICIENT_LENGTH")]
    InsufficientLength,
    #[sea_orm(string_value = "OFF_TOPIC")]
    OffTopic,
    #[sea_orm(string_value = "NOT_PUBLISHED")]
    NotPublished,
    #[sea_orm(string_value = "INVALID_LINK")]
    InvalidLink,
    #[sea_orm(string_value = "POLICY_VIOLATION")]
    PolicyViolation,
    #[sea_orm(string_value = "SUSPECTED_FRAUD")]
    SuspectedFraud,
    #[sea_orm(string_value = "OTHER")]
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueSeverity {
    #[sea_orm(string_value = "LOW")]
    Low,
    #[sea_orm(string_value = "MEDIUM")]
    Medium,
    #[sea_orm(string_value = "HIGH")]
    High,
    #[sea_orm(string_value = "CRITICAL")]
    Critical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueStatus {
    #[sea_orm(string_value = "OPEN")]
    Open,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "RESOLVED")]
    Resolved,
    #[sea_orm(string_value = "REJECTED")]
    Rejected,
    #[sea_orm(string_value = "ESCALATED")]
    Escalated,
    #[sea_orm(string_value = "RESUBMISSION_PENDING")]
    ResubmissionPending,
}

impl IssueStatus {
    /// Statuses that count towards a review's `has_open_issue`
    pub const OPEN_STATUSES: [IssueStatus; 4] = [
        IssueStatus::Open,
        IssueStatus::InProgress,
        IssueStatus::Escalated,
        IssueStatus::ResubmissionPending,
    ];

    pub fn is_open(&self) -> bool {
        Self::OPEN_STATUSES.contains(self)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "issues")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub review_id: Uuid,

    pub issue_type: IssueType,

    pub severity: IssueSeverity,

    pub status: IssueStatus,

    #[sea_orm(column_type = "Text")]
    pub description: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub resolution: Option<String>,

    pub created_by_admin_id: Option<Uuid>,

    pub resolved_by_admin_id: Option<Uuid>,

    pub resolved_at: Option<DateTimeWithTimeZone>,

    pub reader_notified: bool,

    pub resubmission_requested: bool,

    pub reassignment_triggered: bool,

    /// Reader-facing instructions attached to a resubmission request
    #[sea_orm(column_type = "Text", nullable)]
    pub resubmission_instructions: Option<String>,

    pub resubmission_deadline: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::review::Entity",
        from = "Column::ReviewId",
        to = "super::review::Column::Id"
    )]
    Review,
}

impl Related<super::review::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Review.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
