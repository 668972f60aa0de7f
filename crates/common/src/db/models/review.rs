//! Review entity
//!
//! One review per reader assignment. `status` is the single authoritative
//! lifecycle state; the remaining flags record independent facts about
//! compensation and marketplace removal.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    #[sea_orm(string_value = "PENDING_SUBMISSION")]
    PendingSubmission,
    #[sea_orm(string_value = "SUBMITTED")]
    Submitted,
    #[sea_orm(string_value = "VALIDATED")]
    Validated,
    #[sea_orm(string_value = "REJECTED")]
    Rejected,
    #[sea_orm(string_value = "FLAGGED")]
    Flagged,
    #[sea_orm(string_value = "REMOVED_BY_AMAZON")]
    RemovedByAmazon,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::PendingSubmission => "PENDING_SUBMISSION",
            ReviewStatus::Submitted => "SUBMITTED",
            ReviewStatus::Validated => "VALIDATED",
            ReviewStatus::Rejected => "REJECTED",
            ReviewStatus::Flagged => "FLAGGED",
            ReviewStatus::RemovedByAmazon => "REMOVED_BY_AMAZON",
        }
    }

    /// No admin action leaves these states
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReviewStatus::Rejected | ReviewStatus::RemovedByAmazon)
    }
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "reviews")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub assignment_id: Uuid,

    pub book_id: Uuid,

    pub reader_id: Uuid,

    /// Marketplace URL of the published review; admin-only
    #[sea_orm(column_type = "Text")]
    pub review_link: String,

    pub star_rating: i32,

    #[sea_orm(column_type = "Text")]
    pub feedback_text: String,

    pub published_confirmed: bool,

    pub completion_percent: i32,

    pub status: ReviewStatus,

    pub submitted_at: DateTimeWithTimeZone,

    pub validated_at: Option<DateTimeWithTimeZone>,

    pub validated_by_admin_id: Option<Uuid>,

    /// Cached: true while any issue on this review is still open
    pub has_open_issue: bool,

    pub removed_from_marketplace: bool,

    pub removal_detected_at: Option<DateTimeWithTimeZone>,

    pub removal_date: Option<DateTimeWithTimeZone>,

    /// Computed once at removal detection and never recomputed
    pub guarantee_eligible: Option<bool>,

    pub replacement_provided: bool,

    pub replacement_assignment_id: Option<Uuid>,

    pub replacement_review_id: Option<Uuid>,

    pub compensation_paid: bool,

    pub compensation_amount_cents: Option<i64>,

    pub compensation_paid_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Removed inside the guarantee window with no replacement yet
    pub fn awaiting_replacement(&self) -> bool {
        self.status == ReviewStatus::RemovedByAmazon
            && self.guarantee_eligible == Some(true)
            && !self.replacement_provided
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::assignment::Entity",
        from = "Column::AssignmentId",
        to = "super::assignment::Column::Id"
    )]
    Assignment,

    #[sea_orm(has_many = "super::issue::Entity")]
    Issues,

    #[sea_orm(has_one = "super::monitoring_record::Entity")]
    MonitoringRecord,
}

impl Related<super::assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assignment.def()
    }
}

impl Related<super::issue::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Issues.def()
    }
}

impl Related<super::monitoring_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::MonitoringRecord.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
