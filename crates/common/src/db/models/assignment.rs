//! Reader assignment entity
//!
//! Assignments are created and ordered by the assignment subsystem. The
//! review engine only moves their status as a side effect of review
//! transitions and promotes queued entries during replacement dispatch.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Book format delivered to the reader; determines payout and credit cost
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookFormat {
    #[sea_orm(string_value = "EBOOK")]
    Ebook,
    #[sea_orm(string_value = "AUDIOBOOK")]
    Audiobook,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    /// Sitting in the book's reader queue
    #[sea_orm(string_value = "WAITING")]
    Waiting,
    #[sea_orm(string_value = "SCHEDULED")]
    Scheduled,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "SUBMITTED")]
    Submitted,
    #[sea_orm(string_value = "VALIDATED")]
    Validated,
    #[sea_orm(string_value = "REASSIGNED")]
    Reassigned,
    #[sea_orm(string_value = "EXPIRED")]
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "assignments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub book_id: Uuid,

    pub reader_id: Uuid,

    /// Author campaign whose credit pool pays for this assignment
    pub campaign_id: Uuid,

    pub format: BookFormat,

    pub status: AssignmentStatus,

    pub queue_position: i32,

    /// Buffer readers are held back as spares until promoted
    pub is_buffer: bool,

    pub scheduled_for: Option<Date>,

    pub deadline_at: Option<DateTimeWithTimeZone>,

    #[sea_orm(column_type = "Text", nullable)]
    pub deadline_extension_reason: Option<String>,

    /// Set when this assignment was promoted to replace a removed review
    pub replaces_review_id: Option<Uuid>,

    pub reassigned_at: Option<DateTimeWithTimeZone>,

    /// Acting admin; `None` when the engine reassigned on its own
    pub reassigned_by: Option<Uuid>,

    #[sea_orm(column_type = "Text", nullable)]
    pub reassignment_reason: Option<String>,

    pub validated_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Whether the reader can still submit (or resubmit) a review
    pub fn accepts_submission(&self) -> bool {
        self.status == AssignmentStatus::InProgress
    }

    pub fn is_replacement(&self) -> bool {
        self.replaces_review_id.is_some()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::author_campaign::Entity",
        from = "Column::CampaignId",
        to = "super::author_campaign::Column::Id"
    )]
    Campaign,
}

impl Related<super::author_campaign::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Campaign.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
