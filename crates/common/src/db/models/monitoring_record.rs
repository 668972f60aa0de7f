//! Guarantee monitoring record, one per validated review

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "monitoring_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub review_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub review_link: String,

    pub window_start: DateTimeWithTimeZone,

    pub window_end: DateTimeWithTimeZone,

    pub next_check_at: DateTimeWithTimeZone,

    pub last_checked_at: Option<DateTimeWithTimeZone>,

    pub check_count: i32,

    pub active: bool,

    pub still_exists: bool,

    pub removal_detected_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    /// Window elapsed with the review still published
    pub fn completed_intact(&self) -> bool {
        !self.active && self.still_exists
    }
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
