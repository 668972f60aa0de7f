//! Author-side credit consumption entry (append-only)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "credit_ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub campaign_id: Uuid,

    #[sea_orm(unique)]
    pub review_id: Uuid,

    /// Negative: credits consumed from the campaign pool
    pub amount: i32,

    /// Campaign pool remaining after this entry
    pub balance_after: i32,

    pub created_at: DateTimeWithTimeZone,
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
