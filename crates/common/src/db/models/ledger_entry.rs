//! Reader ledger entry (append-only)
//!
//! `review_id` is unique when present. That constraint is what stops a
//! review from ever being paid twice.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEntryKind {
    #[sea_orm(string_value = "EARNING")]
    Earning,
    #[sea_orm(string_value = "PAYOUT")]
    Payout,
    #[sea_orm(string_value = "REVERSAL")]
    Reversal,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub reader_id: Uuid,

    #[sea_orm(unique, nullable)]
    pub review_id: Option<Uuid>,

    pub kind: LedgerEntryKind,

    /// Signed amount in cents
    pub amount_cents: i64,

    pub balance_before_cents: i64,

    pub balance_after_cents: i64,

    #[sea_orm(column_type = "Text")]
    pub description: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
