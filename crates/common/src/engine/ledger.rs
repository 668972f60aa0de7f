//! Reader ledger
//!
//! Entries are append-only. A reader's running balance lives on
//! `reader_accounts` and is only ever changed with relative updates
//! (`balance = balance + n`) so concurrent writers cannot lose an
//! increment. The row update also takes the row lock, which orders the
//! `balance_before`/`balance_after` snapshots of concurrent entries.

use super::EngineContext;
use crate::collaborators::{Actor, AuditEvent, AuditSeverity};
use crate::db::models::*;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

/// Current balance and counters of one reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBalance {
    pub reader_id: Uuid,
    pub balance_cents: i64,
    pub lifetime_earned_cents: i64,
    pub completed_reviews: i32,
    pub rejected_reviews: i32,
}

impl LedgerBalance {
    fn empty(reader_id: Uuid) -> Self {
        Self {
            reader_id,
            balance_cents: 0,
            lifetime_earned_cents: 0,
            completed_reviews: 0,
            rejected_reviews: 0,
        }
    }
}

impl From<ReaderAccount> for LedgerBalance {
    fn from(account: ReaderAccount) -> Self {
        Self {
            reader_id: account.reader_id,
            balance_cents: account.balance_cents,
            lifetime_earned_cents: account.lifetime_earned_cents,
            completed_reviews: account.completed_reviews,
            rejected_reviews: account.rejected_reviews,
        }
    }
}

/// A ledger movement not tied to a review
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerAdjustment {
    /// PAYOUT or REVERSAL
    pub kind: LedgerEntryKind,
    /// Positive magnitude; the sign follows from `kind`
    pub amount_cents: i64,
    pub description: String,
}

/// Balance of a reader; readers without any entry have a zero balance
pub async fn balance<C: ConnectionTrait>(conn: &C, reader_id: Uuid) -> Result<LedgerBalance> {
    let account = ReaderAccountEntity::find_by_id(reader_id).one(conn).await?;
    Ok(account
        .map(Into::into)
        .unwrap_or_else(|| LedgerBalance::empty(reader_id)))
}

/// The earning entry of a review, if it was paid
pub async fn earning_for_review<C: ConnectionTrait>(
    conn: &C,
    review_id: Uuid,
) -> Result<Option<LedgerEntry>> {
    LedgerEntryEntity::find()
        .filter(LedgerEntryColumn::ReviewId.eq(review_id))
        .one(conn)
        .await
        .map_err(Into::into)
}

/// Create the reader's account row if it does not exist yet
async fn ensure_account<C: ConnectionTrait>(
    conn: &C,
    reader_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    let account = ReaderAccountActiveModel {
        reader_id: Set(reader_id),
        balance_cents: Set(0),
        lifetime_earned_cents: Set(0),
        completed_reviews: Set(0),
        rejected_reviews: Set(0),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    };

    ReaderAccountEntity::insert(account)
        .on_conflict(
            OnConflict::column(ReaderAccountColumn::ReaderId)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    Ok(())
}

async fn reload_account<C: ConnectionTrait>(conn: &C, reader_id: Uuid) -> Result<ReaderAccount> {
    ReaderAccountEntity::find_by_id(reader_id)
        .one(conn)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "reader_account".to_string(),
            id: reader_id.to_string(),
        })
}

/// Append the EARNING entry of a review and credit the reader.
///
/// Fails with a unique violation when the review already has an earning
/// entry; callers run this inside the compensation transaction.
pub async fn credit_earning<C: ConnectionTrait>(
    conn: &C,
    reader_id: Uuid,
    review_id: Uuid,
    amount_cents: i64,
    description: String,
    now: DateTime<Utc>,
) -> Result<LedgerEntry> {
    ensure_account(conn, reader_id, now).await?;

    ReaderAccountEntity::update_many()
        .col_expr(
            ReaderAccountColumn::BalanceCents,
            Expr::col(ReaderAccountColumn::BalanceCents).add(amount_cents),
        )
        .col_expr(
            ReaderAccountColumn::LifetimeEarnedCents,
            Expr::col(ReaderAccountColumn::LifetimeEarnedCents).add(amount_cents),
        )
        .col_expr(
            ReaderAccountColumn::CompletedReviews,
            Expr::col(ReaderAccountColumn::CompletedReviews).add(1),
        )
        .col_expr(ReaderAccountColumn::UpdatedAt, Expr::value(now.fixed_offset()))
        .filter(ReaderAccountColumn::ReaderId.eq(reader_id))
        .exec(conn)
        .await?;

    let account = reload_account(conn, reader_id).await?;

    let entry = LedgerEntryActiveModel {
        id: Set(Uuid::new_v4()),
        reader_id: Set(reader_id),
        review_id: Set(Some(review_id)),
        kind: Set(LedgerEntryKind::Earning),
        amount_cents: Set(amount_cents),
        balance_before_cents: Set(account.balance_cents - amount_cents),
        balance_after_cents: Set(account.balance_cents),
        description: Set(description),
        created_at: Set(now.into()),
    };

    Ok(entry.insert(conn).await?)
}

/// Count a rejected review against the reader
pub async fn increment_rejections<C: ConnectionTrait>(
    conn: &C,
    reader_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    ensure_account(conn, reader_id, now).await?;

    ReaderAccountEntity::update_many()
        .col_expr(
            ReaderAccountColumn::RejectedReviews,
            Expr::col(ReaderAccountColumn::RejectedReviews).add(1),
        )
        .col_expr(ReaderAccountColumn::UpdatedAt, Expr::value(now.fixed_offset()))
        .filter(ReaderAccountColumn::ReaderId.eq(reader_id))
        .exec(conn)
        .await?;

    Ok(())
}

/// Ledger operations that run in their own transaction
pub struct Ledger {
    ctx: EngineContext,
}

impl Ledger {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Append a PAYOUT or REVERSAL entry.
    ///
    /// A payout never takes the balance below zero; a reversal may.
    #[instrument(skip(self, adjustment), fields(reader_id = %reader_id, kind = ?adjustment.kind))]
    pub async fn record_adjustment(
        &self,
        reader_id: Uuid,
        adjustment: LedgerAdjustment,
        admin_id: Uuid,
    ) -> Result<LedgerEntry> {
        if adjustment.kind == LedgerEntryKind::Earning {
            return Err(AppError::Validation {
                message: "earnings are only created by review compensation".to_string(),
                field: Some("kind".to_string()),
            });
        }
        if adjustment.amount_cents <= 0 {
            return Err(AppError::Validation {
                message: "amount must be positive".to_string(),
                field: Some("amount_cents".to_string()),
            });
        }
        if adjustment.description.trim().is_empty() {
            return Err(AppError::MissingField {
                field: "description".to_string(),
            });
        }

        let now = self.ctx.clock.now();
        let delta = -adjustment.amount_cents;

        let txn = self.ctx.db.write().begin().await?;
        ensure_account(&txn, reader_id, now).await?;

        let mut update = ReaderAccountEntity::update_many()
            .col_expr(
                ReaderAccountColumn::BalanceCents,
                Expr::col(ReaderAccountColumn::BalanceCents).add(delta),
            )
            .col_expr(ReaderAccountColumn::UpdatedAt, Expr::value(now.fixed_offset()))
            .filter(ReaderAccountColumn::ReaderId.eq(reader_id));

        if adjustment.kind == LedgerEntryKind::Payout {
            update = update.filter(ReaderAccountColumn::BalanceCents.gte(adjustment.amount_cents));
        }

        let result = update.exec(&txn).await?;
        if result.rows_affected == 0 {
            let available = reload_account(&txn, reader_id).await?.balance_cents;
            txn.rollback().await?;
            return Err(AppError::InsufficientBalance {
                reader_id,
                requested_cents: adjustment.amount_cents,
                available_cents: available,
            });
        }

        let account = reload_account(&txn, reader_id).await?;
        let entry = LedgerEntryActiveModel {
            id: Set(Uuid::new_v4()),
            reader_id: Set(reader_id),
            review_id: Set(None),
            kind: Set(adjustment.kind),
            amount_cents: Set(delta),
            balance_before_cents: Set(account.balance_cents - delta),
            balance_after_cents: Set(account.balance_cents),
            description: Set(adjustment.description),
            created_at: Set(now.into()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        info!(
            entry_id = %entry.id,
            amount_cents = entry.amount_cents,
            balance_after_cents = entry.balance_after_cents,
            "Ledger adjustment recorded"
        );

        self.ctx
            .collaborators
            .audit(
                AuditEvent::new(Actor::Admin(admin_id), "ledger.adjustment", "reader", reader_id)
                    .changes(serde_json::json!({
                        "entry_id": entry.id,
                        "kind": entry.kind,
                        "amount_cents": entry.amount_cents,
                        "balance_after_cents": entry.balance_after_cents,
                    }))
                    .severity(AuditSeverity::Warning),
            )
            .await;

        Ok(entry)
    }
}
