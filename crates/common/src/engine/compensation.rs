//! Compensation: pay the reader and debit the author campaign
//!
//! Every step runs on the caller's transaction. The unique `review_id` on
//! `ledger_entries` is the double-payment guard; the lookup in step one only
//! saves a doomed insert on the common retry path.

use super::ledger;
use crate::config::CompensationConfig;
use crate::db::models::*;
use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompensationOutcome {
    Paid {
        amount_cents: i64,
        credits_consumed: i32,
    },
    /// The review was already paid; nothing changed
    AlreadyPaid,
}

impl CompensationOutcome {
    pub fn is_paid(&self) -> bool {
        matches!(self, CompensationOutcome::Paid { .. })
    }
}

pub(crate) async fn compensate(
    txn: &DatabaseTransaction,
    review: &Review,
    assignment: &Assignment,
    rates: &CompensationConfig,
    now: DateTime<Utc>,
) -> Result<CompensationOutcome> {
    // 1. idempotency
    if ledger::earning_for_review(txn, review.id).await?.is_some() {
        debug!(review_id = %review.id, "Review already compensated");
        return Ok(CompensationOutcome::AlreadyPaid);
    }

    // 2-4. reader earning
    let amount_cents = rates.payout_cents(assignment.format);
    ledger::credit_earning(
        txn,
        review.reader_id,
        review.id,
        amount_cents,
        format!("Review compensation for book {}", review.book_id),
        now,
    )
    .await?;

    // 5. review
    let mut active = review.clone().into_active_model();
    active.compensation_paid = Set(true);
    active.compensation_amount_cents = Set(Some(amount_cents));
    active.compensation_paid_at = Set(Some(now.into()));
    active.updated_at = Set(now.into());
    active.update(txn).await?;

    // 6-7. author campaign
    let credits_consumed = if assignment.is_replacement() {
        0
    } else {
        rates.credits_for(assignment.format)
    };
    debit_campaign(txn, assignment.campaign_id, review.id, credits_consumed, now).await?;

    Ok(CompensationOutcome::Paid {
        amount_cents,
        credits_consumed,
    })
}

/// Count the delivered review and, unless it is free, consume credits
async fn debit_campaign(
    txn: &DatabaseTransaction,
    campaign_id: Uuid,
    review_id: Uuid,
    credits: i32,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = AuthorCampaignEntity::update_many()
        .col_expr(
            AuthorCampaignColumn::CreditsRemaining,
            Expr::col(AuthorCampaignColumn::CreditsRemaining).sub(credits),
        )
        .col_expr(
            AuthorCampaignColumn::CreditsConsumed,
            Expr::col(AuthorCampaignColumn::CreditsConsumed).add(credits),
        )
        .col_expr(
            AuthorCampaignColumn::ReviewsDelivered,
            Expr::col(AuthorCampaignColumn::ReviewsDelivered).add(1),
        )
        .col_expr(AuthorCampaignColumn::UpdatedAt, Expr::value(now.fixed_offset()))
        .filter(AuthorCampaignColumn::Id.eq(campaign_id))
        .exec(txn)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::NotFound {
            resource_type: "author_campaign".to_string(),
            id: campaign_id.to_string(),
        });
    }

    if credits == 0 {
        debug!(review_id = %review_id, "Replacement review consumes no credits");
        return Ok(());
    }

    let campaign = AuthorCampaignEntity::find_by_id(campaign_id)
        .one(txn)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "author_campaign".to_string(),
            id: campaign_id.to_string(),
        })?;

    if campaign.credits_remaining < 0 {
        warn!(
            campaign_id = %campaign_id,
            credits_remaining = campaign.credits_remaining,
            "Campaign credit pool overdrawn"
        );
    }

    CreditLedgerEntryActiveModel {
        id: Set(Uuid::new_v4()),
        campaign_id: Set(campaign_id),
        review_id: Set(review_id),
        amount: Set(-credits),
        balance_after: Set(campaign.credits_remaining),
        created_at: Set(now.into()),
    }
    .insert(txn)
    .await?;

    Ok(())
}
