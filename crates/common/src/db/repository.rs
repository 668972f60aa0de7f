//! Repository pattern for database operations
//!
//! Read-side lookups used by the engine and the HTTP handlers. The
//! `load_*` helpers are generic over the connection so the same lookups
//! run inside a transaction.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use uuid::Uuid;

/// Load a review or fail with `ReviewNotFound`
pub async fn load_review<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Review> {
    ReviewEntity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or(AppError::ReviewNotFound { id })
}

/// Load an assignment or fail with `AssignmentNotFound`
pub async fn load_assignment<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Assignment> {
    AssignmentEntity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or(AppError::AssignmentNotFound { id })
}

/// Load an issue or fail with `IssueNotFound`
pub async fn load_issue<C: ConnectionTrait>(conn: &C, id: Uuid) -> Result<Issue> {
    IssueEntity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or(AppError::IssueNotFound { id })
}

/// Load a monitoring record or fail with `MonitoringRecordNotFound`
pub async fn load_monitoring_record<C: ConnectionTrait>(
    conn: &C,
    id: Uuid,
) -> Result<MonitoringRecord> {
    MonitoringRecordEntity::find_by_id(id)
        .one(conn)
        .await?
        .ok_or(AppError::MonitoringRecordNotFound { id })
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Review Operations
    // ========================================================================

    pub async fn get_review(&self, id: Uuid) -> Result<Review> {
        load_review(self.read_conn(), id).await
    }

    pub async fn find_review_by_assignment(&self, assignment_id: Uuid) -> Result<Option<Review>> {
        ReviewEntity::find()
            .filter(ReviewColumn::AssignmentId.eq(assignment_id))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// List reviews in a status with pagination, newest submissions first
    pub async fn list_reviews_by_status(
        &self,
        status: ReviewStatus,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Review>, u64)> {
        let limit = limit.max(1);
        let paginator = ReviewEntity::find()
            .filter(ReviewColumn::Status.eq(status))
            .order_by_desc(ReviewColumn::SubmittedAt)
            .paginate(self.read_conn(), limit);

        let total = paginator.num_items().await?;
        let reviews = paginator.fetch_page(offset / limit).await?;

        Ok((reviews, total))
    }

    /// Removed, guarantee-eligible reviews of a book still waiting for a replacement
    pub async fn reviews_awaiting_replacement(&self, book_id: Uuid) -> Result<Vec<Review>> {
        ReviewEntity::find()
            .filter(ReviewColumn::BookId.eq(book_id))
            .filter(ReviewColumn::Status.eq(ReviewStatus::RemovedByAmazon))
            .filter(ReviewColumn::GuaranteeEligible.eq(true))
            .filter(ReviewColumn::ReplacementProvided.eq(false))
            .order_by_asc(ReviewColumn::RemovalDate)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Assignment Operations
    // ========================================================================

    pub async fn get_assignment(&self, id: Uuid) -> Result<Assignment> {
        load_assignment(self.read_conn(), id).await
    }

    // ========================================================================
    // Issue Operations
    // ========================================================================

    pub async fn get_issue(&self, id: Uuid) -> Result<Issue> {
        load_issue(self.read_conn(), id).await
    }

    /// All issues of a review, oldest first
    pub async fn issues_for_review(&self, review_id: Uuid) -> Result<Vec<Issue>> {
        IssueEntity::find()
            .filter(IssueColumn::ReviewId.eq(review_id))
            .order_by_asc(IssueColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Monitoring Operations
    // ========================================================================

    pub async fn get_monitoring_record(&self, id: Uuid) -> Result<MonitoringRecord> {
        load_monitoring_record(self.read_conn(), id).await
    }

    pub async fn find_monitoring_by_review(
        &self,
        review_id: Uuid,
    ) -> Result<Option<MonitoringRecord>> {
        MonitoringRecordEntity::find()
            .filter(MonitoringRecordColumn::ReviewId.eq(review_id))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Ledger Operations
    // ========================================================================

    pub async fn find_reader_account(&self, reader_id: Uuid) -> Result<Option<ReaderAccount>> {
        ReaderAccountEntity::find_by_id(reader_id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    /// Ledger history of a reader, oldest first
    pub async fn ledger_entries_for_reader(&self, reader_id: Uuid) -> Result<Vec<LedgerEntry>> {
        LedgerEntryEntity::find()
            .filter(LedgerEntryColumn::ReaderId.eq(reader_id))
            .order_by_asc(LedgerEntryColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn ledger_entries_for_review(&self, review_id: Uuid) -> Result<Vec<LedgerEntry>> {
        LedgerEntryEntity::find()
            .filter(LedgerEntryColumn::ReviewId.eq(review_id))
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Campaign Operations
    // ========================================================================

    pub async fn find_campaign(&self, id: Uuid) -> Result<Option<AuthorCampaign>> {
        AuthorCampaignEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn credit_entries_for_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CreditLedgerEntry>> {
        CreditLedgerEntryEntity::find()
            .filter(CreditLedgerEntryColumn::CampaignId.eq(campaign_id))
            .order_by_asc(CreditLedgerEntryColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    pub async fn credit_entries_for_review(&self, review_id: Uuid) -> Result<Vec<CreditLedgerEntry>> {
        CreditLedgerEntryEntity::find()
            .filter(CreditLedgerEntryColumn::ReviewId.eq(review_id))
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }
}
