//! Schema bootstrap
//!
//! Tables are generated from the entity definitions so that the unique
//! constraints the engine depends on (`ledger_entries.review_id`,
//! `credit_ledger_entries.review_id`, `reviews.assignment_id`,
//! `monitoring_records.review_id`) always exist in the store.

use crate::db::models::*;
use crate::errors::Result;
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityName, EntityTrait, Schema};
use tracing::{debug, info};

/// Create every engine table that does not exist yet.
///
/// Tables are created parents-first so foreign keys resolve.
pub async fn ensure_schema(conn: &DatabaseConnection) -> Result<()> {
    let schema = Schema::new(conn.get_database_backend());

    create_table(conn, &schema, AuthorCampaignEntity).await?;
    create_table(conn, &schema, ReaderAccountEntity).await?;
    create_table(conn, &schema, AssignmentEntity).await?;
    create_table(conn, &schema, ReviewEntity).await?;
    create_table(conn, &schema, IssueEntity).await?;
    create_table(conn, &schema, MonitoringRecordEntity).await?;
    create_table(conn, &schema, LedgerEntryEntity).await?;
    create_table(conn, &schema, CreditLedgerEntryEntity).await?;

    info!("Database schema ensured");
    Ok(())
}

async fn create_table<E>(conn: &DatabaseConnection, schema: &Schema, entity: E) -> Result<()>
where
    E: EntityTrait,
{
    let table = entity.table_name().to_string();
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();

    conn.execute(conn.get_database_backend().build(&stmt)).await?;
    debug!(table = %table, "Table ensured");
    Ok(())
}
