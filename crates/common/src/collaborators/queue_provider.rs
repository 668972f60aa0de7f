//! Reader queue capability
//!
//! The assignment subsystem owns the per-book reader queue. Replacement
//! dispatch only needs to find the earliest waiting entry and claim it.

use crate::collaborators::clock::Clock;
use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A queue entry as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedAssignment {
    pub assignment_id: Uuid,
    pub book_id: Uuid,
    pub reader_id: Uuid,
    pub queue_position: i32,
}

impl From<Assignment> for QueuedAssignment {
    fn from(a: Assignment) -> Self {
        Self {
            assignment_id: a.id,
            book_id: a.book_id,
            reader_id: a.reader_id,
            queue_position: a.queue_position,
        }
    }
}

#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Earliest waiting entry (lowest queue position) for a book
    async fn next_waiting(&self, book_id: Uuid) -> Result<Option<QueuedAssignment>>;

    /// Move a waiting entry to scheduled for `date` as the replacement of
    /// `replaces_review_id`, clearing its buffer flag.
    ///
    /// Returns `false` when the entry was no longer waiting, i.e. another
    /// caller claimed it first.
    async fn promote_to_scheduled(
        &self,
        assignment_id: Uuid,
        date: NaiveDate,
        replaces_review_id: Uuid,
    ) -> Result<bool>;
}

/// Queue provider over the `assignments` table
pub struct DbQueueProvider {
    db: DbPool,
    clock: Arc<dyn Clock>,
}

impl DbQueueProvider {
    pub fn new(db: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl QueueProvider for DbQueueProvider {
    async fn next_waiting(&self, book_id: Uuid) -> Result<Option<QueuedAssignment>> {
        let next = AssignmentEntity::find()
            .filter(AssignmentColumn::BookId.eq(book_id))
            .filter(AssignmentColumn::Status.eq(AssignmentStatus::Waiting))
            .order_by_asc(AssignmentColumn::QueuePosition)
            .order_by_asc(AssignmentColumn::CreatedAt)
            .one(self.db.write())
            .await?;

        Ok(next.map(Into::into))
    }

    async fn promote_to_scheduled(
        &self,
        assignment_id: Uuid,
        date: NaiveDate,
        replaces_review_id: Uuid,
    ) -> Result<bool> {
        let now = self.clock.now();

        // Compare-and-set on the WAITING status: only one promoter wins
        let result = AssignmentEntity::update_many()
            .set(AssignmentActiveModel {
                status: Set(AssignmentStatus::Scheduled),
                is_buffer: Set(false),
                scheduled_for: Set(Some(date)),
                replaces_review_id: Set(Some(replaces_review_id)),
                updated_at: Set(now.into()),
                ..Default::default()
            })
            .filter(AssignmentColumn::Id.eq(assignment_id))
            .filter(AssignmentColumn::Status.eq(AssignmentStatus::Waiting))
            .exec(self.db.write())
            .await?;

        let claimed = result.rows_affected == 1;
        debug!(
            assignment_id = %assignment_id,
            replaces_review_id = %replaces_review_id,
            claimed,
            "Queue promotion attempted"
        );
        Ok(claimed)
    }
}
