//! Repository for delivery record database operations.
//!
//! Provides type-safe access to the delivery ledger with support for
//! idempotent creation, status-guarded transitions, and concurrent claiming
//! of due retries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryRecord, EventId, SendAck, StatusCounts, UserId},
};

/// Column list shared by every query returning full records.
const RECORD_COLUMNS: &str = "id, event_id, user_id, kind, destination, subject, body, \
     status, attempt_count, next_retry_at, last_error, provider_message_id, \
     provider_response, payload, sent_at, failed_at, created_at, updated_at";

/// Data for a new delivery record.
///
/// Built by the worker on first dequeue; subject and body are absent when
/// rendering failed.
#[derive(Debug, Clone)]
pub struct NewDeliveryRecord {
    /// Producer-assigned deduplication key.
    pub event_id: EventId,
    /// Recipient user.
    pub user_id: UserId,
    /// Event type tag.
    pub kind: String,
    /// Channel destination.
    pub destination: String,
    /// Rendered subject, if rendering succeeded.
    pub subject: Option<String>,
    /// Rendered body, if rendering succeeded.
    pub body: Option<String>,
    /// Original event body for retry reconstruction.
    pub payload: serde_json::Value,
}

/// Repository for delivery record database operations.
///
/// Handles all database interactions for the delivery ledger. Status
/// transitions are guarded in SQL so a terminal record can never move again,
/// even under concurrent workers.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a `pending` record for the event unless one already exists.
    ///
    /// The unique constraint on `event_id` makes this safe under concurrent
    /// workers: exactly one insert wins, everyone else observes the existing
    /// row. Returns the record plus a flag telling the caller whether it was
    /// already there.
    ///
    /// # Errors
    ///
    /// Returns error if the insert or the follow-up select fails.
    pub async fn create_if_absent(&self, new: &NewDeliveryRecord) -> Result<(DeliveryRecord, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO delivery_records (
                id, event_id, user_id, kind, destination, subject, body,
                status, attempt_count, payload, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8, NOW(), NOW()
            )
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.event_id.0)
        .bind(new.user_id.0)
        .bind(&new.kind)
        .bind(&new.destination)
        .bind(&new.subject)
        .bind(&new.body)
        .bind(sqlx::types::Json(&new.payload))
        .execute(&*self.pool)
        .await?;

        let record = self
            .find_by_event_id(new.event_id)
            .await?
            .ok_or_else(|| crate::error::CoreError::NotFound(format!(
                "delivery record for event {} vanished after insert",
                new.event_id
            )))?;

        Ok((record, inserted.rows_affected() == 0))
    }

    /// Marks a record as sent.
    ///
    /// Only `pending` and `retrying` records transition; a terminal record
    /// is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_sent(&self, id: Uuid, ack: &SendAck) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'sent',
                sent_at = NOW(),
                next_retry_at = NULL,
                provider_message_id = $1,
                provider_response = $2,
                updated_at = NOW()
            WHERE id = $3 AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(&ack.message_id)
        .bind(&ack.provider_response)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Schedules a retry after a transient failure.
    ///
    /// Increments `attempt_count` and records the backoff deadline. The
    /// caller decides the deadline; this method only persists it. The
    /// attempt budget is enforced in SQL so concurrent workers deciding on
    /// a stale read cannot push `attempt_count` past `max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn schedule_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'retrying',
                attempt_count = attempt_count + 1,
                next_retry_at = $1,
                last_error = $2,
                updated_at = NOW()
            WHERE id = $3
              AND status IN ('pending', 'retrying')
              AND attempt_count < $4
            "#,
        )
        .bind(next_retry_at)
        .bind(error)
        .bind(id)
        .bind(max_attempts)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a record as terminally failed.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'failed',
                failed_at = NOW(),
                next_retry_at = NULL,
                last_error = $1,
                updated_at = NOW()
            WHERE id = $2 AND status NOT IN ('sent', 'failed')
            "#,
        )
        .bind(error)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Claims `retrying` records whose backoff has elapsed.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so multiple sweepers never grab the
    /// same record. Claimed records get `next_retry_at` cleared, which both
    /// marks them ready for an immediate attempt and keeps the next sweep
    /// from re-publishing them while they sit in the queue.
    ///
    /// A claim without a matching queue entry would otherwise be invisible
    /// forever, so claims whose `updated_at` predates `stale_before` are
    /// treated as lost and claimed again.
    ///
    /// Records are returned oldest deadline first, recovered claims last.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn find_due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM delivery_records
            WHERE status = 'retrying'
              AND (next_retry_at <= $1
                   OR (next_retry_at IS NULL AND updated_at <= $2))
            ORDER BY next_retry_at ASC NULLS LAST
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            UPDATE delivery_records
            SET next_retry_at = NULL, updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING {RECORD_COLUMNS}
            "#,
        ))
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(records)
    }

    /// Re-arms a claimed retry with a fresh deadline.
    ///
    /// Only records still claimed, `retrying` with no deadline, are touched;
    /// anything that moved on since the claim is left alone.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn restore_retry_deadline(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET next_retry_at = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'retrying' AND next_retry_at IS NULL
            "#,
        )
        .bind(next_retry_at)
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a record by its event ID.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event_id(&self, event_id: EventId) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM delivery_records
            WHERE event_id = $1
            "#,
        ))
        .bind(event_id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Finds records for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM delivery_records
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        ))
        .bind(user_id.0)
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Revives a failed record for an administrative retry.
    ///
    /// Only records below the attempt budget qualify; records that exhausted
    /// it, and sent records, stay immutable. Returns the revived record, or
    /// `None` when nothing qualified.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn revive_failed(
        &self,
        event_id: EventId,
        max_attempts: i32,
    ) -> Result<Option<DeliveryRecord>> {
        let record = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            UPDATE delivery_records
            SET status = 'retrying',
                next_retry_at = NULL,
                failed_at = NULL,
                updated_at = NOW()
            WHERE event_id = $1 AND status = 'failed' AND attempt_count < $2
            RETURNING {RECORD_COLUMNS}
            "#,
        ))
        .bind(event_id.0)
        .bind(max_attempts)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Counts records per status in one round trip.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending'),
                COUNT(*) FILTER (WHERE status = 'sent'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                COUNT(*) FILTER (WHERE status = 'retrying')
            FROM delivery_records
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(StatusCounts { pending: row.0, sent: row.1, failed: row.2, retrying: row.3 })
    }
}
