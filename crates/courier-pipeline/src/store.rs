//! Delivery ledger abstraction for the pipeline.
//!
//! Provides trait-based access to delivery records so worker, sweeper, and
//! controller logic can be tested without a database. Production uses the
//! concrete `courier_core::storage::Storage`; tests use the in-memory mock.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_core::{
    storage::delivery_records::NewDeliveryRecord, DeliveryRecord, EventId, SendAck, StatusCounts,
    UserId,
};

use crate::error::Result;

/// Ledger operations required by the pipeline.
///
/// Transition guards live behind these operations: a terminal record never
/// moves again no matter which method is called on it.
pub trait DeliveryStore: Send + Sync + 'static {
    /// Creates a `pending` record unless one exists for the event.
    ///
    /// Returns the record plus `true` when it already existed, which is the
    /// worker's idempotency signal.
    fn create_if_absent(
        &self,
        new: NewDeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(DeliveryRecord, bool)>> + Send + '_>>;

    /// Marks a record as sent with the provider acknowledgement.
    ///
    /// No-op when the record is already terminal.
    fn mark_sent(
        &self,
        id: Uuid,
        ack: SendAck,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Moves a record to `retrying`, consuming one attempt of budget.
    ///
    /// The caller computes `next_retry_at` from the backoff schedule.
    /// `attempt_count` is capped at `max_attempts` inside the store, so two
    /// workers racing on the same record cannot overdraw the budget.
    fn schedule_retry(
        &self,
        id: Uuid,
        error: String,
        next_retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Marks a record as terminally failed.
    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Claims `retrying` records whose backoff has elapsed, oldest first.
    ///
    /// Claiming clears `next_retry_at` so the record reads as ready for an
    /// immediate attempt and later sweeps skip it. Claims whose `updated_at`
    /// predates `stale_before` lost their queue entry and are claimed again.
    fn find_due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>>;

    /// Re-arms a claimed retry with a fresh deadline.
    ///
    /// No-op unless the record is still `retrying` with no deadline.
    fn restore_retry_deadline(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Looks up the record for an event.
    ///
    /// Also serves the worker's pre-send status re-check.
    fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>>;

    /// Paginated delivery history for a user, newest first.
    fn find_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>>;

    /// Revives a failed record below the attempt budget for manual retry.
    fn revive_failed(
        &self,
        event_id: EventId,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>>;

    /// Record counts per status for the operational surface.
    fn count_by_status(&self) -> Pin<Box<dyn Future<Output = Result<StatusCounts>> + Send + '_>>;

    /// Verifies the ledger backend is reachable.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production ledger backed by PostgreSQL.
///
/// Thin adapter over the repository layer; all SQL lives in
/// `courier_core::storage`.
pub struct PostgresDeliveryStore {
    storage: Arc<courier_core::storage::Storage>,
}

impl PostgresDeliveryStore {
    /// Creates a new PostgreSQL ledger adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStore for PostgresDeliveryStore {
    fn create_if_absent(
        &self,
        new: NewDeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(DeliveryRecord, bool)>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { Ok(storage.delivery_records.create_if_absent(&new).await?) })
    }

    fn mark_sent(
        &self,
        id: Uuid,
        ack: SendAck,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { Ok(storage.delivery_records.mark_sent(id, &ack).await?) })
    }

    fn schedule_retry(
        &self,
        id: Uuid,
        error: String,
        next_retry_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            Ok(storage
                .delivery_records
                .schedule_retry(id, &error, next_retry_at, max_attempts)
                .await?)
        })
    }

    fn mark_failed(
        &self,
        id: Uuid,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { Ok(storage.delivery_records.mark_failed(id, &error).await?) })
    }

    fn find_due_for_retry(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            Ok(storage.delivery_records.find_due_for_retry(now, stale_before, limit).await?)
        })
    }

    fn restore_retry_deadline(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            Ok(storage.delivery_records.restore_retry_deadline(id, next_retry_at).await?)
        })
    }

    fn find_by_event_id(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { Ok(storage.delivery_records.find_by_event_id(event_id).await?) })
    }

    fn find_for_user(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            Ok(storage.delivery_records.find_for_user(user_id, limit, offset).await?)
        })
    }

    fn revive_failed(
        &self,
        event_id: EventId,
        max_attempts: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            Ok(storage.delivery_records.revive_failed(event_id, max_attempts).await?)
        })
    }

    fn count_by_status(&self) -> Pin<Box<dyn Future<Output = Result<StatusCounts>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { Ok(storage.delivery_records.count_by_status().await?) })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { Ok(storage.health_check().await?) })
    }
}

pub mod mock {
    //! Mock ledger implementation for testing.
    //!
    //! In-memory map keyed by event ID with the same transition guards as
    //! the SQL implementation, plus error injection for simulating storage
    //! outages.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use courier_core::{
        storage::delivery_records::NewDeliveryRecord, CoreError, DeliveryRecord, DeliveryStatus,
        EventId, SendAck, StatusCounts, UserId,
    };

    use super::DeliveryStore;
    use crate::error::Result;

    /// Mock ledger for testing pipeline logic without a database.
    pub struct MockDeliveryStore {
        records: Arc<RwLock<HashMap<EventId, DeliveryRecord>>>,
        create_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDeliveryStore {
        /// Creates an empty mock ledger.
        pub fn new() -> Self {
            Self {
                records: Arc::new(RwLock::new(HashMap::new())),
                create_error: Arc::new(RwLock::new(None)),
            }
        }

        /// Seeds a record directly, bypassing the creation path.
        pub async fn insert_record(&self, record: DeliveryRecord) {
            self.records.write().await.insert(record.event_id, record);
        }

        /// Injects an error for the next `create_if_absent` call.
        pub async fn inject_create_error(&self, error: impl Into<String>) {
            *self.create_error.write().await = Some(error.into());
        }

        /// Returns the record for an event, for assertions.
        pub async fn record(&self, event_id: EventId) -> Option<DeliveryRecord> {
            self.records.read().await.get(&event_id).cloned()
        }

        /// Verifies a record reached the expected status.
        pub async fn verify_status(&self, event_id: EventId, expected: DeliveryStatus) -> bool {
            self.records.read().await.get(&event_id).is_some_and(|r| r.status == expected)
        }

        /// Number of records in the ledger.
        pub async fn record_count(&self) -> usize {
            self.records.read().await.len()
        }
    }

    impl Default for MockDeliveryStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DeliveryStore for MockDeliveryStore {
        fn create_if_absent(
            &self,
            new: NewDeliveryRecord,
        ) -> Pin<Box<dyn Future<Output = Result<(DeliveryRecord, bool)>> + Send + '_>> {
            let records = self.records.clone();
            let create_error = self.create_error.clone();
            Box::pin(async move {
                if let Some(error) = create_error.write().await.take() {
                    return Err(CoreError::Database(error).into());
                }

                let mut records = records.write().await;
                if let Some(existing) = records.get(&new.event_id) {
                    return Ok((existing.clone(), true));
                }

                let now = Utc::now();
                let record = DeliveryRecord {
                    id: Uuid::new_v4(),
                    event_id: new.event_id,
                    user_id: new.user_id,
                    kind: new.kind,
                    destination: new.destination,
                    subject: new.subject,
                    body: new.body,
                    status: DeliveryStatus::Pending,
                    attempt_count: 0,
                    next_retry_at: None,
                    last_error: None,
                    provider_message_id: None,
                    provider_response: None,
                    payload: sqlx::types::Json(new.payload),
                    sent_at: None,
                    failed_at: None,
                    created_at: now,
                    updated_at: now,
                };
                records.insert(record.event_id, record.clone());
                Ok((record, false))
            })
        }

        fn mark_sent(
            &self,
            id: Uuid,
            ack: SendAck,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let mut records = records.write().await;
                if let Some(record) =
                    records.values_mut().find(|r| r.id == id && r.status.is_sendable())
                {
                    record.status = DeliveryStatus::Sent;
                    record.sent_at = Some(Utc::now());
                    record.next_retry_at = None;
                    record.provider_message_id = Some(ack.message_id);
                    record.provider_response = ack.provider_response;
                    record.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn schedule_retry(
            &self,
            id: Uuid,
            error: String,
            next_retry_at: DateTime<Utc>,
            max_attempts: i32,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let mut records = records.write().await;
                if let Some(record) = records.values_mut().find(|r| {
                    r.id == id && r.status.is_sendable() && r.attempt_count < max_attempts
                }) {
                    record.status = DeliveryStatus::Retrying;
                    record.attempt_count += 1;
                    record.next_retry_at = Some(next_retry_at);
                    record.last_error = Some(error);
                    record.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn mark_failed(
            &self,
            id: Uuid,
            error: String,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let mut records = records.write().await;
                if let Some(record) = records.values_mut().find(|r| {
                    r.id == id
                        && r.status != DeliveryStatus::Sent
                        && r.status != DeliveryStatus::Failed
                }) {
                    record.status = DeliveryStatus::Failed;
                    record.failed_at = Some(Utc::now());
                    record.next_retry_at = None;
                    record.last_error = Some(error);
                    record.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn find_due_for_retry(
            &self,
            now: DateTime<Utc>,
            stale_before: DateTime<Utc>,
            limit: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let mut records = records.write().await;
                let mut due: Vec<&mut DeliveryRecord> = records
                    .values_mut()
                    .filter(|r| {
                        r.status == DeliveryStatus::Retrying
                            && match r.next_retry_at {
                                Some(at) => at <= now,
                                None => r.updated_at <= stale_before,
                            }
                    })
                    .collect();
                // Elapsed deadlines first, recovered claims after.
                due.sort_by_key(|r| (r.next_retry_at.is_none(), r.next_retry_at));
                due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

                let mut claimed = Vec::with_capacity(due.len());
                for record in due {
                    record.next_retry_at = None;
                    record.updated_at = now;
                    claimed.push(record.clone());
                }
                Ok(claimed)
            })
        }

        fn restore_retry_deadline(
            &self,
            id: Uuid,
            next_retry_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let mut records = records.write().await;
                if let Some(record) = records.values_mut().find(|r| {
                    r.id == id
                        && r.status == DeliveryStatus::Retrying
                        && r.next_retry_at.is_none()
                }) {
                    record.next_retry_at = Some(next_retry_at);
                    record.updated_at = Utc::now();
                }
                Ok(())
            })
        }

        fn find_by_event_id(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move { Ok(records.read().await.get(&event_id).cloned()) })
        }

        fn find_for_user(
            &self,
            user_id: UserId,
            limit: i64,
            offset: i64,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let records = records.read().await;
                let mut matching: Vec<DeliveryRecord> =
                    records.values().filter(|r| r.user_id == user_id).cloned().collect();
                matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(matching
                    .into_iter()
                    .skip(usize::try_from(offset).unwrap_or(0))
                    .take(usize::try_from(limit).unwrap_or(usize::MAX))
                    .collect())
            })
        }

        fn revive_failed(
            &self,
            event_id: EventId,
            max_attempts: i32,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let mut records = records.write().await;
                let Some(record) = records.get_mut(&event_id) else {
                    return Ok(None);
                };
                if record.status != DeliveryStatus::Failed || record.attempt_count >= max_attempts
                {
                    return Ok(None);
                }
                record.status = DeliveryStatus::Retrying;
                record.next_retry_at = None;
                record.failed_at = None;
                record.updated_at = Utc::now();
                Ok(Some(record.clone()))
            })
        }

        fn count_by_status(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<StatusCounts>> + Send + '_>> {
            let records = self.records.clone();
            Box::pin(async move {
                let records = records.read().await;
                let mut counts = StatusCounts::default();
                for record in records.values() {
                    match record.status {
                        DeliveryStatus::Pending => counts.pending += 1,
                        DeliveryStatus::Sent => counts.sent += 1,
                        DeliveryStatus::Failed => counts.failed += 1,
                        DeliveryStatus::Retrying => counts.retrying += 1,
                    }
                }
                Ok(counts)
            })
        }

        fn ping(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }
}
