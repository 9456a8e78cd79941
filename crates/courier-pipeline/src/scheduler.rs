//! Durable retry sweeper.
//!
//! Scheduled retries are persisted on the delivery record, not held in
//! process memory, so a crash or restart cannot lose them. The sweeper runs
//! once on startup and then periodically: it claims records whose backoff
//! has elapsed and re-publishes them onto the queue for the worker to pick
//! up in order.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::Clock;

use crate::{queue::EventQueue, store::DeliveryStore};

/// Sweeper tuning parameters.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Delay between sweeps.
    pub sweep_interval: Duration,
    /// Maximum records claimed per sweep.
    pub batch_limit: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { sweep_interval: Duration::from_secs(60), batch_limit: 100 }
    }
}

/// Re-publishes due retries from the ledger onto the queue.
pub struct RetrySweeper {
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
    cancel: CancellationToken,
}

impl RetrySweeper {
    /// Creates a sweeper over injected collaborators.
    pub fn new(
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { queue, store, clock, config, cancel }
    }

    /// Runs the sweep loop until cancelled.
    ///
    /// The first sweep happens immediately so retries stranded by a previous
    /// process are recovered on startup rather than after one interval.
    pub async fn run(self) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            "retry sweeper started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.sweep().await;

            tokio::select! {
                () = self.clock.sleep(self.config.sweep_interval) => {},
                () = self.cancel.cancelled() => break,
            }
        }

        info!("retry sweeper stopped");
    }

    /// Claims due retries and re-enqueues them. Returns how many were
    /// re-published.
    ///
    /// A claim is only settled once its event is back on the queue. When the
    /// push fails the deadline is restored so the next sweep claims the
    /// record again; claims orphaned by a crash age out via `stale_before`
    /// and are reclaimed the same way.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_utc();
        let stale_before = now
            - chrono::Duration::from_std(self.config.sweep_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let due = match self.store.find_due_for_retry(now, stale_before, self.config.batch_limit).await
        {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "retry sweep query failed");
                return 0;
            },
        };

        if due.is_empty() {
            return 0;
        }

        debug!(count = due.len(), "re-publishing due retries");

        let mut republished = 0;
        for record in due {
            let event = record.to_event();
            match self.queue.push(event).await {
                Ok(()) => republished += 1,
                Err(e) => {
                    warn!(
                        event_id = %record.event_id,
                        error = %e,
                        "failed to re-enqueue due retry"
                    );
                    if let Err(e) =
                        self.store.restore_retry_deadline(record.id, now).await
                    {
                        warn!(
                            event_id = %record.event_id,
                            error = %e,
                            "failed to restore deadline on claimed retry"
                        );
                    }
                },
            }
        }

        republished
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use courier_core::{
        storage::delivery_records::NewDeliveryRecord, DeliveryStatus, EventId, EventPayload,
        NotificationEvent, TestClock, UserId,
    };

    use super::*;
    use crate::{
        queue::{mock::FlakyQueue, InMemoryQueue},
        store::{mock::MockDeliveryStore, DeliveryStore},
    };

    async fn retrying_record(
        store: &MockDeliveryStore,
        clock: &TestClock,
        due_in: ChronoDuration,
    ) -> EventId {
        let event = NotificationEvent::new(
            EventId::new(),
            UserId::new(),
            "user@example.com",
            EventPayload::KycPending { full_name: "Ada".to_string() },
            clock.now_utc(),
        );
        let new = NewDeliveryRecord {
            event_id: event.event_id,
            user_id: event.user_id,
            kind: event.body.kind_label().to_string(),
            destination: event.destination.clone(),
            subject: Some("subject".to_string()),
            body: Some("body".to_string()),
            payload: serde_json::to_value(&event.body).unwrap(),
        };
        let (record, _) = store.create_if_absent(new).await.unwrap();
        store
            .schedule_retry(record.id, "timeout".to_string(), clock.now_utc() + due_in, 3)
            .await
            .unwrap();
        event.event_id
    }

    fn sweeper(
        queue: Arc<dyn EventQueue>,
        store: Arc<MockDeliveryStore>,
        clock: Arc<TestClock>,
    ) -> RetrySweeper {
        RetrySweeper::new(queue, store, clock, SweeperConfig::default(), CancellationToken::new())
    }

    #[tokio::test]
    async fn sweep_republishes_due_retries() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let clock = Arc::new(TestClock::new());

        let due = retrying_record(&store, &clock, ChronoDuration::minutes(-1)).await;
        let not_due = retrying_record(&store, &clock, ChronoDuration::minutes(5)).await;

        let sweeper = sweeper(queue.clone(), store.clone(), clock);
        assert_eq!(sweeper.sweep().await, 1);

        let events = queue.pop_batch(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, due);

        // The due record is claimed; the future one still carries its timer.
        assert!(store.record(due).await.unwrap().next_retry_at.is_none());
        assert!(store.record(not_due).await.unwrap().next_retry_at.is_some());
    }

    #[tokio::test]
    async fn claimed_retry_is_not_swept_twice() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let clock = Arc::new(TestClock::new());

        retrying_record(&store, &clock, ChronoDuration::minutes(-1)).await;

        let sweeper = sweeper(queue.clone(), store.clone(), clock);
        assert_eq!(sweeper.sweep().await, 1);
        assert_eq!(sweeper.sweep().await, 0);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn republished_event_round_trips_payload() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let clock = Arc::new(TestClock::new());

        let event_id = retrying_record(&store, &clock, ChronoDuration::minutes(-1)).await;
        let sweeper = sweeper(queue.clone(), store.clone(), clock);
        sweeper.sweep().await;

        let events = queue.pop_batch(1).await.unwrap();
        assert_eq!(events[0].event_id, event_id);
        assert_eq!(events[0].body.kind_label(), "KYC_PENDING");
        let record = store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Retrying);
    }

    #[tokio::test]
    async fn queue_failure_rearms_retry_for_the_next_sweep() {
        let queue = Arc::new(FlakyQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let clock = Arc::new(TestClock::new());

        let event_id = retrying_record(&store, &clock, ChronoDuration::minutes(-1)).await;
        queue.inject_push_error("redis down").await;

        let sweeper = sweeper(queue.clone(), store.clone(), clock.clone());
        assert_eq!(sweeper.sweep().await, 0);

        // The failed push hands the deadline back, the record is due again.
        let record = store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.next_retry_at, Some(clock.now_utc()));

        // Queue healed, the next sweep picks the record up.
        assert_eq!(sweeper.sweep().await, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(store.record(event_id).await.unwrap().next_retry_at.is_none());
    }

    #[tokio::test]
    async fn stranded_claim_is_reclaimed_after_one_interval() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let clock = Arc::new(TestClock::new());

        let event_id = retrying_record(&store, &clock, ChronoDuration::minutes(-1)).await;

        let sweeper = sweeper(queue.clone(), store.clone(), clock.clone());
        assert_eq!(sweeper.sweep().await, 1);

        // The queue entry is lost, as after a process crash, but the claim
        // stays on the record.
        queue.clear().await.unwrap();
        assert!(store.record(event_id).await.unwrap().next_retry_at.is_none());

        // Within the interval the claim is trusted.
        assert_eq!(sweeper.sweep().await, 0);

        // Past it the claim has gone stale and the record is swept again.
        clock.advance(SweeperConfig::default().sweep_interval + Duration::from_secs(1));
        assert_eq!(sweeper.sweep().await, 1);
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
