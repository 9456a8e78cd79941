//! Polling delivery worker.
//!
//! The worker drains the event queue in fixed-size batches on a fixed tick,
//! creates the delivery record for each event, performs the send, and applies
//! the retry decision. Failures are contained per event; one bad payload or
//! provider error never aborts the rest of the batch.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::{
    storage::delivery_records::NewDeliveryRecord, Clock, DeliveryStatus, EventBody,
    NotificationEvent,
};

use crate::{
    error::{PipelineError, Result},
    queue::EventQueue,
    render::render,
    retry::{RetryDecision, RetryPolicy},
    sender::{ChannelSender, Outbound},
    store::DeliveryStore,
};

/// Worker tuning parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between queue polls.
    pub poll_interval: Duration,
    /// Maximum events drained per tick.
    pub max_batch_size: usize,
    /// Backoff and attempt budget policy.
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_batch_size: 5,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Lifetime counters for one worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    sent: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of the worker counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    /// Events dequeued and examined.
    pub processed: u64,
    /// Deliveries acknowledged by the channel.
    pub sent: u64,
    /// Deliveries scheduled for another attempt.
    pub retried: u64,
    /// Deliveries terminally failed.
    pub failed: u64,
    /// Events skipped as duplicates or already-handled.
    pub skipped: u64,
}

impl WorkerStats {
    /// Snapshots the counters.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Queue-draining delivery worker.
pub struct Worker {
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn DeliveryStore>,
    sender: Arc<dyn ChannelSender>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    cancel: CancellationToken,
    stats: Arc<WorkerStats>,
}

impl Worker {
    /// Creates a worker over injected collaborators.
    pub fn new(
        queue: Arc<dyn EventQueue>,
        store: Arc<dyn DeliveryStore>,
        sender: Arc<dyn ChannelSender>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        cancel: CancellationToken,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self { queue, store, sender, clock, config, cancel, stats }
    }

    /// Runs the poll loop until cancelled.
    ///
    /// Cancellation is honored at tick boundaries: a batch in flight is
    /// finished before the loop exits.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_batch_size = self.config.max_batch_size,
            "delivery worker started"
        );

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.tick().await;

            tokio::select! {
                () = self.clock.sleep(self.config.poll_interval) => {},
                () = self.cancel.cancelled() => break,
            }
        }

        info!("delivery worker stopped");
    }

    /// Drains and processes one batch.
    pub async fn tick(&self) {
        let batch = match self.queue.pop_batch(self.config.max_batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "failed to poll event queue");
                return;
            },
        };

        if batch.is_empty() {
            return;
        }

        debug!(batch_size = batch.len(), "processing notification batch");

        for event in batch {
            let event_id = event.event_id;
            self.stats.processed.fetch_add(1, Ordering::Relaxed);

            if let Err(e) = self.process_event(event).await {
                error!(event_id = %event_id, error = %e, "failed to process notification event");
            }
        }
    }

    async fn process_event(&self, event: NotificationEvent) -> Result<()> {
        let rendered = match &event.body {
            EventBody::Typed(payload) => Some(render(payload)),
            EventBody::Unrecognized(_) => None,
        };

        let new = NewDeliveryRecord {
            event_id: event.event_id,
            user_id: event.user_id,
            kind: event.body.kind_label().to_string(),
            destination: event.destination.clone(),
            subject: rendered.as_ref().map(|r| r.subject.clone()),
            body: rendered.as_ref().map(|r| r.body.clone()),
            payload: serde_json::to_value(&event.body).unwrap_or(serde_json::Value::Null),
        };

        let (record, existed) = self.store.create_if_absent(new).await?;

        if existed && !self.is_claimed_retry(&record) {
            debug!(
                event_id = %event.event_id,
                status = %record.status,
                "skipping event with existing delivery record"
            );
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let rendered = match rendered {
            Some(rendered) => rendered,
            None => {
                let err = PipelineError::template(event.body.kind_label());
                warn!(event_id = %event.event_id, error = %err, "unrecognized payload type");
                self.store.mark_failed(record.id, err.to_string()).await?;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            },
        };

        // Delivery may have concluded between dequeue and now, e.g. a
        // concurrent worker or a manual retry racing this one.
        let current = self
            .store
            .find_by_event_id(event.event_id)
            .await?
            .ok_or_else(|| PipelineError::Duplicate { event_id: event.event_id })?;
        if !current.status.is_sendable() {
            debug!(
                event_id = %event.event_id,
                status = %current.status,
                "delivery already concluded, skipping send"
            );
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let outbound = Outbound {
            to: event.destination.clone(),
            subject: rendered.subject,
            body: rendered.body,
        };

        match self.sender.send(outbound).await {
            Ok(ack) => {
                info!(
                    event_id = %event.event_id,
                    message_id = %ack.message_id,
                    attempt = current.attempt_count + 1,
                    "notification delivered"
                );
                self.store.mark_sent(current.id, ack).await?;
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                let decision = self.config.retry_policy.decide(
                    current.attempt_count as u32,
                    &e,
                    self.clock.now_utc(),
                );
                match decision {
                    RetryDecision::Retry { next_retry_at } => {
                        warn!(
                            event_id = %event.event_id,
                            error = %e,
                            attempt_count = current.attempt_count + 1,
                            next_retry_at = %next_retry_at,
                            "delivery failed, retry scheduled"
                        );
                        let max_attempts = self.config.retry_policy.max_attempts as i32;
                        self.store
                            .schedule_retry(current.id, e.to_string(), next_retry_at, max_attempts)
                            .await?;
                        self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    },
                    RetryDecision::GiveUp { reason } => {
                        error!(
                            event_id = %event.event_id,
                            error = %e,
                            reason = %reason,
                            "delivery failed permanently"
                        );
                        self.store.mark_failed(current.id, e.to_string()).await?;
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    },
                }
            },
        }

        Ok(())
    }

    /// True when an existing record represents a retry this worker should
    /// attempt now.
    ///
    /// A claimed retry has `next_retry_at` cleared by the sweeper; a due one
    /// still carries an elapsed timestamp. Anything else is a duplicate.
    fn is_claimed_retry(&self, record: &courier_core::DeliveryRecord) -> bool {
        record.status == DeliveryStatus::Retrying
            && (record.next_retry_at.is_none() || record.is_due_for_retry(self.clock.now_utc()))
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{EventId, EventPayload, TestClock, UserId};

    use super::*;
    use crate::{
        queue::InMemoryQueue,
        sender::mock::{MockChannelSender, MockOutcome},
        store::mock::MockDeliveryStore,
    };

    struct Harness {
        queue: Arc<InMemoryQueue>,
        store: Arc<MockDeliveryStore>,
        sender: Arc<MockChannelSender>,
        clock: Arc<TestClock>,
        worker: Worker,
    }

    fn harness() -> Harness {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let sender = Arc::new(MockChannelSender::new());
        let clock = Arc::new(TestClock::new());
        let worker = Worker::new(
            queue.clone(),
            store.clone(),
            sender.clone(),
            clock.clone(),
            WorkerConfig::default(),
            CancellationToken::new(),
            Arc::new(WorkerStats::default()),
        );
        Harness { queue, store, sender, clock, worker }
    }

    fn typed_event(clock: &TestClock) -> NotificationEvent {
        NotificationEvent::new(
            EventId::new(),
            UserId::new(),
            "user@example.com",
            EventPayload::KycPending { full_name: "Alan Turing".to_string() },
            clock.now_utc(),
        )
    }

    #[tokio::test]
    async fn successful_delivery_marks_record_sent() {
        let h = harness();
        let event = typed_event(&h.clock);
        let event_id = event.event_id;
        h.queue.push(event).await.unwrap();

        h.worker.tick().await;

        let record = h.store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(record.attempt_count, 0);
        assert!(record.provider_message_id.is_some());
        assert_eq!(h.sender.send_count().await, 1);
    }

    #[tokio::test]
    async fn transient_failure_schedules_first_retry() {
        let h = harness();
        h.sender.push_outcome(MockOutcome::Transient("connection reset".to_string())).await;
        let event = typed_event(&h.clock);
        let event_id = event.event_id;
        h.queue.push(event).await.unwrap();

        h.worker.tick().await;

        let record = h.store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.attempt_count, 1);
        let expected = h.clock.now_utc() + chrono::Duration::minutes(5);
        assert_eq!(record.next_retry_at, Some(expected));
    }

    #[tokio::test]
    async fn permanent_failure_does_not_retry() {
        let h = harness();
        h.sender.push_outcome(MockOutcome::Permanent("invalid address".to_string())).await;
        let event = typed_event(&h.clock);
        let event_id = event.event_id;
        h.queue.push(event).await.unwrap();

        h.worker.tick().await;

        let record = h.store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempt_count, 0);
    }

    #[tokio::test]
    async fn unrecognized_payload_fails_without_send() {
        let h = harness();
        let event = NotificationEvent {
            event_id: EventId::new(),
            user_id: UserId::new(),
            destination: "user@example.com".to_string(),
            body: EventBody::Unrecognized(serde_json::json!({"type": "MYSTERY"})),
            created_at: h.clock.now_utc(),
        };
        let event_id = event.event_id;
        h.queue.push(event).await.unwrap();

        h.worker.tick().await;

        let record = h.store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempt_count, 0);
        assert!(record.last_error.as_deref().unwrap().contains("MYSTERY"));
        assert_eq!(h.sender.send_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_event_is_sent_once() {
        let h = harness();
        let event = typed_event(&h.clock);
        h.queue.push(event.clone()).await.unwrap();
        h.queue.push(event.clone()).await.unwrap();

        h.worker.tick().await;

        assert_eq!(h.sender.send_count().await, 1);
        let record = h.store.record(event.event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert_eq!(h.store.record_count().await, 1);
    }

    #[tokio::test]
    async fn batch_survives_one_bad_event() {
        let h = harness();
        h.store.inject_create_error("deadlock detected").await;
        let poisoned = typed_event(&h.clock);
        let healthy = typed_event(&h.clock);
        h.queue.push(poisoned).await.unwrap();
        h.queue.push(healthy.clone()).await.unwrap();

        h.worker.tick().await;

        let record = h.store.record(healthy.event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(MockDeliveryStore::new());
        let sender = Arc::new(MockChannelSender::new());
        let clock = Arc::new(TestClock::new());
        let cancel = CancellationToken::new();
        let worker = Worker::new(
            queue,
            store,
            sender,
            clock,
            WorkerConfig::default(),
            cancel.clone(),
            Arc::new(WorkerStats::default()),
        );

        let handle = tokio::spawn(worker.run());
        cancel.cancel();
        handle.await.unwrap();
    }
}
