//! End-to-end pipeline tests over in-memory collaborators.
//!
//! These drive the public surface the way production does: events go in
//! through the publisher, the worker ticks against the queue, and the ledger
//! records every outcome. The channel and ledger are mocks so every path is
//! deterministic.

use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use tokio_util::sync::CancellationToken;

use courier_core::{
    Clock, DeliveryStatus, EventBody, EventId, EventPayload, NotificationEvent, TestClock, UserId,
};
use courier_pipeline::{
    queue::{mock::FlakyQueue, EventQueue, InMemoryQueue},
    sender::mock::{MockChannelSender, MockOutcome},
    store::mock::MockDeliveryStore,
    PipelineConfig, PipelineController, PublishOutcome, Publisher, RetrySweeper, SweeperConfig,
    Worker, WorkerConfig, WorkerState, WorkerStats,
};

struct Pipeline {
    queue: Arc<InMemoryQueue>,
    store: Arc<MockDeliveryStore>,
    sender: Arc<MockChannelSender>,
    clock: Arc<TestClock>,
    publisher: Publisher,
    worker: Worker,
    sweeper: RetrySweeper,
}

fn pipeline() -> Pipeline {
    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(MockDeliveryStore::new());
    let sender = Arc::new(MockChannelSender::new());
    let clock = Arc::new(TestClock::new());

    let publisher = Publisher::new(queue.clone(), clock.clone());
    let worker = Worker::new(
        queue.clone(),
        store.clone(),
        sender.clone(),
        clock.clone(),
        WorkerConfig::default(),
        CancellationToken::new(),
        Arc::new(WorkerStats::default()),
    );
    let sweeper = RetrySweeper::new(
        queue.clone(),
        store.clone(),
        clock.clone(),
        SweeperConfig::default(),
        CancellationToken::new(),
    );

    Pipeline { queue, store, sender, clock, publisher, worker, sweeper }
}

fn registration_payload() -> EventPayload {
    EventPayload::UserRegistration {
        full_name: "Margaret Hamilton".to_string(),
        registration_date: "2026-08-30".to_string(),
        kyc_status: "PENDING".to_string(),
    }
}

/// Runs one backoff cycle: advance past the due time, sweep the ledger, and
/// let the worker process the re-enqueued event.
async fn run_retry_cycle(p: &Pipeline, backoff: ChronoDuration) {
    p.clock.advance(backoff.to_std().unwrap() + Duration::from_secs(1));
    assert_eq!(p.sweeper.sweep().await, 1, "expected one due retry to re-enqueue");
    p.worker.tick().await;
}

#[tokio::test]
async fn happy_path_delivers_on_first_attempt() {
    let p = pipeline();
    let event_id = EventId::new();

    let outcome = p
        .publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;
    assert_eq!(outcome, PublishOutcome::Accepted);

    p.worker.tick().await;

    let record = p.store.record(event_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.kind, "USER_REGISTRATION");
    assert!(record.sent_at.is_some());
    assert!(record.provider_message_id.is_some());

    let sends = p.sender.invocations().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].to, "margaret@example.com");
    assert!(sends[0].subject.contains("Welcome to FinTech Bank"));
}

#[tokio::test]
async fn transient_failure_recovers_after_first_backoff() {
    let p = pipeline();
    p.sender.push_outcome(MockOutcome::Transient("gateway timeout".to_string())).await;
    let event_id = EventId::new();

    p.publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;
    p.worker.tick().await;

    let record = p.store.record(event_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Retrying);
    assert_eq!(record.attempt_count, 1);
    let scheduled = record.next_retry_at.unwrap();
    assert_eq!(scheduled - p.clock.now_utc(), ChronoDuration::minutes(5));

    // Not yet due, the sweep leaves it alone.
    assert_eq!(p.sweeper.sweep().await, 0);

    run_retry_cycle(&p, ChronoDuration::minutes(5)).await;

    let record = p.store.record(event_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(p.sender.send_count().await, 2);
}

#[tokio::test]
async fn persistent_failure_walks_full_backoff_then_gives_up() {
    let p = pipeline();
    p.sender
        .set_destination_outcome(
            "margaret@example.com",
            MockOutcome::Transient("connection refused".to_string()),
        )
        .await;
    let event_id = EventId::new();

    p.publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;
    p.worker.tick().await;

    for (expected_attempts, backoff_minutes) in [(1, 5), (2, 15), (3, 30)] {
        let record = p.store.record(event_id).await.unwrap();
        assert_eq!(record.status, DeliveryStatus::Retrying);
        assert_eq!(record.attempt_count, expected_attempts);
        let scheduled = record.next_retry_at.unwrap();
        assert_eq!(scheduled - p.clock.now_utc(), ChronoDuration::minutes(backoff_minutes));

        run_retry_cycle(&p, ChronoDuration::minutes(backoff_minutes)).await;
    }

    let record = p.store.record(event_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 3);
    assert!(record.failed_at.is_some());
    assert_eq!(p.sender.send_count().await, 4);

    // Terminal records never move again.
    assert_eq!(p.sweeper.sweep().await, 0);
}

#[tokio::test]
async fn duplicate_publishes_produce_one_record_and_one_send() {
    let p = pipeline();
    let event_id = EventId::new();
    let user_id = UserId::new();

    for _ in 0..3 {
        p.publisher
            .publish_payload(event_id, user_id, "margaret@example.com", registration_payload())
            .await;
    }

    p.worker.tick().await;
    p.worker.tick().await;

    assert_eq!(p.store.record_count().await, 1);
    assert_eq!(p.sender.send_count().await, 1);
    assert!(p.store.verify_status(event_id, DeliveryStatus::Sent).await);
}

#[tokio::test]
async fn unrecognized_event_type_fails_without_send_or_retry() {
    let p = pipeline();
    let event = NotificationEvent {
        event_id: EventId::new(),
        user_id: UserId::new(),
        destination: "margaret@example.com".to_string(),
        body: EventBody::Unrecognized(serde_json::json!({
            "type": "QUARTERLY_STATEMENT",
            "full_name": "Margaret Hamilton"
        })),
        created_at: p.clock.now_utc(),
    };
    let event_id = event.event_id;

    assert_eq!(p.publisher.publish(event).await, PublishOutcome::Accepted);
    p.worker.tick().await;

    let record = p.store.record(event_id).await.unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.kind, "QUARTERLY_STATEMENT");
    assert!(record.subject.is_none());
    assert!(record.last_error.as_deref().unwrap().contains("Template not found"));
    assert_eq!(p.sender.send_count().await, 0);

    // The record is terminal, later sweeps and ticks leave it alone.
    p.clock.advance(Duration::from_secs(3600));
    assert_eq!(p.sweeper.sweep().await, 0);
}

#[tokio::test]
async fn scheduled_retry_survives_a_restart() {
    let first = pipeline();
    first.sender.push_outcome(MockOutcome::Transient("gateway timeout".to_string())).await;
    let event_id = EventId::new();

    first
        .publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;
    first.worker.tick().await;
    assert!(first.store.verify_status(event_id, DeliveryStatus::Retrying).await);

    // A new process: fresh queue, fresh worker, same ledger and clock.
    let queue = Arc::new(InMemoryQueue::new());
    let sender = Arc::new(MockChannelSender::new());
    let worker = Worker::new(
        queue.clone(),
        first.store.clone(),
        sender.clone(),
        first.clock.clone(),
        WorkerConfig::default(),
        CancellationToken::new(),
        Arc::new(WorkerStats::default()),
    );
    let sweeper = RetrySweeper::new(
        queue.clone(),
        first.store.clone(),
        first.clock.clone(),
        SweeperConfig::default(),
        CancellationToken::new(),
    );

    first.clock.advance(Duration::from_secs(6 * 60));
    assert_eq!(sweeper.sweep().await, 1);
    worker.tick().await;

    assert!(first.store.verify_status(event_id, DeliveryStatus::Sent).await);
    assert_eq!(sender.send_count().await, 1);
}

#[tokio::test]
async fn retry_survives_a_queue_outage_during_the_sweep() {
    let queue = Arc::new(FlakyQueue::new());
    let store = Arc::new(MockDeliveryStore::new());
    let sender = Arc::new(MockChannelSender::new());
    let clock = Arc::new(TestClock::new());
    let publisher = Publisher::new(queue.clone(), clock.clone());
    let worker = Worker::new(
        queue.clone(),
        store.clone(),
        sender.clone(),
        clock.clone(),
        WorkerConfig::default(),
        CancellationToken::new(),
        Arc::new(WorkerStats::default()),
    );
    let sweeper = RetrySweeper::new(
        queue.clone(),
        store.clone(),
        clock.clone(),
        SweeperConfig::default(),
        CancellationToken::new(),
    );

    sender.push_outcome(MockOutcome::Transient("gateway timeout".to_string())).await;
    let event_id = EventId::new();
    publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;
    worker.tick().await;
    assert!(store.verify_status(event_id, DeliveryStatus::Retrying).await);

    // The backoff elapses, but the queue is down when the sweeper runs.
    clock.advance(Duration::from_secs(5 * 60 + 1));
    queue.inject_push_error("redis down").await;
    assert_eq!(sweeper.sweep().await, 0);
    worker.tick().await;
    assert_eq!(sender.send_count().await, 1);

    // The record is due again, the next sweep delivers it.
    assert_eq!(sweeper.sweep().await, 1);
    worker.tick().await;
    assert!(store.verify_status(event_id, DeliveryStatus::Sent).await);
    assert_eq!(sender.send_count().await, 2);
}

#[tokio::test]
async fn batch_is_bounded_and_leftovers_wait_for_next_tick() {
    let p = pipeline();
    for _ in 0..7 {
        p.publisher
            .publish_payload(
                EventId::new(),
                UserId::new(),
                "margaret@example.com",
                registration_payload(),
            )
            .await;
    }

    p.worker.tick().await;
    assert_eq!(p.sender.send_count().await, 5);
    assert_eq!(p.queue.len().await.unwrap(), 2);

    p.worker.tick().await;
    assert_eq!(p.sender.send_count().await, 7);
    assert_eq!(p.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn controller_runs_pipeline_and_stops_cleanly() {
    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(MockDeliveryStore::new());
    let sender = Arc::new(MockChannelSender::new());
    let clock = Arc::new(TestClock::new());
    let publisher = Publisher::new(queue.clone(), clock.clone());
    let controller = PipelineController::new(
        queue.clone(),
        store.clone(),
        sender.clone(),
        clock.clone(),
        PipelineConfig::default(),
    );

    let event_id = EventId::new();
    publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;

    controller.start().await;
    assert_eq!(controller.state().await, WorkerState::Running);

    // The worker loop runs on virtual time, yield until it drains the queue.
    for _ in 0..100 {
        if store.verify_status(event_id, DeliveryStatus::Sent).await {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(store.verify_status(event_id, DeliveryStatus::Sent).await);

    controller.stop().await.unwrap();
    assert_eq!(controller.state().await, WorkerState::Stopped);

    // Stopped pipeline leaves new events on the queue.
    publisher
        .publish_payload(EventId::new(), UserId::new(), "m@example.com", registration_payload())
        .await;
    let status = controller.status().await.unwrap();
    assert_eq!(status.queue_length, 1);
    assert_eq!(status.records.sent, 1);
}

#[tokio::test]
async fn force_retry_requeues_failed_delivery_below_budget() {
    let p = pipeline();
    p.sender.push_outcome(MockOutcome::Permanent("mailbox full".to_string())).await;
    let event_id = EventId::new();

    p.publisher
        .publish_payload(event_id, UserId::new(), "margaret@example.com", registration_payload())
        .await;
    p.worker.tick().await;
    assert!(p.store.verify_status(event_id, DeliveryStatus::Failed).await);

    let controller = PipelineController::new(
        p.queue.clone(),
        p.store.clone(),
        p.sender.clone(),
        p.clock.clone(),
        PipelineConfig::default(),
    );

    let revived = controller.force_retry(event_id).await.unwrap();
    assert_eq!(revived.status, DeliveryStatus::Retrying);

    p.worker.tick().await;
    assert!(p.store.verify_status(event_id, DeliveryStatus::Sent).await);
}
