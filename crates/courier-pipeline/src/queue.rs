//! Queue abstraction between event producers and the worker.
//!
//! The queue absorbs rate mismatch and tolerates brief consumer downtime.
//! Trait-based so tests run on the in-memory implementation while
//! deployments can share a Redis list across producer processes. Dequeue
//! order is FIFO; retried events re-enter at the tail, so global FIFO across
//! retries is deliberately not preserved.

use std::{collections::VecDeque, future::Future, pin::Pin};

use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::warn;

use courier_core::NotificationEvent;

use crate::error::{PipelineError, Result};

/// Queue operations required by the pipeline.
///
/// `push` and `pop_batch` never block the caller beyond the I/O itself, and
/// an empty queue yields an empty batch rather than waiting.
pub trait EventQueue: Send + Sync + 'static {
    /// Appends an event at the tail.
    fn push(
        &self,
        event: NotificationEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Removes and returns up to `max_n` events in FIFO publish order.
    fn pop_batch(
        &self,
        max_n: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NotificationEvent>>> + Send + '_>>;

    /// Current backlog size, for observability.
    fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;

    /// Irreversibly discards everything in the queue.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// In-process queue for tests and single-process deployments.
///
/// Externally synchronized via an async mutex; producers and the worker may
/// share it freely across tasks.
pub struct InMemoryQueue {
    entries: Mutex<VecDeque<NotificationEvent>>,
}

impl InMemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self { entries: Mutex::new(VecDeque::new()) }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue for InMemoryQueue {
    fn push(
        &self,
        event: NotificationEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.entries.lock().await.push_back(event);
            Ok(())
        })
    }

    fn pop_batch(
        &self,
        max_n: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NotificationEvent>>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let take = max_n.min(entries.len());
            Ok(entries.drain(..take).collect())
        })
    }

    fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move { Ok(self.entries.lock().await.len()) })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.entries.lock().await.clear();
            Ok(())
        })
    }
}

/// Redis-list queue for multi-process deployments.
///
/// Producers `LPUSH` serialized events and the worker `RPOP`s a batch, so
/// publish order is consumption order. Entries that fail to deserialize are
/// logged and dropped; the queue is transport, the ledger is the durable
/// record.
pub struct RedisQueue {
    conn: redis::aio::ConnectionManager,
    key: String,
}

impl RedisQueue {
    /// Default Redis key holding the event list.
    pub const DEFAULT_KEY: &'static str = "notification_events";

    /// Connects to Redis and prepares the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueUnavailable` if the connection cannot be established.
    pub async fn connect(url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PipelineError::queue_unavailable(format!("invalid redis url: {e}")))?;
        let conn = client.get_connection_manager().await.map_err(|e| {
            PipelineError::queue_unavailable(format!("redis connection failed: {e}"))
        })?;

        Ok(Self { conn, key: key.into() })
    }
}

fn redis_err(err: redis::RedisError) -> PipelineError {
    PipelineError::queue_unavailable(err.to_string())
}

impl EventQueue for RedisQueue {
    fn push(
        &self,
        event: NotificationEvent,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        Box::pin(async move {
            let serialized = serde_json::to_string(&event)
                .map_err(|e| PipelineError::queue_unavailable(format!("serialize failed: {e}")))?;
            let _: () = conn.lpush(&key, serialized).await.map_err(redis_err)?;
            Ok(())
        })
    }

    fn pop_batch(
        &self,
        max_n: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NotificationEvent>>> + Send + '_>> {
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        Box::pin(async move {
            let Some(count) = std::num::NonZeroUsize::new(max_n) else {
                return Ok(Vec::new());
            };

            let raw: Vec<String> = conn.rpop(&key, Some(count)).await.map_err(redis_err)?;

            let mut events = Vec::with_capacity(raw.len());
            for entry in raw {
                match serde_json::from_str::<NotificationEvent>(&entry) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable queue entry");
                    },
                }
            }
            Ok(events)
        })
    }

    fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        Box::pin(async move {
            let len: usize = conn.llen(&key).await.map_err(redis_err)?;
            Ok(len)
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let mut conn = self.conn.clone();
        let key = self.key.clone();
        Box::pin(async move {
            let _: () = conn.del(&key).await.map_err(redis_err)?;
            Ok(())
        })
    }
}

pub mod mock {
    //! Queue test double with failure injection.

    use std::{future::Future, pin::Pin};

    use tokio::sync::Mutex;

    use courier_core::NotificationEvent;

    use super::{EventQueue, InMemoryQueue};
    use crate::error::{PipelineError, Result};

    /// In-memory queue that can simulate outages.
    ///
    /// Injected errors are consumed one operation at a time, matching the
    /// transient nature of real queue failures.
    pub struct FlakyQueue {
        inner: InMemoryQueue,
        push_error: Mutex<Option<String>>,
        pop_error: Mutex<Option<String>>,
    }

    impl FlakyQueue {
        /// Creates a queue with no pending failures.
        pub fn new() -> Self {
            Self {
                inner: InMemoryQueue::new(),
                push_error: Mutex::new(None),
                pop_error: Mutex::new(None),
            }
        }

        /// Makes the next `push` fail with the given reason.
        pub async fn inject_push_error(&self, reason: impl Into<String>) {
            *self.push_error.lock().await = Some(reason.into());
        }

        /// Makes the next `pop_batch` fail with the given reason.
        pub async fn inject_pop_error(&self, reason: impl Into<String>) {
            *self.pop_error.lock().await = Some(reason.into());
        }
    }

    impl Default for FlakyQueue {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EventQueue for FlakyQueue {
        fn push(
            &self,
            event: NotificationEvent,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if let Some(reason) = self.push_error.lock().await.take() {
                    return Err(PipelineError::queue_unavailable(reason));
                }
                self.inner.push(event).await
            })
        }

        fn pop_batch(
            &self,
            max_n: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<NotificationEvent>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(reason) = self.pop_error.lock().await.take() {
                    return Err(PipelineError::queue_unavailable(reason));
                }
                self.inner.pop_batch(max_n).await
            })
        }

        fn len(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
            self.inner.len()
        }

        fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            self.inner.clear()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use courier_core::{EventId, EventPayload, NotificationEvent, UserId};

    use super::*;

    fn event(n: u32) -> NotificationEvent {
        NotificationEvent::new(
            EventId::new(),
            UserId::new(),
            format!("user{n}@example.com"),
            EventPayload::KycPending { full_name: format!("User {n}") },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn pop_batch_preserves_fifo_order() {
        let queue = InMemoryQueue::new();
        let first = event(1);
        let second = event(2);
        let third = event(3);

        queue.push(first.clone()).await.unwrap();
        queue.push(second.clone()).await.unwrap();
        queue.push(third.clone()).await.unwrap();

        let batch = queue.pop_batch(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event_id, first.event_id);
        assert_eq!(batch[1].event_id, second.event_id);

        let rest = queue.pop_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_id, third.event_id);
    }

    #[tokio::test]
    async fn pop_batch_never_exceeds_limit() {
        let queue = InMemoryQueue::new();
        for n in 0..8 {
            queue.push(event(n)).await.unwrap();
        }

        let batch = queue.pop_batch(5).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(queue.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_queue_yields_empty_batch() {
        let queue = InMemoryQueue::new();
        assert!(queue.pop_batch(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_discards_backlog() {
        let queue = InMemoryQueue::new();
        queue.push(event(1)).await.unwrap();
        queue.push(event(2)).await.unwrap();

        queue.clear().await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flaky_queue_consumes_injected_error() {
        let queue = mock::FlakyQueue::new();
        queue.inject_push_error("connection reset").await;

        let err = queue.push(event(1)).await.unwrap_err();
        assert!(matches!(err, PipelineError::QueueUnavailable { .. }));

        // Second push succeeds; the injected failure is one-shot.
        queue.push(event(2)).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
