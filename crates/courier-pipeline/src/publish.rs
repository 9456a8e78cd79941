//! Producer-side event publishing.
//!
//! Publishing is best effort. The caller's transaction (account signup, KYC
//! decision, login) must never fail because the notification queue is down,
//! so queue errors are logged and surfaced as an explicit rejection rather
//! than propagated.

use std::sync::Arc;

use tracing::{debug, warn};

use courier_core::{Clock, EventId, EventPayload, NotificationEvent, UserId};

use crate::queue::EventQueue;

/// Result of a publish attempt.
///
/// `Rejected` means the event was dropped; the owning business operation has
/// already committed and proceeds regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event was enqueued.
    Accepted,
    /// The event was dropped because the queue refused it.
    Rejected {
        /// Queue-reported failure description.
        reason: String,
    },
}

impl PublishOutcome {
    /// True when the event made it onto the queue.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Producer handle for pushing notification events onto the queue.
pub struct Publisher {
    queue: Arc<dyn EventQueue>,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    /// Creates a publisher over the given queue.
    pub fn new(queue: Arc<dyn EventQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock }
    }

    /// Publishes a fully-formed event.
    pub async fn publish(&self, event: NotificationEvent) -> PublishOutcome {
        let event_id = event.event_id;
        let kind = event.body.kind_label().to_string();

        match self.queue.push(event).await {
            Ok(()) => {
                debug!(event_id = %event_id, kind = %kind, "notification event published");
                PublishOutcome::Accepted
            },
            Err(e) => {
                warn!(
                    event_id = %event_id,
                    kind = %kind,
                    error = %e,
                    "failed to publish notification event, dropping"
                );
                PublishOutcome::Rejected { reason: e.to_string() }
            },
        }
    }

    /// Publishes a typed payload addressed to one recipient.
    pub async fn publish_payload(
        &self,
        event_id: EventId,
        user_id: UserId,
        destination: impl Into<String>,
        payload: EventPayload,
    ) -> PublishOutcome {
        let event =
            NotificationEvent::new(event_id, user_id, destination, payload, self.clock.now_utc());
        self.publish(event).await
    }
}
