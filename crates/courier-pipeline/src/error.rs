//! Error types for the notification delivery pipeline.
//!
//! Carries the failure taxonomy that drives retry decisions: transient
//! channel failures are retryable, permanent rejections and template
//! failures are not, and duplicates are an idempotent skip rather than an
//! error.

use thiserror::Error;

use courier_core::EventId;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while processing a notification.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Transient channel failure: network, timeout, or rate limiting.
    ///
    /// Retryable up to the attempt budget.
    #[error("Transient channel error: {reason}")]
    TransientChannel {
        /// What went wrong.
        reason: String,
    },

    /// Permanent channel failure: invalid destination or provider rejection.
    ///
    /// Never retried.
    #[error("Permanent channel error: {reason}")]
    PermanentChannel {
        /// What went wrong.
        reason: String,
    },

    /// Template failure: unknown event type or malformed payload.
    ///
    /// Never retried; indicates a producer-side defect.
    #[error("Template not found for type: {kind}")]
    Template {
        /// The event type tag that has no template.
        kind: String,
    },

    /// The event was already processed.
    ///
    /// Not a failure; signals an idempotent skip.
    #[error("Duplicate event: {event_id} already processed")]
    Duplicate {
        /// The deduplication key that matched an existing record.
        event_id: EventId,
    },

    /// The queue could not accept or serve events.
    #[error("Queue unavailable: {reason}")]
    QueueUnavailable {
        /// What went wrong.
        reason: String,
    },

    /// Delivery ledger operation failed.
    #[error("Store error: {0}")]
    Store(#[from] courier_core::CoreError),

    /// Pipeline configuration is invalid.
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What is invalid.
        reason: String,
    },

    /// Shutdown did not complete within the allotted time.
    #[error("Shutdown timeout: {reason}")]
    ShutdownTimeout {
        /// Which part timed out.
        reason: String,
    },

    /// A worker task panicked.
    #[error("Worker panic: {reason}")]
    WorkerPanic {
        /// Join error description.
        reason: String,
    },
}

impl PipelineError {
    /// Creates a transient channel error.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientChannel { reason: reason.into() }
    }

    /// Creates a permanent channel error.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentChannel { reason: reason.into() }
    }

    /// Creates a template error for an unrenderable event type.
    pub fn template(kind: impl Into<String>) -> Self {
        Self::Template { kind: kind.into() }
    }

    /// Creates a queue availability error.
    pub fn queue_unavailable(reason: impl Into<String>) -> Self {
        Self::QueueUnavailable { reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    /// Whether a failed send should consume retry budget and be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientChannel { .. } | Self::QueueUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(PipelineError::transient("connection refused").is_retryable());
        assert!(PipelineError::queue_unavailable("redis down").is_retryable());
    }

    #[test]
    fn permanent_and_template_errors_are_not_retryable() {
        assert!(!PipelineError::permanent("mailbox does not exist").is_retryable());
        assert!(!PipelineError::template("UNKNOWN_TYPE").is_retryable());
        assert!(!PipelineError::Duplicate { event_id: EventId::new() }.is_retryable());
    }

    #[test]
    fn template_error_names_the_offending_type() {
        let err = PipelineError::template("ACCOUNT_CLOSED");
        assert_eq!(err.to_string(), "Template not found for type: ACCOUNT_CLOSED");
    }
}
