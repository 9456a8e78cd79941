//! Core domain models and strongly-typed identifiers.
//!
//! Defines notification events, the typed payload catalog, delivery records,
//! and newtype ID wrappers for compile-time type safety. Includes database
//! serialization traits and state transition rules for the delivery pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed event identifier.
///
/// Wraps a UUID to prevent mixing with other ID types. The producer assigns
/// this once per logical occurrence and reuses it verbatim on any re-publish,
/// so it doubles as the deduplication key.
///
/// # Example
///
/// ```
/// use courier_core::models::EventId;
/// let event_id = EventId::new();
/// println!("Processing event: {}", event_id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Creates a new random event ID.
    ///
    /// Uses UUID v4 for globally unique identifiers without coordination.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed user identifier.
///
/// Identifies the recipient a notification belongs to. Assigned by the
/// upstream account system; opaque to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Creates a new random user ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for UserId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for UserId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for UserId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery record lifecycle status.
///
/// Records progress through these states during processing. State transitions
/// are strictly controlled to maintain consistency:
///
/// ```text
/// Pending -> Sent
///         -> Retrying -> ... -> Sent
///         |                  -> Failed (retry budget exhausted)
///         -> Failed (non-retryable error)
/// ```
///
/// `Sent` is always terminal. `Failed` with the attempt budget consumed is
/// terminal; `Failed` below the budget can be revived administratively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Record created, delivery not yet attempted.
    Pending,

    /// Successfully handed to the channel provider.
    ///
    /// Terminal success state. The record will not change again.
    Sent,

    /// Delivery gave up.
    ///
    /// Reached on a non-retryable error or once the retry budget is
    /// exhausted.
    Failed,

    /// A transient failure occurred and a retry is scheduled.
    ///
    /// `next_retry_at` carries the earliest time the next attempt may run.
    Retrying,
}

impl DeliveryStatus {
    /// True for states that accept a send attempt.
    pub fn is_sendable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Typed notification payload, tagged by event type.
///
/// Each variant declares exactly the fields its template needs, so a payload
/// that deserializes is renderable by construction. Producers build variants
/// directly; malformed or unrecognized payloads only enter the system through
/// the wire format (see [`EventBody`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// A new account finished registration.
    #[serde(rename = "USER_REGISTRATION")]
    UserRegistration {
        /// Recipient display name.
        full_name: String,
        /// Date the account was created, as shown to the user.
        registration_date: String,
        /// KYC state at registration time (typically "PENDING").
        kyc_status: String,
    },

    /// A sign-in from a new device or location.
    #[serde(rename = "LOGIN_ALERT")]
    LoginAlert {
        /// Recipient display name.
        full_name: String,
        /// When the sign-in happened.
        login_time: String,
        /// Source address of the sign-in.
        ip_address: String,
        /// Reported user agent string.
        user_agent: String,
        /// Coarse device classification ("web", "mobile", ...).
        device_type: String,
    },

    /// Identity verification is required to unlock the account.
    #[serde(rename = "KYC_PENDING")]
    KycPending {
        /// Recipient display name.
        full_name: String,
    },

    /// Identity verification completed successfully.
    #[serde(rename = "KYC_VERIFIED")]
    KycVerified {
        /// Recipient display name.
        full_name: String,
        /// Date the verification was approved.
        verified_date: String,
    },

    /// Identity verification was rejected.
    #[serde(rename = "KYC_REJECTED")]
    KycRejected {
        /// Recipient display name.
        full_name: String,
        /// Reviewer-provided rejection reason.
        reason: String,
    },

    /// The account transitioned to active.
    #[serde(rename = "ACCOUNT_ACTIVATED")]
    AccountActivated {
        /// Recipient display name.
        full_name: String,
        /// Date of activation.
        activation_date: String,
    },

    /// A suspicious action was observed on the account.
    #[serde(rename = "SECURITY_ALERT")]
    SecurityAlert {
        /// Recipient display name.
        full_name: String,
        /// Short machine-readable alert class.
        alert_kind: String,
        /// Human-readable detail for the notification body.
        detail: String,
    },
}

impl EventPayload {
    /// Canonical type tag for this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserRegistration { .. } => "USER_REGISTRATION",
            Self::LoginAlert { .. } => "LOGIN_ALERT",
            Self::KycPending { .. } => "KYC_PENDING",
            Self::KycVerified { .. } => "KYC_VERIFIED",
            Self::KycRejected { .. } => "KYC_REJECTED",
            Self::AccountActivated { .. } => "ACCOUNT_ACTIVATED",
            Self::SecurityAlert { .. } => "SECURITY_ALERT",
        }
    }
}

/// Wire-level event body.
///
/// The queue is multi-producer and transports serialized events, so the
/// consumer must tolerate payloads it does not recognize. Deserialization
/// tries the typed catalog first and falls back to the raw value; the worker
/// treats the fallback as a non-retryable template failure rather than
/// dropping the event silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventBody {
    /// A payload from the known catalog.
    Typed(EventPayload),
    /// Anything else that arrived on the queue.
    Unrecognized(serde_json::Value),
}

impl EventBody {
    /// Type tag for logging and record keeping.
    ///
    /// For unrecognized payloads this is whatever the producer claimed in
    /// the `type` field, or `"UNKNOWN"` when even that is missing.
    pub fn kind_label(&self) -> String {
        match self {
            Self::Typed(payload) => payload.kind().to_string(),
            Self::Unrecognized(value) => value
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN")
                .to_string(),
        }
    }

    /// Returns the typed payload, if this body is from the known catalog.
    pub fn as_typed(&self) -> Option<&EventPayload> {
        match self {
            Self::Typed(payload) => Some(payload),
            Self::Unrecognized(_) => None,
        }
    }
}

impl From<EventPayload> for EventBody {
    fn from(payload: EventPayload) -> Self {
        Self::Typed(payload)
    }
}

/// A notification request in transport form.
///
/// Ephemeral: lives on the queue between the producer and the worker. The
/// durable history lives in [`DeliveryRecord`], one per `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Producer-assigned deduplication key.
    pub event_id: EventId,

    /// Recipient user.
    pub user_id: UserId,

    /// Channel destination, e.g. an email address.
    pub destination: String,

    /// Typed render data.
    pub body: EventBody,

    /// When the producer emitted the event.
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    /// Creates an event around a typed payload.
    pub fn new(
        event_id: EventId,
        user_id: UserId,
        destination: impl Into<String>,
        payload: EventPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            user_id,
            destination: destination.into(),
            body: EventBody::Typed(payload),
            created_at,
        }
    }
}

/// Provider acknowledgement for a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    /// Provider-assigned message identifier.
    pub message_id: String,
    /// Raw provider response line, kept for audit.
    pub provider_response: Option<String>,
}

/// Durable, one-record-per-event delivery ledger entry.
///
/// Created by the worker on first dequeue, mutated only by the worker and
/// the retry sweeper. Once `Sent`, or `Failed` with the attempt budget
/// consumed, the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    /// Unique record identifier.
    pub id: Uuid,

    /// Deduplication key; unique across all records.
    pub event_id: EventId,

    /// Recipient user.
    pub user_id: UserId,

    /// Event type tag as received from the producer.
    pub kind: String,

    /// Channel destination the notification goes to.
    pub destination: String,

    /// Rendered subject, absent when rendering failed.
    pub subject: Option<String>,

    /// Rendered body, absent when rendering failed.
    pub body: Option<String>,

    /// Current lifecycle state.
    pub status: DeliveryStatus,

    /// Number of failed send attempts that consumed retry budget.
    ///
    /// Monotonic; never exceeds the configured maximum. Non-retryable
    /// failures do not increment it.
    pub attempt_count: i32,

    /// Earliest time the next retry may run, while `Retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Most recent failure description.
    pub last_error: Option<String>,

    /// Provider message ID from the successful send.
    pub provider_message_id: Option<String>,

    /// Raw provider response from the successful send.
    pub provider_response: Option<String>,

    /// Original event body, kept for retry reconstruction.
    pub payload: sqlx::types::Json<serde_json::Value>,

    /// When the notification was handed to the provider.
    pub sent_at: Option<DateTime<Utc>>,

    /// When delivery terminally failed.
    pub failed_at: Option<DateTime<Utc>>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// True once no further transition is permitted.
    pub fn is_terminal(&self, max_attempts: i32) -> bool {
        match self.status {
            DeliveryStatus::Sent => true,
            DeliveryStatus::Failed => self.attempt_count >= max_attempts,
            DeliveryStatus::Pending | DeliveryStatus::Retrying => false,
        }
    }

    /// True when a retry is scheduled and its backoff has elapsed.
    pub fn is_due_for_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Retrying
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Rebuilds the transport-form event from the stored record.
    ///
    /// Used by the retry sweeper to re-publish an event whose in-memory
    /// timer was lost.
    pub fn to_event(&self) -> NotificationEvent {
        let body = serde_json::from_value(self.payload.0.clone())
            .unwrap_or_else(|_| EventBody::Unrecognized(self.payload.0.clone()));
        NotificationEvent {
            event_id: self.event_id,
            user_id: self.user_id,
            destination: self.destination.clone(),
            body,
            created_at: self.created_at,
        }
    }
}

/// Backlog snapshot by status, for the operational surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Records awaiting a first attempt.
    pub pending: i64,
    /// Records delivered successfully.
    pub sent: i64,
    /// Records that gave up.
    pub failed: i64,
    /// Records waiting on a retry backoff.
    pub retrying: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(status: DeliveryStatus, attempt_count: i32) -> DeliveryRecord {
        DeliveryRecord {
            id: Uuid::new_v4(),
            event_id: EventId::new(),
            user_id: UserId::new(),
            kind: "USER_REGISTRATION".to_string(),
            destination: "a@b.com".to_string(),
            subject: Some("subject".to_string()),
            body: Some("body".to_string()),
            status,
            attempt_count,
            next_retry_at: None,
            last_error: None,
            provider_message_id: None,
            provider_response: None,
            payload: sqlx::types::Json(serde_json::json!({"type": "USER_REGISTRATION"})),
            sent_at: None,
            failed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn delivery_status_display_format() {
        assert_eq!(DeliveryStatus::Pending.to_string(), "pending");
        assert_eq!(DeliveryStatus::Sent.to_string(), "sent");
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
        assert_eq!(DeliveryStatus::Retrying.to_string(), "retrying");
    }

    #[test]
    fn sent_is_always_terminal() {
        assert!(record_with(DeliveryStatus::Sent, 0).is_terminal(3));
    }

    #[test]
    fn failed_below_budget_is_not_terminal() {
        // Template failures land here with attempt_count 0; an operator may
        // still force a retry.
        assert!(!record_with(DeliveryStatus::Failed, 0).is_terminal(3));
        assert!(record_with(DeliveryStatus::Failed, 3).is_terminal(3));
    }

    #[test]
    fn payload_round_trips_through_type_tag() {
        let payload = EventPayload::LoginAlert {
            full_name: "Ada Lovelace".to_string(),
            login_time: "2026-08-30 09:00".to_string(),
            ip_address: "203.0.113.7".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            device_type: "web".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "LOGIN_ALERT");

        let body: EventBody = serde_json::from_value(json).unwrap();
        assert_eq!(body.kind_label(), "LOGIN_ALERT");
        assert!(body.as_typed().is_some());
    }

    #[test]
    fn unrecognized_payload_keeps_claimed_type() {
        let body: EventBody =
            serde_json::from_value(serde_json::json!({"type": "UNKNOWN_TYPE", "x": 1})).unwrap();
        assert_eq!(body.kind_label(), "UNKNOWN_TYPE");
        assert!(body.as_typed().is_none());
    }

    #[test]
    fn retry_due_requires_elapsed_backoff() {
        let now = Utc::now();
        let mut record = record_with(DeliveryStatus::Retrying, 1);
        record.next_retry_at = Some(now + chrono::Duration::minutes(5));
        assert!(!record.is_due_for_retry(now));
        assert!(record.is_due_for_retry(now + chrono::Duration::minutes(5)));
    }
}
