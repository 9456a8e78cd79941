//! Notification publishing, manual retry, and delivery history handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use courier_core::{CoreError, DeliveryRecord, EventId, EventPayload, UserId};
use courier_pipeline::{PipelineError, PublishOutcome};

use super::error_response;
use crate::AppState;

/// Request body for publishing a notification event.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Deduplication key; generated when absent.
    pub event_id: Option<Uuid>,
    /// Recipient user.
    pub user_id: Uuid,
    /// Channel destination, e.g. an email address.
    pub destination: String,
    /// Typed notification payload.
    pub payload: EventPayload,
}

/// Response from a successful publish.
#[derive(Debug, Serialize)]
pub struct PublishResponse {
    /// Deduplication key of the accepted event.
    pub event_id: EventId,
    /// Queue acceptance state.
    pub status: String,
}

/// Delivery record summary for API responses.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Producer-assigned deduplication key.
    pub event_id: EventId,
    /// Event type tag.
    pub kind: String,
    /// Channel destination.
    pub destination: String,
    /// Current delivery status.
    pub status: String,
    /// Send attempts consumed so far.
    pub attempt_count: i32,
    /// When the next retry becomes due, if scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Most recent failure description.
    pub last_error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl From<&DeliveryRecord> for RecordSummary {
    fn from(record: &DeliveryRecord) -> Self {
        Self {
            event_id: record.event_id,
            kind: record.kind.clone(),
            destination: record.destination.clone(),
            status: record.status.to_string(),
            attempt_count: record.attempt_count,
            next_retry_at: record.next_retry_at,
            last_error: record.last_error.clone(),
            created_at: record.created_at,
        }
    }
}

/// Pagination parameters for history queries.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum records returned, capped at 100.
    #[serde(default = "default_history_limit")]
    pub limit: i64,
    /// Records to skip.
    #[serde(default)]
    pub offset: i64,
}

fn default_history_limit() -> i64 {
    20
}

/// Publishes a notification event onto the queue.
///
/// Publishing is best effort: a refused queue returns 503 and the caller
/// decides whether the loss matters.
#[instrument(name = "publish_notification", skip(app_state, request), fields(user_id = %request.user_id))]
pub async fn publish_notification(
    State(app_state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Response {
    if request.destination.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "destination must not be empty",
        );
    }

    let event_id = request.event_id.map_or_else(EventId::new, EventId::from);
    let user_id = UserId::from(request.user_id);

    let outcome = app_state
        .publisher
        .publish_payload(event_id, user_id, request.destination, request.payload)
        .await;

    match outcome {
        PublishOutcome::Accepted => {
            info!(event_id = %event_id, "Notification event accepted");
            (
                StatusCode::ACCEPTED,
                Json(PublishResponse { event_id, status: "queued".to_string() }),
            )
                .into_response()
        },
        PublishOutcome::Rejected { reason } => {
            warn!(event_id = %event_id, reason = %reason, "Notification event rejected");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", reason)
        },
    }
}

/// Manually retries a failed delivery.
///
/// Only failed records with remaining attempt budget are eligible.
#[instrument(name = "retry_notification", skip(app_state))]
pub async fn retry_notification(
    Path(event_id): Path<Uuid>,
    State(app_state): State<AppState>,
) -> Response {
    let event_id = EventId::from(event_id);

    match app_state.controller.force_retry(event_id).await {
        Ok(record) => {
            info!(event_id = %event_id, "Manual retry accepted");
            (StatusCode::OK, Json(RecordSummary::from(&record))).into_response()
        },
        Err(PipelineError::Store(CoreError::NotFound(message))) => {
            warn!(event_id = %event_id, "Manual retry rejected");
            error_response(StatusCode::NOT_FOUND, "not_found", message)
        },
        Err(e) => {
            error!(event_id = %event_id, error = %e, "Manual retry failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "retry_failed", e.to_string())
        },
    }
}

/// Returns the delivery history for a user, newest first.
#[instrument(name = "user_history", skip(app_state, query))]
pub async fn user_history(
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    State(app_state): State<AppState>,
) -> Response {
    let limit = query.limit.clamp(1, 100);
    let offset = query.offset.max(0);

    match app_state.store.find_for_user(UserId::from(user_id), limit, offset).await {
        Ok(records) => {
            let summaries: Vec<RecordSummary> = records.iter().map(RecordSummary::from).collect();
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "user_id": user_id,
                    "count": summaries.len(),
                    "notifications": summaries,
                })),
            )
                .into_response()
        },
        Err(e) => {
            error!(user_id = %user_id, error = %e, "Failed to load delivery history");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "history_unavailable", e.to_string())
        },
    }
}
