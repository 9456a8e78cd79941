//! Pipeline lifecycle and queue management handlers.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, info, instrument};

use courier_core::StatusCounts;

use super::error_response;
use crate::AppState;

/// Response for start and stop requests.
#[derive(Debug, Serialize)]
pub struct LifecycleResponse {
    /// Pipeline state after the request.
    pub worker_state: courier_pipeline::WorkerState,
}

/// Aggregate delivery statistics.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Record counts per status.
    pub records: StatusCounts,
    /// Total records in the ledger.
    pub total: i64,
    /// Events waiting on the queue.
    pub queue_length: usize,
}

/// Returns the operational status of the pipeline.
#[instrument(name = "pipeline_status", skip(app_state))]
pub async fn pipeline_status(State(app_state): State<AppState>) -> Response {
    match app_state.controller.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to build pipeline status");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "status_unavailable", e.to_string())
        },
    }
}

/// Starts the delivery worker and retry sweeper.
///
/// Starting an already running pipeline is a no-op and still returns 200.
#[instrument(name = "start_pipeline", skip(app_state))]
pub async fn start_pipeline(State(app_state): State<AppState>) -> Response {
    app_state.controller.start().await;
    let worker_state = app_state.controller.state().await;
    info!("Pipeline start requested");
    (StatusCode::OK, Json(LifecycleResponse { worker_state })).into_response()
}

/// Stops the pipeline, letting the current batch finish.
///
/// Stopping an already stopped pipeline is a no-op and still returns 200.
#[instrument(name = "stop_pipeline", skip(app_state))]
pub async fn stop_pipeline(State(app_state): State<AppState>) -> Response {
    match app_state.controller.stop().await {
        Ok(()) => {
            info!("Pipeline stop completed");
            let worker_state = app_state.controller.state().await;
            (StatusCode::OK, Json(LifecycleResponse { worker_state })).into_response()
        },
        Err(e) => {
            error!(error = %e, "Pipeline stop failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "shutdown_failed", e.to_string())
        },
    }
}

/// Discards every event waiting on the queue.
///
/// Delivery records are untouched; only undelivered queue entries are lost.
#[instrument(name = "clear_queue", skip(app_state))]
pub async fn clear_queue(State(app_state): State<AppState>) -> Response {
    match app_state.controller.clear_queue().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "cleared": true }))).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to clear queue");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "queue_unavailable", e.to_string())
        },
    }
}

/// Returns aggregate delivery statistics from the ledger.
#[instrument(name = "pipeline_stats", skip(app_state))]
pub async fn pipeline_stats(State(app_state): State<AppState>) -> Response {
    let records = match app_state.store.count_by_status().await {
        Ok(counts) => counts,
        Err(e) => {
            error!(error = %e, "Failed to count delivery records");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "stats_unavailable",
                e.to_string(),
            );
        },
    };

    let queue_length = app_state.controller.queue_length().await.unwrap_or(0);
    let total = records.pending + records.sent + records.failed + records.retrying;

    (StatusCode::OK, Json(StatsResponse { records, total, queue_length })).into_response()
}
