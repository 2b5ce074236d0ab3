//! HTTP surface: webhook ingestion, queue operations, console sends, health.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{Instrument, error, info, warn};

use crate::channels::{MessageIntent, MessageSender};
use crate::error::{ChannelError, DatabaseError, PipelineError};
use crate::logging::{self, component};
use crate::pipeline::{MessageRouter, ProcessorTrigger, validate_body};
use crate::store::JobQueue;

/// Default page size of `GET /queue/failed`.
const FAILED_JOBS_LIMIT: usize = 50;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<MessageRouter>,
    pub queue: Arc<dyn JobQueue>,
    pub sender: MessageSender,
    pub trigger: ProcessorTrigger,
}

/// Build the axum router.
pub fn app_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/queue/process", post(process_queue))
        .route("/queue/failed", get(list_failed))
        .route("/queue/failed/{id}/retry", post(retry_failed))
        .route("/messages/send", post(send_message))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.queue_counts().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "chatroute",
                "queue": counts,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Health check could not read the queue");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "service": "chatroute",
                    "error": e.to_string(),
                })),
            )
        }
    }
}

// ── Webhook ─────────────────────────────────────────────────────────

async fn webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let event = match validate_body(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(problems = e.problems.len(), error = %e, "Rejected inbound payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid payload",
                    "problems": e.problems,
                })),
            )
                .into_response();
        }
    };

    match state.router.route(event).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => {
            let status = match e {
                PipelineError::HumanForward(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_body(status, e.to_string())
        }
    }
}

// ── Queue ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    trigger: String,
}

/// Nudge the processor. Always succeeds, whatever the body.
async fn process_queue(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let trigger = serde_json::from_slice::<TriggerRequest>(&body)
        .map(|r| r.trigger)
        .unwrap_or_else(|_| "unspecified".to_string());
    let queued = state.trigger.nudge();
    info!(trigger = %trigger, queued, "Queue processing requested");
    Json(json!({ "success": true }))
}

#[derive(Debug, Deserialize)]
struct FailedQuery {
    limit: Option<usize>,
}

async fn list_failed(
    State(state): State<AppState>,
    Query(query): Query<FailedQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(FAILED_JOBS_LIMIT);
    match state.queue.failed_jobs(limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list failed jobs");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn retry_failed(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.queue.retry_failed(&id).await {
        Ok(()) => {
            state.trigger.nudge();
            (
                StatusCode::OK,
                Json(json!({ "status": "requeued", "id": id })),
            )
                .into_response()
        }
        Err(DatabaseError::NotFound { .. }) => {
            error_body(StatusCode::NOT_FOUND, "Job not found or not failed")
        }
        Err(e) => {
            error!(job_id = %id, error = %e, "Failed to requeue job");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Console sends ───────────────────────────────────────────────────

async fn send_message(State(state): State<AppState>, Json(raw): Json<Value>) -> Response {
    let intent = match MessageIntent::from_request(&raw) {
        Ok(intent) => intent,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let correlation_id = uuid::Uuid::new_v4().to_string();
    let span = logging::pipeline_span(
        component::SENDER,
        &correlation_id,
        Some(&intent.target_phone),
    );

    match state.sender.send(&intent).instrument(span).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "correlationId": correlation_id })),
        )
            .into_response(),
        Err(e @ (ChannelError::UnsupportedMessageType(_) | ChannelError::InvalidIntent { .. })) => {
            error_body(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!(error = %e, "Console send failed");
            error_body(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}
