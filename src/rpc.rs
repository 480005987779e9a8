use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::aggregation::{AggregationService, ResponseAck, ResponseRejected, SessionStatus};
use crate::registry::ResponseRegistry;
use crate::types::{QuorumNum, SignedResponse, TaskIndex};

// worker-facing surface: signed-response intake plus the probes
// operators point their monitoring at
pub struct AppState {
    pub aggregation: Arc<AggregationService>,
    pub registry: Arc<ResponseRegistry>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/signed-response", post(submit_signed_response))
        .route("/task/:task_index/status", get(task_status))
        .with_state(state)
}

async fn health() -> &'static str {
    "aggregator is running"
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub task_index: TaskIndex,

    pub ack: &'static str,
}

fn rejection_status(rejected: &ResponseRejected) -> StatusCode {
    match rejected {
        ResponseRejected::TaskNotFound { .. } => StatusCode::NOT_FOUND,
        ResponseRejected::OperatorNotInQuorum { .. }
        | ResponseRejected::InvalidSignature(_)
        | ResponseRejected::DigestMismatch { .. } => StatusCode::BAD_REQUEST,
    }
}

async fn submit_signed_response(
    State(state): State<Arc<AppState>>,
    Json(response): Json<SignedResponse>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let task_index = response.task_index;
    match state.aggregation.process_signed_response(response).await {
        Ok(ack) => {
            debug!("task `{task_index}`: response acked as {ack:?}");
            let ack = match ack {
                ResponseAck::Counted => "counted",
                ResponseAck::Recorded => "recorded",
                ResponseAck::SessionClosed => "sessionClosed",
            };
            Ok(Json(SubmitReceipt { task_index, ack }))
        }
        Err(rejected) => {
            warn!("task `{task_index}`: response rejected: {rejected}");
            Err((rejection_status(&rejected), rejected.to_string()))
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_index: TaskIndex,

    pub status: SessionStatus,

    pub response_count: usize,

    pub quorum_numbers: Vec<QuorumNum>,

    pub task_created_block: u64,
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(task_index): Path<TaskIndex>,
) -> Result<Json<TaskStatusView>, (StatusCode, String)> {
    let record = state
        .registry
        .get_task(task_index)
        .ok_or((StatusCode::NOT_FOUND, format!("task {task_index} not found")))?;
    // a record can exist a beat before its session opens
    let status = state
        .aggregation
        .session_status(task_index)
        .unwrap_or(SessionStatus::Pending);
    Ok(Json(TaskStatusView {
        task_index,
        status,
        response_count: state.registry.response_count(task_index),
        quorum_numbers: record.quorum_numbers,
        task_created_block: record.task_created_block,
    }))
}
