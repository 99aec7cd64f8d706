//! Operator queue handlers.
//!
//! Every handler here requires the [`Operator`] extractor.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vest_models::{DeadLetterEntry, QueueStats};

use crate::auth::Operator;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;

/// Stats of every queue.
pub async fn get_all_stats(
    State(state): State<AppState>,
    _operator: Operator,
) -> ApiResult<Json<Vec<QueueStats>>> {
    let stats = state.registry.get_all_queue_stats().await?;
    Ok(Json(stats))
}

/// Stats of a single queue.
pub async fn get_stats(
    State(state): State<AppState>,
    _operator: Operator,
    Path(queue_name): Path<String>,
) -> ApiResult<Json<QueueStats>> {
    let stats = state.registry.get_queue_stats(&queue_name).await?;
    Ok(Json(stats))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub queue_name: String,
    pub removed: u64,
}

/// Remove waiting, delayed, completed and failed jobs. Active jobs keep running.
pub async fn clear_queue(
    State(state): State<AppState>,
    _operator: Operator,
    Path(queue_name): Path<String>,
) -> ApiResult<Json<ClearResponse>> {
    let removed = state.registry.clear_queue(&queue_name).await?;
    metrics::record_operator_action("clear", &queue_name);
    warn!(queue = %queue_name, removed, "Queue cleared by operator");

    Ok(Json(ClearResponse { queue_name, removed }))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// Most recent dead-letter entries, newest first.
pub async fn get_dead_letters(
    State(state): State<AppState>,
    _operator: Operator,
    Path(queue_name): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<DeadLetterEntry>>> {
    let limit = match query.limit {
        Some(0) => return Err(ApiError::bad_request("limit must be at least 1")),
        Some(n) => n.min(MAX_DEAD_LETTER_LIMIT),
        None => DEFAULT_DEAD_LETTER_LIMIT,
    };
    let queue = state.registry.get_queue_by_str(&queue_name)?;
    Ok(Json(queue.dead_letters(limit).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseResponse {
    pub queue_name: String,
    pub paused: bool,
}

/// Stop dispatching new jobs from a queue. Producers can still enqueue.
pub async fn pause_queue(
    State(state): State<AppState>,
    _operator: Operator,
    Path(queue_name): Path<String>,
) -> ApiResult<Json<PauseResponse>> {
    state.registry.get_queue_by_str(&queue_name)?.pause().await?;
    metrics::record_operator_action("pause", &queue_name);
    info!(queue = %queue_name, "Queue paused by operator");

    Ok(Json(PauseResponse {
        queue_name,
        paused: true,
    }))
}

pub async fn resume_queue(
    State(state): State<AppState>,
    _operator: Operator,
    Path(queue_name): Path<String>,
) -> ApiResult<Json<PauseResponse>> {
    state.registry.get_queue_by_str(&queue_name)?.resume().await?;
    metrics::record_operator_action("resume", &queue_name);
    info!(queue = %queue_name, "Queue resumed by operator");

    Ok(Json(PauseResponse {
        queue_name,
        paused: false,
    }))
}
