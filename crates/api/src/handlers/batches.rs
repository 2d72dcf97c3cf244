//! Handlers for batch submission, observation, stopping, and reprocessing.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use batchfan_comfyui::coordinator::{BatchInput, BatchPrompts};
use batchfan_core::batch::{ItemId, JobResult, ProcessingStatus};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

/// One input image in a batch request.
#[derive(Debug, Deserialize)]
pub struct BatchItemRequest {
    /// Local path of the input image.
    pub path: String,
    /// Optional display name; defaults to the file name.
    pub display_name: Option<String>,
}

/// Body for `POST /batches`.
#[derive(Debug, Deserialize)]
pub struct SubmitBatchRequest {
    pub items: Vec<BatchItemRequest>,
    /// Defaults to the template's built-in positive prompt.
    pub positive_prompt: Option<String>,
    /// Defaults to the template's built-in negative prompt.
    pub negative_prompt: Option<String>,
    /// Keep the unrefined output alongside the refined one.
    #[serde(default = "default_true")]
    pub save_unrefined: bool,
}

fn default_true() -> bool {
    true
}

/// Body for `POST /reprocess/run`; prompts default like a fresh batch.
#[derive(Debug, Deserialize)]
pub struct ReprocessRunRequest {
    pub positive_prompt: Option<String>,
    pub negative_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub save_unrefined: bool,
}

impl Default for ReprocessRunRequest {
    fn default() -> Self {
        Self {
            positive_prompt: None,
            negative_prompt: None,
            save_unrefined: true,
        }
    }
}

fn resolve_prompts(
    state: &AppState,
    positive: Option<String>,
    negative: Option<String>,
) -> BatchPrompts {
    let defaults = state.coordinator.default_prompts();
    BatchPrompts {
        positive: positive.unwrap_or(defaults.positive),
        negative: negative.unwrap_or(defaults.negative),
    }
}

// ---------------------------------------------------------------------------
// POST /batches
// ---------------------------------------------------------------------------

/// Submit a new batch. Returns the generated item ids in submission order.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(input): Json<SubmitBatchRequest>,
) -> AppResult<impl IntoResponse> {
    if input.items.is_empty() {
        return Err(AppError::BadRequest("batch contains no items".to_string()));
    }

    let mut inputs = Vec::with_capacity(input.items.len());
    for item in &input.items {
        let path = PathBuf::from(&item.path);
        if !path.is_file() {
            return Err(AppError::BadRequest(format!(
                "input file not found: {}",
                item.path
            )));
        }
        inputs.push(BatchInput {
            input_path: path,
            display_name: item.display_name.clone(),
        });
    }

    let prompts = resolve_prompts(&state, input.positive_prompt, input.negative_prompt);
    let item_ids = state
        .coordinator
        .start_batch(inputs, prompts, input.save_unrefined)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: item_ids })))
}

// ---------------------------------------------------------------------------
// GET /items/{id}
// ---------------------------------------------------------------------------

/// Status snapshot of a single item.
pub async fn get_item_status(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
) -> AppResult<Json<DataResponse<ProcessingStatus>>> {
    let status = state
        .coordinator
        .status(&item_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no item with id {item_id}")))?;
    Ok(Json(DataResponse { data: status }))
}

// ---------------------------------------------------------------------------
// GET /status
// ---------------------------------------------------------------------------

/// Status snapshots of all known items.
pub async fn all_statuses(
    State(state): State<AppState>,
) -> Json<DataResponse<HashMap<ItemId, ProcessingStatus>>> {
    Json(DataResponse {
        data: state.coordinator.all_statuses().await,
    })
}

// ---------------------------------------------------------------------------
// GET /results + DELETE /results
// ---------------------------------------------------------------------------

/// All completed results so far.
pub async fn get_results(State(state): State<AppState>) -> Json<DataResponse<Vec<JobResult>>> {
    Json(DataResponse {
        data: state.coordinator.results().await,
    })
}

/// Drop all results and statuses, deleting saved output files.
pub async fn clear_results(State(state): State<AppState>) -> impl IntoResponse {
    state.coordinator.clear_results().await;
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// POST /stop
// ---------------------------------------------------------------------------

/// Cooperatively stop the active batch. In-flight items are cancelled;
/// already-completed results are kept.
pub async fn stop_batch(State(state): State<AppState>) -> impl IntoResponse {
    state.coordinator.request_stop().await;
    StatusCode::ACCEPTED
}

// ---------------------------------------------------------------------------
// Reprocessing
// ---------------------------------------------------------------------------

/// Mark a completed item for another pass (`POST /results/{id}/reprocess`).
pub async fn mark_for_reprocess(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
) -> AppResult<impl IntoResponse> {
    state.coordinator.mark_for_reprocess(&item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remove an item from the reprocess queue (`DELETE /reprocess/{id}`).
pub async fn unmark_for_reprocess(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
) -> AppResult<impl IntoResponse> {
    state.coordinator.unmark_for_reprocess(&item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// List the reprocess queue (`GET /reprocess`).
pub async fn reprocess_queue(State(state): State<AppState>) -> impl IntoResponse {
    Json(DataResponse {
        data: state.coordinator.reprocess_queue().await,
    })
}

/// Run every marked item as a new batch (`POST /reprocess/run`).
pub async fn run_reprocess(
    State(state): State<AppState>,
    body: Option<Json<ReprocessRunRequest>>,
) -> AppResult<impl IntoResponse> {
    let Json(input) = body.unwrap_or_default();
    let prompts = resolve_prompts(&state, input.positive_prompt, input.negative_prompt);
    let item_ids = state
        .coordinator
        .reprocess_marked(prompts, input.save_unrefined)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: item_ids })))
}
