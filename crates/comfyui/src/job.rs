//! Per-item submission and polling state machine.
//!
//! Drives one batch item through
//! `queued → uploading → submitted → processing` and into a terminal
//! state. History polling is the single source of truth for terminal
//! decisions; the WebSocket monitor only adds liveness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use batchfan_core::batch::{BatchItem, ItemState, JobResult};
use batchfan_core::naming;
use batchfan_core::progress::{self, PROGRESS_SUBMITTED};
use batchfan_core::workflow::{InstantiateParams, NodeRole, WorkflowTemplate};

use crate::api::{ComfyUIApi, HistoryEntry, OutputImage};
use crate::coordinator::{update_status, StatusMap};
use crate::monitor::{spawn_monitor, MonitorParams, MonitorRegistry};
use crate::pool::{WorkerEndpoint, HEALTH_CHECK_TIMEOUT};

/// Interval between `/history` polls. There is deliberately no overall
/// timeout: generation time varies wildly with workflow and hardware, and
/// stop/cancel is the escape hatch.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Grace period between submission and the registration probe, giving the
/// worker time to enqueue the prompt.
const REGISTRATION_DELAY: Duration = Duration::from_millis(500);

/// Terminal failure causes for a single item. Per-item errors never abort
/// the batch.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    /// Pre-flight health check failed; nothing was uploaded.
    #[error("worker {index} is not responding")]
    WorkerUnavailable { index: usize },

    /// The input image could not be uploaded.
    #[error("upload failed: {0}")]
    Upload(String),

    /// The worker rejected the workflow submission.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// A `/history` poll failed. Transient: logged and retried, never a
    /// terminal state on its own.
    #[error("history poll failed: {0}")]
    Poll(String),

    /// The worker reported the job as errored.
    #[error("worker reported an error: {0}")]
    WorkerReported(String),

    /// An output image could not be downloaded or written.
    #[error("output download failed: {0}")]
    Download(String),
}

/// How an item's task ended when it did not fail.
#[derive(Debug)]
pub enum ItemOutcome {
    Completed(JobResult),
    /// The batch was stopped while this item was in flight.
    Cancelled,
}

/// Everything one item's task needs.
pub struct ItemContext {
    pub item: BatchItem,
    pub endpoint: WorkerEndpoint,
    pub template: Arc<WorkflowTemplate>,
    pub positive_prompt: String,
    pub negative_prompt: String,
    pub save_unrefined: bool,
    pub output_dir: PathBuf,
    pub preview_dir: PathBuf,
    pub statuses: StatusMap,
    pub monitors: Arc<MonitorRegistry>,
    pub http_client: reqwest::Client,
    /// Batch-wide stop token, checked at every suspension point.
    pub cancel: CancellationToken,
}

/// Run one item to a terminal state.
///
/// On `Err` the status record is already marked `failed` with the cause;
/// on `Ok(Cancelled)` it is marked `cancelled`. The monitor session is
/// closed on every terminal path.
pub async fn run_item(ctx: ItemContext) -> Result<ItemOutcome, ItemError> {
    let item_id = ctx.item.item_id;
    let result = execute(&ctx).await;

    match &result {
        Ok(ItemOutcome::Completed(_)) => {}
        Ok(ItemOutcome::Cancelled) => {
            update_status(&ctx.statuses, &item_id, |status| {
                status.state = ItemState::Cancelled;
            })
            .await;
            tracing::info!(item_id = %item_id, "Item cancelled");
        }
        Err(e) => {
            let message = e.to_string();
            update_status(&ctx.statuses, &item_id, |status| {
                status.state = ItemState::Failed;
                status.error = Some(message);
            })
            .await;
            tracing::warn!(item_id = %item_id, error = %e, "Item failed");
        }
    }

    ctx.monitors.close(&item_id).await;
    result
}

async fn execute(ctx: &ItemContext) -> Result<ItemOutcome, ItemError> {
    let item_id = ctx.item.item_id;
    let api = ComfyUIApi::with_client(ctx.http_client.clone(), ctx.endpoint.api_url.clone());

    // Pre-flight: an unresponsive worker fails the item before any upload.
    if !api.check_health(HEALTH_CHECK_TIMEOUT).await {
        return Err(ItemError::WorkerUnavailable {
            index: ctx.endpoint.index,
        });
    }

    update_status(&ctx.statuses, &item_id, |status| {
        status.state = ItemState::Uploading;
    })
    .await;

    let uploaded = api
        .upload_image(&ctx.item.input_path, &ctx.item.display_name)
        .await
        .map_err(|e| ItemError::Upload(e.to_string()))?;
    tracing::debug!(
        item_id = %item_id,
        uploaded_name = %uploaded.name,
        worker_index = ctx.endpoint.index,
        "Input image uploaded",
    );

    let workflow = ctx.template.instantiate(&InstantiateParams {
        input_image: &uploaded.name,
        positive_prompt: &ctx.positive_prompt,
        negative_prompt: &ctx.negative_prompt,
        checkpoint: None,
        sampler: None,
        refiner: None,
    });

    // The monitor is started before submission so no early events are
    // missed; it shares the client id the workflow is submitted with.
    let client_id = Uuid::new_v4().to_string();
    spawn_monitor(
        ctx.monitors.clone(),
        MonitorParams {
            item_id,
            ws_url: ctx.endpoint.ws_url.clone(),
            api_url: ctx.endpoint.api_url.clone(),
            client_id: client_id.clone(),
            statuses: ctx.statuses.clone(),
            preview_dir: ctx.preview_dir.clone(),
        },
    )
    .await;

    let submitted = api
        .submit_workflow(&workflow, &client_id)
        .await
        .map_err(|e| ItemError::Submission(e.to_string()))?;
    let prompt_id = submitted.prompt_id;

    update_status(&ctx.statuses, &item_id, |status| {
        status.state = ItemState::Submitted;
        status.progress = PROGRESS_SUBMITTED;
    })
    .await;
    tracing::info!(
        item_id = %item_id,
        prompt_id = %prompt_id,
        worker_index = ctx.endpoint.index,
        "Workflow submitted",
    );

    if sleep_or_cancel(ctx, REGISTRATION_DELAY).await {
        return Ok(ItemOutcome::Cancelled);
    }
    check_registration(&api, &prompt_id, &item_id.to_string()).await;

    update_status(&ctx.statuses, &item_id, |status| {
        status.state = ItemState::Processing;
    })
    .await;

    poll_until_done(ctx, &api, &prompt_id).await
}

/// One-shot probe after the registration delay. A prompt in neither queue
/// nor history is an anomaly worth logging, but polling proceeds anyway;
/// slow workers register late.
async fn check_registration(api: &ComfyUIApi, prompt_id: &str, item_id: &str) {
    let in_queue = match api.get_queue().await {
        Ok(snapshot) => snapshot.contains(prompt_id),
        Err(e) => {
            tracing::warn!(item_id, error = %e, "Queue probe failed");
            return;
        }
    };
    if in_queue {
        return;
    }

    let in_history = match api.get_history(prompt_id).await {
        Ok(history) => HistoryEntry::for_prompt(&history, prompt_id).is_some(),
        Err(e) => {
            tracing::warn!(item_id, error = %e, "History probe failed");
            return;
        }
    };
    if !in_history {
        tracing::warn!(
            item_id,
            prompt_id,
            "Prompt not found in queue or history after submission",
        );
    }
}

async fn poll_until_done(
    ctx: &ItemContext,
    api: &ComfyUIApi,
    prompt_id: &str,
) -> Result<ItemOutcome, ItemError> {
    let item_id = ctx.item.item_id;

    loop {
        match api.get_history(prompt_id).await {
            Err(e) => {
                // Transient by policy; the worker may be busy or mid-restart.
                let err = ItemError::Poll(e.to_string());
                tracing::warn!(item_id = %item_id, error = %err, "Retrying after poll failure");
            }
            Ok(history) => {
                if let Some(entry) = HistoryEntry::for_prompt(&history, prompt_id) {
                    if let Some(message) = entry.error_message() {
                        return Err(ItemError::WorkerReported(message));
                    }
                    if entry.completed() {
                        let result = download_outputs(ctx, api, entry).await?;
                        update_status(&ctx.statuses, &item_id, |status| {
                            status.state = ItemState::Completed;
                            status.progress = 100;
                        })
                        .await;
                        tracing::info!(
                            item_id = %item_id,
                            outputs = result.output_paths.len(),
                            "Item completed",
                        );
                        return Ok(ItemOutcome::Completed(result));
                    }
                    if let Some((current, total)) = entry.execution_counters() {
                        if let Some(pct) = progress::poll_progress(current, total) {
                            update_status(&ctx.statuses, &item_id, |status| {
                                status.progress = pct;
                            })
                            .await;
                        }
                    }
                }
            }
        }

        if sleep_or_cancel(ctx, POLL_INTERVAL).await {
            return Ok(ItemOutcome::Cancelled);
        }
    }
}

/// Download the finished images for an item.
///
/// The unrefined save node's images are kept only when `save_unrefined`;
/// the refined save node's images are always kept.
async fn download_outputs(
    ctx: &ItemContext,
    api: &ComfyUIApi,
    entry: HistoryEntry<'_>,
) -> Result<JobResult, ItemError> {
    let item = &ctx.item;
    let base = item
        .input_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| item.item_id.to_string());

    let mut output_paths = Vec::new();

    if ctx.save_unrefined {
        if let Some(node_id) = ctx.template.roles().node_id(NodeRole::Output) {
            for image in entry.node_images(node_id) {
                output_paths.push(save_output(ctx, api, &image, &base, false).await?);
            }
        }
    }
    if let Some(node_id) = ctx.template.roles().node_id(NodeRole::OutputRefined) {
        for image in entry.node_images(node_id) {
            output_paths.push(save_output(ctx, api, &image, &base, true).await?);
        }
    }

    Ok(JobResult {
        item_id: item.item_id,
        input_path: item.input_path.clone(),
        output_paths,
        state: ItemState::Completed,
    })
}

async fn save_output(
    ctx: &ItemContext,
    api: &ComfyUIApi,
    image: &OutputImage,
    base: &str,
    refined: bool,
) -> Result<PathBuf, ItemError> {
    let bytes = api
        .download_view(image)
        .await
        .map_err(|e| ItemError::Download(e.to_string()))?;

    let candidate = ctx.output_dir.join(naming::output_file_name(base, refined));
    let path = naming::unique_path(&candidate);
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ItemError::Download(format!("cannot write {}: {e}", path.display())))?;

    tracing::debug!(
        item_id = %ctx.item.item_id,
        path = %path.display(),
        refined,
        "Output saved",
    );
    Ok(path)
}

/// Sleep for `duration`, returning `true` if the stop token fired first.
async fn sleep_or_cancel(ctx: &ItemContext, duration: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
