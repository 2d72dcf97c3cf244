//! Batch coordinator.
//!
//! Owns everything a batch run needs: the worker pool, the shared
//! workflow template, the status map, the results cache, the monitor
//! registry, and the stop token. An `Arc<BatchCoordinator>` is cloned
//! into API handlers; there are no ambient globals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use batchfan_core::batch::{BatchItem, ItemId, ItemState, JobResult, ProcessingStatus};
use batchfan_core::workflow::WorkflowTemplate;

use crate::job::{self, ItemContext, ItemOutcome};
use crate::monitor::MonitorRegistry;
use crate::pool::WorkerPool;

/// Shared item-status map. Written by item tasks and monitor tasks, read
/// by observers.
pub type StatusMap = Arc<RwLock<HashMap<ItemId, ProcessingStatus>>>;

/// Uniform error recorded on every item when the coordinator cannot even
/// start a batch.
const INIT_FAILED_MESSAGE: &str = "Orchestrator initialization failed";

/// Apply a mutation to an item's status record.
///
/// Terminal states never transition again, so updates against an already
/// terminal record are dropped. This also papers over the benign race
/// where a monitor task writes progress just after the item finished.
pub(crate) async fn update_status<F>(statuses: &StatusMap, item_id: &ItemId, mutate: F)
where
    F: FnOnce(&mut ProcessingStatus),
{
    let mut statuses = statuses.write().await;
    if let Some(status) = statuses.get_mut(item_id) {
        if status.state.is_terminal() {
            return;
        }
        mutate(status);
    }
}

/// One input image for a batch.
#[derive(Debug, Clone)]
pub struct BatchInput {
    pub input_path: PathBuf,
    /// Defaults to the input file name.
    pub display_name: Option<String>,
}

impl BatchInput {
    pub fn new(input_path: PathBuf) -> Self {
        Self {
            input_path,
            display_name: None,
        }
    }

    fn resolved_display_name(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| {
            self.input_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string())
        })
    }
}

/// Prompt pair applied to every item in a batch.
#[derive(Debug, Clone)]
pub struct BatchPrompts {
    pub positive: String,
    pub negative: String,
}

/// Filesystem locations the coordinator writes to.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory for finished output images.
    pub output_dir: PathBuf,
    /// Scoped temp directory for live preview frames.
    pub preview_dir: PathBuf,
}

/// An input queued for another pass through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ReprocessEntry {
    /// Item id of the completed result this entry came from.
    pub source_item_id: ItemId,
    pub input_path: PathBuf,
    pub display_name: String,
}

/// Errors from coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("{INIT_FAILED_MESSAGE}: {0}")]
    Init(String),

    #[error("a batch is already running")]
    BatchActive,

    #[error("batch contains no items")]
    EmptyBatch,

    #[error("no result for item {0}")]
    ResultNotFound(ItemId),

    #[error("item {0} is not marked for reprocessing")]
    NotMarked(ItemId),

    #[error("input file no longer exists: {0}")]
    InputMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fans batch items out across the worker pool and tracks their lifecycle.
pub struct BatchCoordinator {
    pool: WorkerPool,
    template: Arc<WorkflowTemplate>,
    config: CoordinatorConfig,
    statuses: StatusMap,
    results: RwLock<Vec<JobResult>>,
    monitors: Arc<MonitorRegistry>,
    reprocess: RwLock<Vec<ReprocessEntry>>,
    /// Stop token for the active batch; replaced at every batch start.
    stop: RwLock<CancellationToken>,
    /// Supervised handle of the active batch task.
    batch_task: Mutex<Option<JoinHandle<Vec<JobResult>>>>,
    /// Lazy one-shot pool health sweep, run before the first batch.
    init: OnceCell<usize>,
}

impl BatchCoordinator {
    /// Build a coordinator, creating the output and preview directories.
    pub fn new(
        pool: WorkerPool,
        template: WorkflowTemplate,
        config: CoordinatorConfig,
    ) -> Result<Arc<Self>, CoordinatorError> {
        std::fs::create_dir_all(&config.output_dir)?;
        std::fs::create_dir_all(&config.preview_dir)?;

        Ok(Arc::new(Self {
            pool,
            template: Arc::new(template),
            config,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            results: RwLock::new(Vec::new()),
            monitors: Arc::new(MonitorRegistry::new()),
            reprocess: RwLock::new(Vec::new()),
            stop: RwLock::new(CancellationToken::new()),
            batch_task: Mutex::new(None),
            init: OnceCell::new(),
        }))
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The template's built-in prompt pair, used when a batch request
    /// does not override prompts.
    pub fn default_prompts(&self) -> BatchPrompts {
        let (positive, negative) = self.template.default_prompts();
        BatchPrompts { positive, negative }
    }

    // ---- batch lifecycle ----

    /// Start a batch in a supervised background task.
    ///
    /// Items are assigned workers round-robin by submission index and
    /// appear in the status map as `queued` before this returns. Only one
    /// batch may run at a time.
    pub async fn start_batch(
        self: &Arc<Self>,
        inputs: Vec<BatchInput>,
        prompts: BatchPrompts,
        save_unrefined: bool,
    ) -> Result<Vec<ItemId>, CoordinatorError> {
        if inputs.is_empty() {
            return Err(CoordinatorError::EmptyBatch);
        }

        let mut batch_task = self.batch_task.lock().await;
        if let Some(handle) = batch_task.as_ref() {
            if !handle.is_finished() {
                return Err(CoordinatorError::BatchActive);
            }
        }

        // Fresh stop token per batch; an earlier stop must not bleed in.
        *self.stop.write().await = CancellationToken::new();

        let items: Vec<BatchItem> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| {
                // An empty pool is caught in run_batch; index 0 is a
                // placeholder that never reaches a worker.
                let worker_index = if self.pool.is_empty() {
                    0
                } else {
                    self.pool.assign(index).index
                };
                BatchItem::new(
                    input.input_path.clone(),
                    input.resolved_display_name(),
                    worker_index,
                )
            })
            .collect();

        {
            let mut statuses = self.statuses.write().await;
            for item in &items {
                statuses.insert(item.item_id, ProcessingStatus::queued(item));
            }
        }

        let item_ids: Vec<ItemId> = items.iter().map(|item| item.item_id).collect();
        tracing::info!(
            items = items.len(),
            workers = self.pool.size(),
            save_unrefined,
            "Batch started",
        );

        let coordinator = Arc::clone(self);
        *batch_task = Some(tokio::spawn(async move {
            coordinator.run_batch(items, prompts, save_unrefined).await
        }));

        Ok(item_ids)
    }

    /// Run a batch to completion, one concurrent task per item.
    ///
    /// Returns the results of items that completed; failures are recorded
    /// on the status map only. Worker count is the natural throughput
    /// ceiling since each worker processes one job at a time.
    async fn run_batch(
        self: Arc<Self>,
        items: Vec<BatchItem>,
        prompts: BatchPrompts,
        save_unrefined: bool,
    ) -> Vec<JobResult> {
        if self.pool.is_empty() {
            self.fail_all(&items, format!("{INIT_FAILED_MESSAGE}: no workers configured"))
                .await;
            return Vec::new();
        }

        let healthy = self
            .init
            .get_or_init(|| async { self.pool.refresh_health().await })
            .await;
        if *healthy == 0 {
            tracing::warn!("No worker passed the initial health sweep; items will likely fail");
        }

        let cancel = self.stop.read().await.clone();
        let mut tasks = JoinSet::new();
        for item in &items {
            let ctx = ItemContext {
                item: item.clone(),
                endpoint: self.pool.assign(item.worker_index).clone(),
                template: Arc::clone(&self.template),
                positive_prompt: prompts.positive.clone(),
                negative_prompt: prompts.negative.clone(),
                save_unrefined,
                output_dir: self.config.output_dir.clone(),
                preview_dir: self.config.preview_dir.clone(),
                statuses: Arc::clone(&self.statuses),
                monitors: Arc::clone(&self.monitors),
                http_client: self.pool.http_client(),
                cancel: cancel.clone(),
            };
            let item_id = item.item_id;
            tasks.spawn(async move { (item_id, job::run_item(ctx).await) });
        }

        let mut completed = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish_stopped(&mut tasks, &mut completed).await;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(task_result) => {
                        self.record_task_result(task_result, &mut completed).await;
                    }
                },
            }
        }

        // Item tasks close their own monitors; this catches sessions
        // orphaned by panics or aborts.
        self.monitors.close_all().await;

        tracing::info!(
            completed = completed.len(),
            total = items.len(),
            "Batch finished",
        );
        completed
    }

    async fn record_task_result(
        &self,
        task_result: Result<(ItemId, Result<ItemOutcome, job::ItemError>), tokio::task::JoinError>,
        completed: &mut Vec<JobResult>,
    ) {
        match task_result {
            Ok((_, Ok(ItemOutcome::Completed(result)))) => {
                self.results.write().await.push(result.clone());
                completed.push(result);
            }
            // Failure and cancellation are already recorded on the status
            // map by the item task itself.
            Ok((_, Ok(ItemOutcome::Cancelled))) | Ok((_, Err(_))) => {}
            Err(join_error) => {
                if join_error.is_cancelled() {
                    return;
                }
                tracing::error!(error = %join_error, "Item task panicked");
            }
        }
    }

    /// Stop path: abort in-flight tasks, collect any results that raced
    /// ahead of the token, mark the rest cancelled, close all monitors.
    async fn finish_stopped(
        &self,
        tasks: &mut JoinSet<(ItemId, Result<ItemOutcome, job::ItemError>)>,
        completed: &mut Vec<JobResult>,
    ) {
        tasks.abort_all();
        while let Some(task_result) = tasks.join_next().await {
            self.record_task_result(task_result, completed).await;
        }

        let mut cancelled = 0;
        {
            let mut statuses = self.statuses.write().await;
            for status in statuses.values_mut() {
                if !status.state.is_terminal() {
                    status.state = ItemState::Cancelled;
                    cancelled += 1;
                }
            }
        }

        self.monitors.close_all().await;
        tracing::info!(
            completed = completed.len(),
            cancelled,
            "Batch stopped on request",
        );
    }

    async fn fail_all(&self, items: &[BatchItem], message: String) {
        tracing::error!("{message}");
        let mut statuses = self.statuses.write().await;
        for item in items {
            if let Some(status) = statuses.get_mut(&item.item_id) {
                status.state = ItemState::Failed;
                status.error = Some(message.clone());
            }
        }
    }

    /// Cancel the active batch. Safe to call when idle.
    pub async fn request_stop(&self) {
        tracing::info!("Stop requested");
        self.stop.read().await.cancel();
    }

    /// Await the active batch task, if any, returning its results.
    pub async fn await_active_batch(&self) -> Option<Vec<JobResult>> {
        let handle = self.batch_task.lock().await.take()?;
        match handle.await {
            Ok(results) => Some(results),
            Err(e) => {
                tracing::error!(error = %e, "Batch task failed");
                None
            }
        }
    }

    /// Stop the active batch and tear down all sessions.
    pub async fn shutdown(&self) {
        self.request_stop().await;
        self.await_active_batch().await;
        self.monitors.close_all().await;
    }

    // ---- observers ----

    pub async fn status(&self, item_id: &ItemId) -> Option<ProcessingStatus> {
        self.statuses.read().await.get(item_id).cloned()
    }

    pub async fn all_statuses(&self) -> HashMap<ItemId, ProcessingStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn results(&self) -> Vec<JobResult> {
        self.results.read().await.clone()
    }

    /// Number of open monitor sessions (zero once no item is in flight).
    pub async fn active_monitor_count(&self) -> usize {
        self.monitors.session_count().await
    }

    /// Drop all results and statuses, deleting saved output files and any
    /// leftover preview temp files.
    pub async fn clear_results(&self) {
        self.monitors.close_all().await;

        let results = std::mem::take(&mut *self.results.write().await);
        for result in &results {
            for path in &result.output_paths {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::debug!(path = %path.display(), error = %e, "Output file not removed");
                }
            }
        }

        self.statuses.write().await.clear();
        self.reprocess.write().await.clear();
        tracing::info!(cleared = results.len(), "Results cleared");
    }

    // ---- reprocessing ----

    /// Queue a completed item's input for another pass. The rerun gets a
    /// fresh item id, and seeds are always the random sentinel, so the
    /// output differs.
    pub async fn mark_for_reprocess(&self, item_id: &ItemId) -> Result<(), CoordinatorError> {
        let result = self
            .results
            .read()
            .await
            .iter()
            .find(|r| r.item_id == *item_id)
            .cloned()
            .ok_or(CoordinatorError::ResultNotFound(*item_id))?;

        if !result.input_path.exists() {
            return Err(CoordinatorError::InputMissing(result.input_path));
        }

        let mut reprocess = self.reprocess.write().await;
        if reprocess.iter().any(|e| e.source_item_id == *item_id) {
            return Ok(());
        }
        let display_name = result
            .input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| item_id.to_string());
        reprocess.push(ReprocessEntry {
            source_item_id: *item_id,
            input_path: result.input_path,
            display_name: format!("reprocess_{display_name}"),
        });
        tracing::info!(item_id = %item_id, "Item marked for reprocessing");
        Ok(())
    }

    pub async fn unmark_for_reprocess(&self, item_id: &ItemId) -> Result<(), CoordinatorError> {
        let mut reprocess = self.reprocess.write().await;
        let before = reprocess.len();
        reprocess.retain(|e| e.source_item_id != *item_id);
        if reprocess.len() == before {
            return Err(CoordinatorError::NotMarked(*item_id));
        }
        Ok(())
    }

    pub async fn reprocess_queue(&self) -> Vec<ReprocessEntry> {
        self.reprocess.read().await.clone()
    }

    /// Run everything marked for reprocessing as a new batch, draining
    /// the queue.
    pub async fn reprocess_marked(
        self: &Arc<Self>,
        prompts: BatchPrompts,
        save_unrefined: bool,
    ) -> Result<Vec<ItemId>, CoordinatorError> {
        let inputs: Vec<BatchInput> = self
            .reprocess
            .read()
            .await
            .iter()
            .map(|entry| BatchInput {
                input_path: entry.input_path.clone(),
                display_name: Some(entry.display_name.clone()),
            })
            .collect();
        if inputs.is_empty() {
            return Err(CoordinatorError::EmptyBatch);
        }

        let item_ids = self.start_batch(inputs, prompts, save_unrefined).await?;
        // Drain only once the batch is actually accepted.
        self.reprocess.write().await.clear();
        Ok(item_ids)
    }
}
