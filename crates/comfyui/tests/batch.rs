//! End-to-end batch flows against an in-process mock worker.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use serde_json::json;
use tempfile::TempDir;

use batchfan_comfyui::coordinator::{
    BatchCoordinator, BatchInput, BatchPrompts, CoordinatorConfig, CoordinatorError,
};
use batchfan_comfyui::pool::WorkerPool;
use batchfan_core::batch::ItemState;
use batchfan_core::workflow::WorkflowTemplate;

use common::{MockState, MockWorker, TINY_PNG};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_template() -> WorkflowTemplate {
    WorkflowTemplate::from_value(json!({
        "1": {
            "class_type": "LoadImage",
            "inputs": { "image": "placeholder.png" },
            "_meta": { "title": "INPUT_IMAGE" }
        },
        "10": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "a portrait" },
            "_meta": { "title": "POSITIVE" }
        },
        "15": {
            "class_type": "CLIPTextEncode",
            "inputs": { "text": "blurry" },
            "_meta": { "title": "NEGATIVE" }
        },
        "12": {
            "class_type": "KSamplerAdvanced",
            "inputs": { "noise_seed": 0 },
            "_meta": { "title": "KSampler (Advanced)" }
        },
        "46": {
            "class_type": "DetailerForEachDebug",
            "inputs": { "seed": 0 },
            "_meta": { "title": "Detailer (SEGS)" }
        },
        "20": {
            "class_type": "SaveImage",
            "inputs": {},
            "_meta": { "title": "OUTPUT" }
        },
        "52": {
            "class_type": "SaveImage",
            "inputs": {},
            "_meta": { "title": "OUTPUT_REFINED" }
        }
    }))
    .expect("test template")
}

struct Harness {
    coordinator: Arc<BatchCoordinator>,
    /// Holds input/output/preview dirs alive for the test.
    dir: TempDir,
}

fn harness(worker_urls: Vec<String>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let coordinator = BatchCoordinator::new(
        WorkerPool::from_urls(worker_urls),
        test_template(),
        CoordinatorConfig {
            output_dir: dir.path().join("outputs"),
            preview_dir: dir.path().join("previews"),
        },
    )
    .expect("coordinator");
    Harness { coordinator, dir }
}

impl Harness {
    /// Write a small PNG input file and return a batch input for it.
    fn input(&self, stem: &str) -> BatchInput {
        let path = self.dir.path().join(format!("{stem}.png"));
        std::fs::write(&path, TINY_PNG).expect("write input");
        BatchInput::new(path)
    }

    fn prompts(&self) -> BatchPrompts {
        self.coordinator.default_prompts()
    }
}

/// Poll until the coordinator has collected `count` results.
async fn wait_for_results(coordinator: &BatchCoordinator, count: usize) {
    let deadline = Duration::from_secs(30);
    let start = Instant::now();
    while coordinator.results().await.len() < count {
        assert!(
            start.elapsed() < deadline,
            "expected {count} results within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Completion flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_completes_and_saves_both_outputs() {
    let worker = MockWorker::spawn(MockState::healthy()).await;
    let harness = harness(vec![worker.url()]);

    let item_ids = harness
        .coordinator
        .start_batch(vec![harness.input("cat")], harness.prompts(), true)
        .await
        .expect("start batch");
    assert_eq!(item_ids.len(), 1);

    let results = harness
        .coordinator
        .await_active_batch()
        .await
        .expect("batch results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].item_id, item_ids[0]);

    // Unrefined plus refined output, named after the input stem.
    let names: Vec<String> = results[0]
        .output_paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["cat_.png", "cat_refined.png"]);
    for path in &results[0].output_paths {
        assert_eq!(std::fs::read(path).expect("output file"), TINY_PNG);
    }

    let status = harness.coordinator.status(&item_ids[0]).await.expect("status");
    assert_eq!(status.state, ItemState::Completed);
    assert_eq!(status.progress, 100);
    assert!(status.error.is_none());

    // No monitor session survives a terminal state.
    assert_eq!(harness.coordinator.active_monitor_count().await, 0);
    assert_eq!(worker.state.upload_count(), 1);
}

#[tokio::test]
async fn save_unrefined_false_keeps_only_refined() {
    let worker = MockWorker::spawn(MockState::healthy()).await;
    let harness = harness(vec![worker.url()]);

    harness
        .coordinator
        .start_batch(vec![harness.input("dog")], harness.prompts(), false)
        .await
        .expect("start batch");
    let results = harness
        .coordinator
        .await_active_batch()
        .await
        .expect("batch results");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].output_paths.len(), 1);
    assert!(results[0].output_paths[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .ends_with("_refined.png"));
}

#[tokio::test]
async fn second_run_gets_collision_suffixed_names() {
    let worker = MockWorker::spawn(MockState::healthy()).await;
    let harness = harness(vec![worker.url()]);

    harness
        .coordinator
        .start_batch(vec![harness.input("cat")], harness.prompts(), false)
        .await
        .expect("first batch");
    harness.coordinator.await_active_batch().await.expect("first results");

    harness
        .coordinator
        .start_batch(vec![harness.input("cat")], harness.prompts(), false)
        .await
        .expect("second batch");
    let results = harness
        .coordinator
        .await_active_batch()
        .await
        .expect("second results");

    let name = results[0].output_paths[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert_eq!(name, "cat_refined_1.png");
}

// ---------------------------------------------------------------------------
// Failure flows
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unhealthy_worker_fails_item_without_upload() {
    let worker = MockWorker::spawn(MockState::unhealthy()).await;
    let harness = harness(vec![worker.url()]);

    let item_ids = harness
        .coordinator
        .start_batch(vec![harness.input("cat")], harness.prompts(), true)
        .await
        .expect("start batch");
    let results = harness
        .coordinator
        .await_active_batch()
        .await
        .expect("batch results");

    assert!(results.is_empty());
    let status = harness.coordinator.status(&item_ids[0]).await.expect("status");
    assert_eq!(status.state, ItemState::Failed);
    assert!(status.error.as_deref().unwrap().contains("not responding"));

    // Health check failed, so nothing was ever uploaded.
    assert_eq!(worker.state.upload_count(), 0);
    assert_eq!(harness.coordinator.active_monitor_count().await, 0);
}

#[tokio::test]
async fn empty_pool_fails_every_item_uniformly() {
    let harness = harness(Vec::new());

    let item_ids = harness
        .coordinator
        .start_batch(
            vec![harness.input("cat"), harness.input("dog")],
            harness.prompts(),
            true,
        )
        .await
        .expect("start batch");
    let results = harness
        .coordinator
        .await_active_batch()
        .await
        .expect("batch results");
    assert!(results.is_empty());

    for item_id in &item_ids {
        let status = harness.coordinator.status(item_id).await.expect("status");
        assert_eq!(status.state, ItemState::Failed);
        assert!(status
            .error
            .as_deref()
            .unwrap()
            .contains("initialization failed"));
    }
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let worker = MockWorker::spawn(MockState::healthy()).await;
    let harness = harness(vec![worker.url()]);

    let err = harness
        .coordinator
        .start_batch(Vec::new(), harness.prompts(), true)
        .await
        .expect_err("empty batch");
    assert_matches!(err, CoordinatorError::EmptyBatch);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_after_two_completions_cancels_the_rest() {
    // Only the first two submitted prompts ever complete; the other
    // three poll forever until the stop request cuts them off.
    let worker = MockWorker::spawn(MockState::completing_first(2)).await;
    let harness = harness(vec![worker.url()]);

    let inputs = vec![
        harness.input("a"),
        harness.input("b"),
        harness.input("c"),
        harness.input("d"),
        harness.input("e"),
    ];
    let item_ids = harness
        .coordinator
        .start_batch(inputs, harness.prompts(), false)
        .await
        .expect("start batch");
    assert_eq!(item_ids.len(), 5);

    wait_for_results(&harness.coordinator, 2).await;

    harness.coordinator.request_stop().await;
    let results = harness
        .coordinator
        .await_active_batch()
        .await
        .expect("batch results");
    assert_eq!(results.len(), 2);

    let statuses = harness.coordinator.all_statuses().await;
    let completed = statuses
        .values()
        .filter(|s| s.state == ItemState::Completed)
        .count();
    let cancelled = statuses
        .values()
        .filter(|s| s.state == ItemState::Cancelled)
        .count();
    assert_eq!(completed, 2);
    assert_eq!(cancelled, 3);

    // Every monitor connection is gone after the stop.
    assert_eq!(harness.coordinator.active_monitor_count().await, 0);
}

// ---------------------------------------------------------------------------
// Reprocessing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reprocess_marked_runs_a_new_batch() {
    let worker = MockWorker::spawn(MockState::healthy()).await;
    let harness = harness(vec![worker.url()]);

    let item_ids = harness
        .coordinator
        .start_batch(vec![harness.input("cat")], harness.prompts(), false)
        .await
        .expect("start batch");
    harness.coordinator.await_active_batch().await.expect("results");

    harness
        .coordinator
        .mark_for_reprocess(&item_ids[0])
        .await
        .expect("mark");
    let queue = harness.coordinator.reprocess_queue().await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].source_item_id, item_ids[0]);
    assert!(queue[0].display_name.starts_with("reprocess_"));

    let rerun_ids = harness
        .coordinator
        .reprocess_marked(harness.prompts(), false)
        .await
        .expect("reprocess");
    assert_eq!(rerun_ids.len(), 1);
    assert_ne!(rerun_ids[0], item_ids[0]);
    assert!(harness.coordinator.reprocess_queue().await.is_empty());

    harness.coordinator.await_active_batch().await.expect("rerun results");
    assert_eq!(harness.coordinator.results().await.len(), 2);
}

#[tokio::test]
async fn reprocess_bookkeeping_errors() {
    let worker = MockWorker::spawn(MockState::healthy()).await;
    let harness = harness(vec![worker.url()]);

    let unknown = uuid::Uuid::new_v4();
    let err = harness
        .coordinator
        .mark_for_reprocess(&unknown)
        .await
        .expect_err("unknown result");
    assert_matches!(err, CoordinatorError::ResultNotFound(_));

    let err = harness
        .coordinator
        .unmark_for_reprocess(&unknown)
        .await
        .expect_err("not marked");
    assert_matches!(err, CoordinatorError::NotMarked(_));

    let err = harness
        .coordinator
        .reprocess_marked(harness.prompts(), false)
        .await
        .expect_err("empty queue");
    assert_matches!(err, CoordinatorError::EmptyBatch);
}
