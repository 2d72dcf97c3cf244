//! Batch item, status, and result types shared across the orchestrator.

use std::path::PathBuf;

use serde::Serialize;
use uuid::Uuid;

/// Unique identifier for one batch item.
pub type ItemId = Uuid;

/// One unit of work: a single input image tracked through the pipeline.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub item_id: ItemId,
    /// Local path of the input image to upload.
    pub input_path: PathBuf,
    /// Human-readable name used for uploads and status display.
    pub display_name: String,
    /// Index of the worker this item was assigned to (round-robin).
    pub worker_index: usize,
}

impl BatchItem {
    pub fn new(input_path: PathBuf, display_name: String, worker_index: usize) -> Self {
        Self {
            item_id: Uuid::new_v4(),
            input_path,
            display_name,
            worker_index,
        }
    }
}

/// Lifecycle states of a batch item.
///
/// Transitions only move forward:
/// `Queued -> Uploading -> Submitted -> Processing -> {Completed | Failed | Cancelled}`.
/// `Failed` and `Cancelled` can be entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Queued,
    Uploading,
    Submitted,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Mutable status record for one item, readable by external observers
/// while the item is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    pub state: ItemState,
    /// Coarse percentage in `0..=100`.
    pub progress: u8,
    pub worker_index: usize,
    pub display_name: String,
    /// Node currently executing on the worker, when known.
    pub current_node: Option<String>,
    /// Terminal error message, set only for `Failed`.
    pub error: Option<String>,
    /// Whether a live preview frame has been captured for this item.
    pub has_preview: bool,
    /// Pointer to the latest preview (local temp file or worker view URL).
    pub preview: Option<String>,
}

impl ProcessingStatus {
    /// Initial status for a freshly enqueued item.
    pub fn queued(item: &BatchItem) -> Self {
        Self {
            state: ItemState::Queued,
            progress: 0,
            worker_index: item.worker_index,
            display_name: item.display_name.clone(),
            current_node: None,
            error: None,
            has_preview: false,
            preview: None,
        }
    }
}

/// Immutable record of a successfully completed item.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub item_id: ItemId,
    pub input_path: PathBuf,
    /// Saved output files, refined output last.
    pub output_paths: Vec<PathBuf>,
    /// Always `Completed`; carried for serialization to observers.
    pub state: ItemState,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ItemState::Completed.is_terminal());
        assert!(ItemState::Failed.is_terminal());
        assert!(ItemState::Cancelled.is_terminal());
        assert!(!ItemState::Queued.is_terminal());
        assert!(!ItemState::Uploading.is_terminal());
        assert!(!ItemState::Submitted.is_terminal());
        assert!(!ItemState::Processing.is_terminal());
    }

    #[test]
    fn queued_status_starts_clean() {
        let item = BatchItem::new("/tmp/a.png".into(), "a.png".into(), 2);
        let status = ProcessingStatus::queued(&item);
        assert_eq!(status.state, ItemState::Queued);
        assert_eq!(status.progress, 0);
        assert_eq!(status.worker_index, 2);
        assert!(status.error.is_none());
        assert!(!status.has_preview);
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&ItemState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
    }
}
