//! Live progress monitoring over WebSocket.
//!
//! Each in-flight item gets one monitor task holding a WebSocket
//! connection to its assigned worker, scoped by the item's `client_id`.
//! The task translates text events into status updates and decodes binary
//! preview frames into temp files. Monitoring is best-effort: the polling
//! state machine alone decides terminal states, so a failed or dropped
//! connection only degrades liveness.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use batchfan_core::batch::ItemId;
use batchfan_core::progress;

use crate::client::ComfyUIClient;
use crate::coordinator::{update_status, StatusMap};
use crate::messages::{self, ComfyUIMessage, PREVIEW_FRAME_TYPE};

/// One live monitor session.
struct MonitorSession {
    cancel: CancellationToken,
    /// Latest decoded preview frame on disk, if any.
    preview_path: Option<PathBuf>,
}

/// Registry of active monitor sessions, keyed by item id.
///
/// `close` is idempotent: the monitor task, the job state machine, and
/// batch teardown may all race to close the same session.
#[derive(Default)]
pub struct MonitorRegistry {
    sessions: RwLock<HashMap<ItemId, MonitorSession>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently open sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Register a session for an item, replacing (and cancelling) any
    /// previous one.
    pub async fn register(&self, item_id: ItemId) -> CancellationToken {
        let cancel = CancellationToken::new();
        let session = MonitorSession {
            cancel: cancel.clone(),
            preview_path: None,
        };
        if let Some(old) = self.sessions.write().await.insert(item_id, session) {
            tracing::warn!(item_id = %item_id, "Replacing existing monitor session");
            old.cancel.cancel();
            remove_preview_file(old.preview_path);
        }
        cancel
    }

    /// Record the latest preview temp file for an item.
    ///
    /// Returns `false` when the session is already gone; the caller must
    /// delete the orphaned file itself.
    pub async fn set_preview_path(&self, item_id: &ItemId, path: PathBuf) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(item_id) {
            Some(session) => {
                session.preview_path = Some(path);
                true
            }
            None => false,
        }
    }

    /// Close an item's session: cancel the monitor task and delete its
    /// preview temp file. Closing an unknown or already-closed item is a
    /// no-op.
    pub async fn close(&self, item_id: &ItemId) {
        let session = self.sessions.write().await.remove(item_id);
        if let Some(session) = session {
            session.cancel.cancel();
            remove_preview_file(session.preview_path);
            tracing::debug!(item_id = %item_id, "Monitor session closed");
        }
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        let sessions = std::mem::take(&mut *self.sessions.write().await);
        for (item_id, session) in sessions {
            session.cancel.cancel();
            remove_preview_file(session.preview_path);
            tracing::debug!(item_id = %item_id, "Monitor session closed");
        }
    }
}

fn remove_preview_file(path: Option<PathBuf>) {
    if let Some(path) = path {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "Preview temp file not removed");
        }
    }
}

/// Everything a monitor task needs to run.
pub struct MonitorParams {
    pub item_id: ItemId,
    /// WebSocket base URL of the assigned worker.
    pub ws_url: String,
    /// HTTP base URL of the assigned worker, for building view URLs.
    pub api_url: String,
    /// Client ID the workflow was (or will be) submitted with.
    pub client_id: String,
    pub statuses: StatusMap,
    pub preview_dir: PathBuf,
}

/// Spawn a monitor task for one item and register its session.
///
/// The task ends when the session is closed, the socket drops, or the
/// worker closes the stream. It never affects the item's terminal state.
pub async fn spawn_monitor(registry: Arc<MonitorRegistry>, params: MonitorParams) {
    let cancel = registry.register(params.item_id).await;
    tokio::spawn(run_monitor(registry, params, cancel));
}

async fn run_monitor(
    registry: Arc<MonitorRegistry>,
    params: MonitorParams,
    cancel: CancellationToken,
) {
    let client = ComfyUIClient::new(params.ws_url.clone());
    let mut connection = match client.connect(&params.client_id).await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(
                item_id = %params.item_id,
                error = %e,
                "Progress monitor could not connect; continuing without live updates",
            );
            registry.close(&params.item_id).await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = connection.ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text_message(&params, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    handle_binary_frame(&registry, &params, &data).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!(item_id = %params.item_id, "Monitor stream closed by worker");
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!(item_id = %params.item_id, error = %e, "Monitor stream error");
                    break;
                }
            },
        }
    }

    registry.close(&params.item_id).await;
}

async fn handle_text_message(params: &MonitorParams, text: &str) {
    let message = match messages::parse_message(text) {
        Ok(message) => message,
        Err(e) => {
            // Unknown event types are expected across ComfyUI versions.
            tracing::trace!(item_id = %params.item_id, error = %e, "Unparsed monitor event");
            return;
        }
    };

    match message {
        ComfyUIMessage::Executing(data) => {
            if let Some(node) = data.node {
                update_status(&params.statuses, &params.item_id, |status| {
                    status.current_node = Some(node);
                })
                .await;
            }
        }
        ComfyUIMessage::Progress(data) => {
            let pct = progress::stream_progress(data.value, data.max);
            update_status(&params.statuses, &params.item_id, |status| {
                status.progress = pct;
            })
            .await;
        }
        ComfyUIMessage::Executed(data) => {
            // First finished save node gives an early preview pointer into
            // the worker's own output store.
            let image = data
                .output
                .pointer("/images/0/filename")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned);
            if let Some(filename) = image {
                let subfolder = data
                    .output
                    .pointer("/images/0/subfolder")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let url = format!(
                    "{}/view?filename={}&subfolder={}&type=output",
                    params.api_url, filename, subfolder,
                );
                update_status(&params.statuses, &params.item_id, |status| {
                    status.preview = Some(url);
                    status.has_preview = true;
                })
                .await;
            }
        }
        ComfyUIMessage::ExecutionError(data) => {
            // Terminal handling belongs to the polling loop; just surface it.
            tracing::warn!(
                item_id = %params.item_id,
                node_id = %data.node_id,
                "Worker reported execution error: {}",
                data.exception_message,
            );
        }
        ComfyUIMessage::Status(_)
        | ComfyUIMessage::ExecutionStart(_)
        | ComfyUIMessage::ExecutionCached(_) => {}
    }
}

async fn handle_binary_frame(registry: &MonitorRegistry, params: &MonitorParams, data: &[u8]) {
    let Some(frame) = messages::parse_binary_frame(data) else {
        return;
    };
    if frame.frame_type != PREVIEW_FRAME_TYPE {
        return;
    }

    // Preview payloads are whatever encoder the worker picked; frames
    // that do not decode are dropped without comment.
    let image = match image::load_from_memory(frame.payload) {
        Ok(image) => image,
        Err(_) => return,
    };

    let file_name = format!(
        "preview_{}_{}.png",
        params.item_id,
        chrono::Utc::now().timestamp_millis(),
    );
    let path = params.preview_dir.join(file_name);
    if let Err(e) = image.save(&path) {
        tracing::debug!(item_id = %params.item_id, error = %e, "Preview frame not saved");
        return;
    }

    if registry.set_preview_path(&params.item_id, path.clone()).await {
        update_status(&params.statuses, &params.item_id, |status| {
            status.has_preview = true;
            status.preview = Some(path.to_string_lossy().into_owned());
        })
        .await;
    } else {
        // Session closed while we were decoding; do not leak the file.
        remove_preview_file(Some(path));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
