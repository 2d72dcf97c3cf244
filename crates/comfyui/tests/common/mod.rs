//! In-process mock ComfyUI worker for integration tests.
//!
//! Serves just enough of the worker protocol for the coordinator: health
//! probe, image upload, prompt submission, queue/history polling, output
//! download, and a WebSocket endpoint that accepts connections and waits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;

/// A valid 1x1 RGB PNG, served as every output and preview image.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90,
    0x77, 0x53, 0xde, 0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0xf8,
    0xcf, 0xc0, 0x00, 0x00, 0x03, 0x01, 0x01, 0x00, 0xc9, 0xfe, 0x92, 0xef, 0x00, 0x00, 0x00,
    0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

/// Shared, inspectable state of one mock worker.
#[derive(Default)]
pub struct MockState {
    /// Health probe answer; defaults to healthy.
    pub healthy: AtomicBool,
    /// When set, only the first N submitted prompts ever complete; the
    /// rest stay absent from history forever.
    pub complete_limit: Option<usize>,
    /// Display names of uploaded files, in arrival order.
    pub uploads: Mutex<Vec<String>>,
    /// Prompt ids issued, in submission order.
    pub submissions: Mutex<Vec<String>>,
}

impl MockState {
    pub fn healthy() -> Arc<Self> {
        let state = Self {
            healthy: AtomicBool::new(true),
            ..Self::default()
        };
        Arc::new(state)
    }

    pub fn unhealthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completing_first(limit: usize) -> Arc<Self> {
        let state = Self {
            healthy: AtomicBool::new(true),
            complete_limit: Some(limit),
            ..Self::default()
        };
        Arc::new(state)
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

/// A running mock worker bound to an ephemeral port.
pub struct MockWorker {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
    _server: JoinHandle<()>,
}

impl MockWorker {
    pub async fn spawn(state: Arc<MockState>) -> Self {
        let app = Router::new()
            .route("/system_stats", get(system_stats))
            .route("/upload/image", post(upload_image))
            .route("/prompt", post(submit_prompt))
            .route("/queue", get(get_queue))
            .route("/history/{id}", get(get_history))
            .route("/view", get(view))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock worker");
        let addr = listener.local_addr().expect("mock worker addr");

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock worker serve");
        });

        Self {
            addr,
            state,
            _server: server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn system_stats(State(state): State<Arc<MockState>>) -> Response {
    if state.healthy.load(Ordering::Relaxed) {
        Json(json!({ "system": {} })).into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

async fn upload_image(
    State(state): State<Arc<MockState>>,
    mut multipart: Multipart,
) -> Response {
    while let Some(field) = multipart.next_field().await.expect("multipart field") {
        if field.name() == Some("image") {
            let file_name = field
                .file_name()
                .unwrap_or("unnamed.png")
                .to_string();
            field.bytes().await.expect("field bytes");
            state.uploads.lock().unwrap().push(file_name.clone());
            return Json(json!({
                "name": file_name,
                "subfolder": "",
                "type": "input",
            }))
            .into_response();
        }
    }
    StatusCode::BAD_REQUEST.into_response()
}

async fn submit_prompt(
    State(state): State<Arc<MockState>>,
    Json(_body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let mut submissions = state.submissions.lock().unwrap();
    let prompt_id = format!("prompt-{}", submissions.len());
    submissions.push(prompt_id.clone());
    Json(json!({ "prompt_id": prompt_id, "number": submissions.len() }))
}

async fn get_queue() -> Json<serde_json::Value> {
    Json(json!({ "queue_running": [], "queue_pending": [] }))
}

async fn get_history(
    State(state): State<Arc<MockState>>,
    Path(prompt_id): Path<String>,
) -> Json<serde_json::Value> {
    let position = state
        .submissions
        .lock()
        .unwrap()
        .iter()
        .position(|id| *id == prompt_id);

    let completes = match (position, state.complete_limit) {
        (Some(position), Some(limit)) => position < limit,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if !completes {
        // Still "running": absent from history.
        return Json(json!({}));
    }

    Json(json!({
        &prompt_id: {
            "status": { "completed": true, "status_str": "success" },
            "outputs": {
                "20": {
                    "images": [
                        { "filename": "plain_0001.png", "subfolder": "", "type": "output" },
                    ]
                },
                "52": {
                    "images": [
                        { "filename": "refined_0001.png", "subfolder": "", "type": "output" },
                    ]
                },
            },
        }
    }))
}

async fn view() -> Response {
    TINY_PNG.to_vec().into_response()
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        // Hold the connection open until the client goes away.
        while let Some(Ok(_)) = socket.recv().await {}
    })
}
