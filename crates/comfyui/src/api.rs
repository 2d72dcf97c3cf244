//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the worker HTTP API (health probe, image upload, workflow
//! submission, queue and history retrieval, output download) using
//! [`reqwest`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

/// HTTP client for a single ComfyUI worker.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedImage {
    /// Server-side file name to reference from workflows.
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_input_type")]
    pub image_type: String,
}

fn default_input_type() -> String {
    "input".to_string()
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i32,
}

/// One output image reference from a history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_output_type")]
    pub image_type: String,
}

fn default_output_type() -> String {
    "output".to_string()
}

/// Snapshot of the worker's execution queue from `GET /queue`.
#[derive(Debug, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<Value>,
    #[serde(default)]
    pub queue_pending: Vec<Value>,
}

impl QueueSnapshot {
    /// Whether a prompt id appears in the running or pending queue.
    ///
    /// Queue entries are `[number, prompt_id, ...]` arrays; index 1 holds
    /// the prompt id.
    pub fn contains(&self, prompt_id: &str) -> bool {
        self.queue_running
            .iter()
            .chain(self.queue_pending.iter())
            .any(|entry| entry.get(1).and_then(Value::as_str) == Some(prompt_id))
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// An image upload failed.
    #[error("Upload of '{file}' to {endpoint} failed: {detail}")]
    Upload {
        endpoint: String,
        file: String,
        detail: String,
    },
}

impl ComfyUIApi {
    /// Create an API client for a worker at `api_url` (base HTTP URL,
    /// e.g. `http://host:8188`), reusing an existing [`reqwest::Client`]
    /// so connections pool across workers.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self { client, api_url }
    }

    /// Probe worker health via `GET /system_stats`.
    ///
    /// Any failure (timeout, connection refused, non-2xx) yields `false`;
    /// this never errors.
    pub async fn check_health(&self, timeout: Duration) -> bool {
        match self
            .client
            .get(format!("{}/system_stats", self.api_url))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Upload a local image file via multipart `POST /upload/image`.
    ///
    /// The file must exist locally; a missing file fails before any
    /// request is made. There is no internal retry.
    pub async fn upload_image(
        &self,
        path: &Path,
        display_name: &str,
    ) -> Result<UploadedImage, ComfyUIApiError> {
        let endpoint = format!("{}/upload/image", self.api_url);

        let bytes = tokio::fs::read(path).await.map_err(|e| ComfyUIApiError::Upload {
            endpoint: endpoint.clone(),
            file: display_name.to_string(),
            detail: format!("cannot read local file {}: {e}", path.display()),
        })?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(display_name.to_string())
            .mime_str(guess_mime(path))?;
        let form = reqwest::multipart::Form::new().part("image", part);

        let response = self.client.post(&endpoint).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::Upload {
                endpoint,
                file: display_name.to_string(),
                detail: format!("status {}: {body}", status.as_u16()),
            });
        }

        Ok(response.json::<UploadedImage>().await?)
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID.  Returns the server-assigned `prompt_id` and queue
    /// position.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve the current execution queue via `GET /queue`.
    pub async fn get_queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request.  The returned JSON
    /// contains output file paths, node results, and timing data.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Download an output image via `GET /view`.
    pub async fn download_view(
        &self,
        image: &OutputImage,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.image_type.as_str()),
            ])
            .send()
            .await?;

        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Best-effort content type from the file extension.
fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// History entry helpers
// ---------------------------------------------------------------------------

/// Typed view over one prompt's entry in a `/history/{id}` response.
#[derive(Debug, Clone, Copy)]
pub struct HistoryEntry<'a>(&'a Value);

impl<'a> HistoryEntry<'a> {
    /// Look up the entry for `prompt_id` in a raw history response.
    /// Absent while the worker has not finished registering the job.
    pub fn for_prompt(history: &'a Value, prompt_id: &str) -> Option<Self> {
        history.get(prompt_id).map(Self)
    }

    /// Whether the worker marked the job completed.
    pub fn completed(&self) -> bool {
        self.0
            .pointer("/status/completed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Worker-reported error message, when `status.status_str` is `error`.
    pub fn error_message(&self) -> Option<String> {
        let status_str = self.0.pointer("/status/status_str").and_then(Value::as_str)?;
        if status_str != "error" {
            return None;
        }
        let messages = self.0.pointer("/status/messages");
        Some(summarize_error_messages(messages))
    }

    /// Node-level `execution.current` / `execution.total` counters, when
    /// the worker reports them.
    pub fn execution_counters(&self) -> Option<(u64, u64)> {
        let current = self.0.pointer("/execution/current").and_then(Value::as_u64)?;
        let total = self.0.pointer("/execution/total").and_then(Value::as_u64)?;
        Some((current, total))
    }

    /// Output image references recorded under a given node id.
    pub fn node_images(&self, node_id: &str) -> Vec<OutputImage> {
        self.0
            .pointer(&format!("/outputs/{node_id}/images"))
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|img| serde_json::from_value(img.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Pull a human-readable summary out of a history `status.messages` list.
///
/// Messages are `[type, payload]` pairs; execution errors carry an
/// `exception_message`. Falls back to the raw JSON when no exception
/// message is present.
fn summarize_error_messages(messages: Option<&Value>) -> String {
    let Some(messages) = messages else {
        return "worker reported an error without details".to_string();
    };

    if let Some(entries) = messages.as_array() {
        for entry in entries {
            if entry.get(0).and_then(Value::as_str) == Some("execution_error") {
                if let Some(msg) = entry.pointer("/1/exception_message").and_then(Value::as_str) {
                    return msg.to_string();
                }
            }
        }
    }

    messages.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
