//! Liveness probe.

use axum::Json;
use serde_json::json;

/// `GET /health` -- process liveness only; worker health lives under
/// `/api/v1/workers`.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
