//! Handlers for worker pool observation.
//!
//! Workers are externally managed processes; the API only exposes their
//! endpoints and last recorded health.

use axum::extract::State;
use axum::Json;

use batchfan_comfyui::pool::WorkerHealth;

use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /workers
// ---------------------------------------------------------------------------

/// Re-probe every worker and return the pool health snapshot.
pub async fn list_workers(State(state): State<AppState>) -> Json<DataResponse<Vec<WorkerHealth>>> {
    let pool = state.coordinator.pool();
    pool.refresh_health().await;
    Json(DataResponse {
        data: pool.snapshot(),
    })
}
