//! Route table.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::{batches, health, workers};
use crate::state::AppState;

/// Routes mounted at the root (outside `/api/v1`).
pub fn root_router() -> Router<AppState> {
    Router::new().route("/health", get(health::health))
}

/// API v1 routes.
///
/// ```text
/// POST   /batches                  -> submit_batch
/// GET    /items/{id}               -> get_item_status
/// GET    /status                   -> all_statuses
/// GET    /results                  -> get_results
/// DELETE /results                  -> clear_results
/// POST   /stop                     -> stop_batch
/// POST   /results/{id}/reprocess   -> mark_for_reprocess
/// GET    /reprocess                -> reprocess_queue
/// DELETE /reprocess/{id}           -> unmark_for_reprocess
/// POST   /reprocess/run            -> run_reprocess
/// GET    /workers                  -> list_workers
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/batches", post(batches::submit_batch))
        .route("/items/{id}", get(batches::get_item_status))
        .route("/status", get(batches::all_statuses))
        .route(
            "/results",
            get(batches::get_results).delete(batches::clear_results),
        )
        .route("/stop", post(batches::stop_batch))
        .route("/results/{id}/reprocess", post(batches::mark_for_reprocess))
        .route("/reprocess", get(batches::reprocess_queue))
        .route("/reprocess/{id}", delete(batches::unmark_for_reprocess))
        .route("/reprocess/run", post(batches::run_reprocess))
        .route("/workers", get(workers::list_workers))
}
