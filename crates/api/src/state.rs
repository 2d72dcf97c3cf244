use std::sync::Arc;

use batchfan_comfyui::BatchCoordinator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Batch coordinator driving the worker pool.
    pub coordinator: Arc<BatchCoordinator>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
