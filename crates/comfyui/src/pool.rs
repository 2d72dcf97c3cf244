//! Fixed-size worker pool registry.
//!
//! Workers are externally managed ComfyUI processes listening on a
//! contiguous port range. The pool never spawns or restarts them; it only
//! knows their endpoints, assigns items round-robin, and probes health.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::api::ComfyUIApi;

/// Timeout for a single worker health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Addresses of one worker in the pool.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub index: usize,
    /// Base HTTP URL, e.g. `http://host:8188`.
    pub api_url: String,
    /// Base WebSocket URL, e.g. `ws://host:8188`.
    pub ws_url: String,
}

/// Point-in-time health view of one worker, for observers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub index: usize,
    pub api_url: String,
    pub healthy: bool,
}

/// Registry of worker endpoints with round-robin assignment.
pub struct WorkerPool {
    endpoints: Vec<WorkerEndpoint>,
    healthy: Vec<AtomicBool>,
    client: reqwest::Client,
}

impl WorkerPool {
    /// Build a pool of `count` workers on consecutive ports starting at
    /// `base_port`.
    pub fn from_port_range(host: &str, base_port: u16, count: usize) -> Self {
        let endpoints = (0..count)
            .map(|index| {
                let port = base_port + index as u16;
                WorkerEndpoint {
                    index,
                    api_url: format!("http://{host}:{port}"),
                    ws_url: format!("ws://{host}:{port}"),
                }
            })
            .collect();
        Self::from_endpoints(endpoints)
    }

    /// Build a pool from explicit HTTP base URLs. The WebSocket URL is
    /// derived by swapping the scheme.
    pub fn from_urls(api_urls: Vec<String>) -> Self {
        let endpoints = api_urls
            .into_iter()
            .enumerate()
            .map(|(index, api_url)| {
                let ws_url = api_url.replacen("http", "ws", 1);
                WorkerEndpoint {
                    index,
                    api_url,
                    ws_url,
                }
            })
            .collect();
        Self::from_endpoints(endpoints)
    }

    fn from_endpoints(endpoints: Vec<WorkerEndpoint>) -> Self {
        let healthy = endpoints.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            endpoints,
            healthy,
            client: reqwest::Client::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Assign a worker for the item at `sequence_index` within its batch.
    ///
    /// Pure round-robin: `sequence_index % size`. Assignment ignores
    /// health; the per-item health check decides whether the item runs.
    ///
    /// # Panics
    ///
    /// Panics if the pool is empty. Callers reject batches up front when
    /// no workers are configured.
    pub fn assign(&self, sequence_index: usize) -> &WorkerEndpoint {
        &self.endpoints[sequence_index % self.endpoints.len()]
    }

    /// API client for one worker, sharing the pool's HTTP client.
    pub fn api(&self, index: usize) -> Option<ComfyUIApi> {
        self.endpoints
            .get(index)
            .map(|ep| ComfyUIApi::with_client(self.client.clone(), ep.api_url.clone()))
    }

    /// Shared HTTP client for callers building their own [`ComfyUIApi`].
    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Probe one worker and record the outcome.
    pub async fn check_health(&self, index: usize) -> bool {
        let Some(api) = self.api(index) else {
            return false;
        };
        let healthy = api.check_health(HEALTH_CHECK_TIMEOUT).await;
        self.healthy[index].store(healthy, Ordering::Relaxed);
        healthy
    }

    /// Probe every worker, record the outcomes, and return the number of
    /// healthy workers.
    pub async fn refresh_health(&self) -> usize {
        let mut healthy_count = 0;
        for index in 0..self.endpoints.len() {
            if self.check_health(index).await {
                healthy_count += 1;
            } else {
                tracing::warn!(
                    worker_index = index,
                    api_url = %self.endpoints[index].api_url,
                    "Worker failed health check",
                );
            }
        }
        tracing::info!(
            healthy = healthy_count,
            total = self.endpoints.len(),
            "Worker pool health refreshed",
        );
        healthy_count
    }

    /// Last recorded health of every worker.
    pub fn snapshot(&self) -> Vec<WorkerHealth> {
        self.endpoints
            .iter()
            .map(|ep| WorkerHealth {
                index: ep.index,
                api_url: ep.api_url.clone(),
                healthy: self.healthy[ep.index].load(Ordering::Relaxed),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_endpoints() {
        let pool = WorkerPool::from_port_range("127.0.0.1", 8200, 3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.assign(0).api_url, "http://127.0.0.1:8200");
        assert_eq!(pool.assign(2).api_url, "http://127.0.0.1:8202");
        assert_eq!(pool.assign(2).ws_url, "ws://127.0.0.1:8202");
    }

    #[test]
    fn round_robin_wraps() {
        let pool = WorkerPool::from_port_range("127.0.0.1", 8200, 3);
        assert_eq!(pool.assign(0).index, 0);
        assert_eq!(pool.assign(1).index, 1);
        assert_eq!(pool.assign(2).index, 2);
        assert_eq!(pool.assign(3).index, 0);
        assert_eq!(pool.assign(7).index, 1);
    }

    #[test]
    fn from_urls_derives_ws_scheme() {
        let pool = WorkerPool::from_urls(vec!["http://127.0.0.1:9999".to_string()]);
        assert_eq!(pool.assign(0).ws_url, "ws://127.0.0.1:9999");
    }

    #[test]
    fn snapshot_starts_unhealthy() {
        let pool = WorkerPool::from_port_range("127.0.0.1", 8200, 2);
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|w| !w.healthy));
    }
}
