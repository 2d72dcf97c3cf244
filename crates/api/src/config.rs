/// Server configuration loaded from environment variables.
///
/// All fields have sensible defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// Host the ComfyUI workers listen on (default: `127.0.0.1`).
    pub comfy_host: String,
    /// First worker port; worker `i` listens on `comfy_base_port + i`.
    pub comfy_base_port: u16,
    /// Number of workers in the pool.
    pub worker_count: usize,
    /// Path of the workflow template JSON.
    pub workflow_path: String,
    /// Directory for finished output images.
    pub output_dir: String,
    /// Scoped temp directory for live preview frames.
    pub preview_dir: String,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var           | Default                 |
    /// |-------------------|-------------------------|
    /// | `HOST`            | `0.0.0.0`               |
    /// | `PORT`            | `3000`                  |
    /// | `CORS_ORIGINS`    | `http://localhost:5173` |
    /// | `COMFY_HOST`      | `127.0.0.1`             |
    /// | `COMFY_BASE_PORT` | `8188`                  |
    /// | `WORKER_COUNT`    | `1`                     |
    /// | `WORKFLOW_PATH`   | `workflow.json`         |
    /// | `OUTPUT_DIR`      | `outputs`               |
    /// | `PREVIEW_DIR`     | `temp_previews`         |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let comfy_host = std::env::var("COMFY_HOST").unwrap_or_else(|_| "127.0.0.1".into());

        let comfy_base_port: u16 = std::env::var("COMFY_BASE_PORT")
            .unwrap_or_else(|_| "8188".into())
            .parse()
            .expect("COMFY_BASE_PORT must be a valid u16");

        let worker_count: usize = std::env::var("WORKER_COUNT")
            .unwrap_or_else(|_| "1".into())
            .parse()
            .expect("WORKER_COUNT must be a valid usize");

        let workflow_path =
            std::env::var("WORKFLOW_PATH").unwrap_or_else(|_| "workflow.json".into());
        let output_dir = std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "outputs".into());
        let preview_dir =
            std::env::var("PREVIEW_DIR").unwrap_or_else(|_| "temp_previews".into());

        Self {
            host,
            port,
            cors_origins,
            comfy_host,
            comfy_base_port,
            worker_count,
            workflow_path,
            output_dir,
            preview_dir,
        }
    }
}
