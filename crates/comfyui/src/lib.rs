//! ComfyUI worker orchestration.
//!
//! Talks to a fixed pool of externally managed ComfyUI workers over their
//! REST and WebSocket interfaces, and drives batches of image generation
//! jobs through upload, submission, polling, and output download.

pub mod api;
pub mod client;
pub mod coordinator;
pub mod job;
pub mod messages;
pub mod monitor;
pub mod pool;

pub use coordinator::BatchCoordinator;
