//! HTTP surface for the batch generation orchestrator.

pub mod config;
pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
pub mod state;
