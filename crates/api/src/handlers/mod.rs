//! HTTP handlers.

pub mod batches;
pub mod health;
pub mod workers;
