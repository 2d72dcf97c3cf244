//! Pure domain logic for the batch generation orchestrator.
//!
//! This crate has no I/O beyond reading workflow template files; everything
//! network- or runtime-related lives in `batchfan-comfyui` and
//! `batchfan-api`.

pub mod batch;
pub mod error;
pub mod naming;
pub mod progress;
pub mod workflow;
