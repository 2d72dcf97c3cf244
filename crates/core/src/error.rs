//! Error types shared across crates.

use thiserror::Error;

/// Core domain errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A workflow template could not be loaded or is structurally unusable.
    #[error("Workflow template error: {0}")]
    Template(String),

    /// Filesystem error while reading a template or writing an output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the workspace.
pub type CoreResult<T> = Result<T, CoreError>;
