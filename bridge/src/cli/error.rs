//! Error types for the CLI.

use bridge::{EditError, StoreError};
use rule_engine::ValidationError;
use thiserror::Error;

/// CLI-specific result type.
pub type Result<T> = std::result::Result<T, CliError>;

/// CLI error types. Every variant ends the process with status 1.
#[derive(Error, Debug)]
pub enum CliError {
    /// Store error.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Rejected rule.
    #[error("invalid rule: {0}")]
    Validation(#[from] ValidationError),

    /// Rejected edit.
    #[error("{0}")]
    Edit(#[from] EditError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
