//! Error taxonomy for the harness.
//!
//! Construction-time problems (configuration, unknown actions, missing
//! handlers) surface before any action runs. Recoverable action failures are
//! never raised; they become outcomes. A fatal action failure is both
//! recorded and raised as [`HarnessError::HandlerFatal`].

use crate::pipeline::RunResult;

/// Errors produced by the harness core.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("missing required configuration key: {key}")]
    MissingConfiguration { key: String },

    #[error("invalid configuration for key {key}: {reason}")]
    InvalidConfiguration { key: String, reason: String },

    #[error("unknown action: {name}")]
    UnknownAction { name: String },

    #[error("action declared more than once: {name}")]
    DuplicateAction { name: String },

    #[error("no handler registered for action: {name}")]
    MissingHandler { name: String },

    #[error("pipeline has already been executed")]
    AlreadyExecuted,

    #[error("action {action} failed fatally: {message}")]
    HandlerFatal {
        action: String,
        message: String,
        result: Box<RunResult>,
    },

    #[error("invalid error rule: {reason}")]
    InvalidRule { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HarnessError {
    /// The partial run result carried by a fatal abort, if any.
    pub fn run_result(&self) -> Option<&RunResult> {
        match self {
            HarnessError::HandlerFatal { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
