//! Typed error taxonomy for the coordinator core (§7 of the spec).
//!
//! Contract violations the caller must be able to distinguish
//! (`NotFound`, `IllegalTransition`, `ContendedState`,
//! `TaskRetryExhausted`) are carried as enum variants. `LockConflict`
//! is deliberately *not* one of these: per §7 it is data, returned
//! inside `LockResult`, never raised as an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("illegal transition: {reason}")]
    IllegalTransition { reason: String },

    #[error("could not acquire state lock within {waited_ms}ms")]
    ContendedState { waited_ms: u64 },

    #[error("task {task_id} exhausted its {max_attempts} retry attempts: {last_error}")]
    TaskRetryExhausted {
        task_id: String,
        max_attempts: u32,
        last_error: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
