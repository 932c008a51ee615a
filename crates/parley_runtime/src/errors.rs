use parley_store::{ErrorKind, RunState, StoreErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Browser driver failures. All variants are treated as transient by the worker and retried
/// with backoff before escalating to a restart.
#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionError {
    #[error("browser unreachable: {0}")]
    Unreachable(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("execution context detached: {0}")]
    Detached(String),
    #[error("browser operation timed out: {0}")]
    Timeout(String),
    #[error("script failed: {0}")]
    Script(String),
}

#[derive(Clone, Debug, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotifyError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),
    #[error("notifier timed out")]
    Timeout,
    #[error("notifier failed: {0}")]
    Failed(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run {run_id} is already {state}")]
    TerminalConflict { run_id: String, state: RunState },
    #[error("run {0} already has a live worker")]
    WorkerActive(String),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("store error: {0}")]
    Store(String),
    #[error("worker launch failed: {0}")]
    Launch(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Persisted error class for this failure.
    /// Store, launch and internal failures surface as `SESSION`: the run could not be driven.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) | Self::WorkerActive(_) => ErrorKind::Input,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TerminalConflict { .. } => ErrorKind::TerminalConflict,
            Self::Session(_) | Self::Store(_) | Self::Launch(_) | Self::Internal(_) => {
                ErrorKind::Session
            }
        }
    }
}

impl From<StoreErr> for RuntimeError {
    fn from(value: StoreErr) -> Self {
        match value {
            StoreErr::NotFound(run_id) => Self::NotFound(run_id),
            StoreErr::Terminal { run_id, state } => Self::TerminalConflict { run_id, state },
            other => Self::Store(other.to_string()),
        }
    }
}
