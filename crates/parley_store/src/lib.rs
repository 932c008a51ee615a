//! Persistent run store for parley.
//! One directory per run holds the status document and its auxiliary artifacts; this is the
//! single source of truth for run state across worker and caller processes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod lock;
mod memory;
mod restart;
mod store;

pub use lock::{ExclusiveLock, FsExclusiveLock, MemoryLock};
pub use memory::{MemoryRestartLedger, MemoryRunStore};
pub use restart::{profile_key, ApprovalRecord, DoneRecord, FsRestartLedger, RestartLedger};
pub use store::{now_unix_millis, run_key};

/// Runs older than this are eligible for garbage collection.
pub const DEFAULT_GC_HORIZON: Duration = Duration::from_secs(48 * 60 * 60);

pub const RESPONSE_ARTIFACT: &str = "response.md";
pub const REASONING_ARTIFACT: &str = "reasoning.md";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    NeedsUser,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// A worker is expected to be driving the run.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::NeedsUser => "needs_user",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure class carried by every persisted error.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Input,
    NotFound,
    TerminalConflict,
    Session,
    NeedsUser,
    Timeout,
    BrowserFailure,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NeedsUserReason {
    Login,
    Challenge,
    KillBrowserRequired,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub suggestion: String,
}

impl RunFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }
}

/// One completed question/answer exchange inside a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TurnRecord {
    pub prompt: String,
    pub response_text: String,
    #[serde(default)]
    pub reasoning_text: String,
    pub completed_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    pub created_at: i64,
    pub updated_at: i64,
    pub prompt: String,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    #[serde(default)]
    pub parent_run_id: Option<String>,
    #[serde(default)]
    pub conversation_ref: Option<String>,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub reasoning_text: String,
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    /// Prompts already handed to the remote service. Never decremented.
    #[serde(default)]
    pub turns_submitted: usize,
    /// Assistant-turn count observed right before the latest submission.
    #[serde(default)]
    pub baseline_turns: Option<usize>,
    #[serde(default)]
    pub error: Option<RunFailure>,
    #[serde(default)]
    pub needs_user_reason: Option<NeedsUserReason>,
    #[serde(default)]
    pub worker_pid: Option<u32>,
    #[serde(default)]
    pub resumes: u32,
    /// Restart approval granted by the caller on resume; the next restart wait starts no
    /// later than this so the approval counts for it.
    #[serde(default)]
    pub restart_approved_at: Option<i64>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, prompt: impl Into<String>, now_ms: i64) -> Self {
        Self {
            run_id: run_id.into(),
            state: RunState::Pending,
            created_at: now_ms,
            updated_at: now_ms,
            prompt: prompt.into(),
            follow_ups: Vec::new(),
            parent_run_id: None,
            conversation_ref: None,
            response_text: String::new(),
            reasoning_text: String::new(),
            turns: Vec::new(),
            turns_submitted: 0,
            baseline_turns: None,
            error: None,
            needs_user_reason: None,
            worker_pid: None,
            resumes: 0,
            restart_approved_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of prompts this run will submit: the initial one plus follow-ups.
    pub fn prompt_count(&self) -> usize {
        1 + self.follow_ups.len()
    }

    /// Prompt at `index` in submission order.
    pub fn prompt_at(&self, index: usize) -> Option<&str> {
        if index == 0 {
            Some(self.prompt.as_str())
        } else {
            self.follow_ups.get(index - 1).map(String::as_str)
        }
    }

    /// The submitted prompt whose answer is still outstanding, if any.
    pub fn awaiting_turn(&self) -> Option<usize> {
        if self.turns_submitted > self.turns.len() {
            Some(self.turns.len())
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreErr {
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run already exists: {0}")]
    AlreadyExists(String),
    #[error("run {run_id} is terminal ({state})")]
    Terminal { run_id: String, state: RunState },
    #[error("io error: {0}")]
    Io(String),
    #[error("serialize error: {0}")]
    Serialize(String),
}

/// Mutation applied under the per-run lock against the freshly re-read record.
pub type RunMutation<'a> = &'a mut dyn FnMut(&mut RunRecord) -> Result<(), StoreErr>;

/// Explicit store interface injected into the state machine and the caller client.
/// Every write is atomic for concurrent readers; terminal records are immutable.
pub trait RunStore: Send + Sync {
    /// Persist a brand-new record. Fails with `AlreadyExists` when the id is taken.
    fn create(&self, record: &RunRecord) -> Result<(), StoreErr>;
    fn get(&self, run_id: &str) -> Result<RunRecord, StoreErr>;
    /// Atomic whole-record replace. Refused once the stored record is terminal.
    fn put(&self, record: &RunRecord) -> Result<(), StoreErr>;
    /// Locked read-modify-write. Refused with `Terminal` when the stored record is terminal;
    /// `updated_at` is stamped by the store.
    fn update(&self, run_id: &str, mutate: RunMutation<'_>) -> Result<RunRecord, StoreErr>;
    fn list(&self) -> Result<Vec<RunRecord>, StoreErr>;
    fn delete(&self, run_id: &str) -> Result<(), StoreErr>;
    fn write_artifact(&self, run_id: &str, name: &str, text: &str) -> Result<(), StoreErr>;
    fn read_artifact(&self, run_id: &str, name: &str) -> Result<String, StoreErr>;
    /// Liveness lock held by the one worker driving `run_id`.
    fn worker_lock(&self, run_id: &str, stale_after: Duration) -> Arc<dyn ExclusiveLock>;

    /// Remove runs created before `now_ms - horizon`.
    /// Pending/running runs are kept unless they also stopped updating before the cutoff.
    /// Allocation: one Vec of removed ids. Complexity: O(n), n = stored runs.
    fn gc(&self, now_ms: i64, horizon: Duration) -> Result<Vec<String>, StoreErr> {
        let cutoff = now_ms.saturating_sub(horizon.as_millis() as i64);
        let mut removed = Vec::new();
        for record in self.list()? {
            if record.created_at >= cutoff {
                continue;
            }
            if record.state.is_active() && record.updated_at >= cutoff {
                continue;
            }
            match self.delete(&record.run_id) {
                Ok(()) | Err(StoreErr::NotFound(_)) => removed.push(record.run_id),
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }
}

#[derive(Clone, Debug)]
pub struct FsRunStore {
    root: PathBuf,
}
