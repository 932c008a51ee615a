use std::sync::Arc;
use std::time::Duration;

use parley_runtime::{RuntimeConfig, RuntimeError, WorkerLauncher};
use parley_store::{
    now_unix_millis, ApprovalRecord, ErrorKind, FsRestartLedger, FsRunStore, RestartLedger,
    RunFailure, RunRecord, RunState, RunStore, StoreErr, DEFAULT_GC_HORIZON,
};
use thiserror::Error;
use tokio::time::{sleep, Instant};

pub const RUN_ID_PREFIX: &str = "run_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub gc_horizon: Duration,
    pub watch_poll_interval: Duration,
    /// Worker locks older than this are treated as orphaned by `resume`.
    pub worker_lock_stale_after: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gc_horizon: DEFAULT_GC_HORIZON,
            watch_poll_interval: Duration::from_millis(500),
            worker_lock_stale_after: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gc_horizon(mut self, horizon: Duration) -> Self {
        self.gc_horizon = horizon;
        self
    }

    pub fn with_watch_poll_interval(mut self, interval: Duration) -> Self {
        self.watch_poll_interval = interval;
        self
    }

    pub fn with_worker_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.worker_lock_stale_after = stale_after;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub prompt: String,
    /// Submitted in order after the previous turn completes, in the same conversation.
    pub follow_ups: Vec<String>,
    /// Continue the conversation of this terminal run.
    pub follow_up_of: Option<String>,
}

impl StartRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_follow_up(mut self, prompt: impl Into<String>) -> Self {
        self.follow_ups.push(prompt.into());
        self
    }

    pub fn continuing(mut self, run_id: impl Into<String>) -> Self {
        self.follow_up_of = Some(run_id.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Falls back to `ClientConfig::watch_poll_interval`.
    pub poll_interval: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl WatchOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    /// Grant the pending browser-restart approval on the caller's behalf.
    pub approve_restart: bool,
}

impl ResumeOptions {
    pub fn approving_restart() -> Self {
        Self {
            approve_restart: true,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run {run_id} is already {state}")]
    TerminalConflict { run_id: String, state: RunState },
    #[error("watch timed out; run {run_id} is still {state}")]
    WatchTimeout { run_id: String, state: RunState },
    #[error("store error: {0}")]
    Store(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Input(_) => ErrorKind::Input,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TerminalConflict { .. } => ErrorKind::TerminalConflict,
            Self::WatchTimeout { .. } => ErrorKind::Timeout,
            Self::Store(_) => ErrorKind::Session,
            Self::Runtime(err) => err.kind(),
        }
    }
}

impl From<StoreErr> for ClientError {
    fn from(value: StoreErr) -> Self {
        match value {
            StoreErr::NotFound(run_id) => Self::NotFound(run_id),
            StoreErr::Terminal { run_id, state } => Self::TerminalConflict { run_id, state },
            other => Self::Store(other.to_string()),
        }
    }
}

/// Caller-side operations over persisted runs. Never touches the browser; every command
/// reads or writes the store and, for `start`/`resume`, launches a worker.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn RunStore>,
    launcher: Arc<dyn WorkerLauncher>,
    ledger: Option<Arc<dyn RestartLedger>>,
    config: ClientConfig,
}

impl Client {
    pub fn new(store: Arc<dyn RunStore>, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            store,
            launcher,
            ledger: None,
            config: ClientConfig::default(),
        }
    }

    /// Filesystem store and restart ledger rooted at `config.home`.
    pub fn from_runtime_config(config: &RuntimeConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let ledger = FsRestartLedger::new(
            &config.home,
            &config.profile_scope(),
            config.timeouts.restart_lock_stale_after,
        );
        Self::new(Arc::new(FsRunStore::new(&config.home)), launcher)
            .with_ledger(Arc::new(ledger))
            .with_config(
                ClientConfig::default()
                    .with_worker_lock_stale_after(config.timeouts.worker_lock_stale_after),
            )
    }

    /// Needed for `resume` with `approve_restart`.
    pub fn with_ledger(mut self, ledger: Arc<dyn RestartLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validate, persist a `pending` run and launch its worker. Returns the new run id.
    /// A launch failure leaves the run `failed` with `SESSION`.
    pub async fn start(&self, request: StartRequest) -> Result<String, ClientError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(ClientError::Input("prompt must not be empty".to_owned()));
        }
        if request.follow_ups.iter().any(|p| p.trim().is_empty()) {
            return Err(ClientError::Input(
                "follow-up prompts must not be empty".to_owned(),
            ));
        }

        let run_id = format!("{RUN_ID_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let mut record = RunRecord::new(&run_id, prompt, now_unix_millis());
        record.follow_ups = request
            .follow_ups
            .iter()
            .map(|p| p.trim().to_owned())
            .collect();

        if let Some(parent_id) = request.follow_up_of.as_deref() {
            let parent = match self.status(parent_id).await {
                Ok(parent) => parent,
                Err(ClientError::NotFound(_)) => {
                    return Err(ClientError::Input(format!(
                        "follow-up target {parent_id} does not exist"
                    )));
                }
                Err(err) => return Err(err),
            };
            if !parent.is_terminal() {
                return Err(ClientError::Input(format!(
                    "run {parent_id} is still {}; wait for it before following up",
                    parent.state
                )));
            }
            let Some(conversation_ref) = parent.conversation_ref else {
                return Err(ClientError::Input(format!(
                    "run {parent_id} has no conversation to continue"
                )));
            };
            record.parent_run_id = Some(parent.run_id);
            record.conversation_ref = Some(conversation_ref);
        }

        self.store_io({
            let record = record.clone();
            move |store| store.create(&record)
        })
        .await?;
        tracing::info!(run_id = %run_id, follow_ups = record.follow_ups.len(), "run created");

        self.launch(&run_id).await?;
        Ok(run_id)
    }

    pub async fn status(&self, run_id: &str) -> Result<RunRecord, ClientError> {
        let run_id = run_id.to_owned();
        self.store_io(move |store| store.get(&run_id)).await
    }

    /// Block until the run is terminal or needs the user.
    pub async fn watch(&self, run_id: &str, options: WatchOptions) -> Result<RunRecord, ClientError> {
        let poll_interval = options
            .poll_interval
            .unwrap_or(self.config.watch_poll_interval);
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let record = self.status(run_id).await?;
            if record.is_terminal() || record.state == RunState::NeedsUser {
                return Ok(record);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(ClientError::WatchTimeout {
                    run_id: record.run_id,
                    state: record.state,
                });
            }
            sleep(poll_interval).await;
        }
    }

    /// `pending|running|needs_user -> canceled`. The worker observes it on its next poll.
    pub async fn cancel(&self, run_id: &str) -> Result<RunRecord, ClientError> {
        let run_id_owned = run_id.to_owned();
        let record = self
            .store_io(move |store| {
                store.update(&run_id_owned, &mut |record| {
                    record.state = RunState::Canceled;
                    record.needs_user_reason = None;
                    record.error = None;
                    Ok(())
                })
            })
            .await?;
        tracing::info!(run_id = %run_id, "run canceled");
        Ok(record)
    }

    /// Re-enter `running` and launch a fresh worker.
    /// Allowed from `needs_user`, or from `pending`/`running` when no live worker holds the
    /// run (orphaned after a crash).
    pub async fn resume(
        &self,
        run_id: &str,
        options: ResumeOptions,
    ) -> Result<RunRecord, ClientError> {
        let record = self.status(run_id).await?;
        if record.is_terminal() {
            return Err(ClientError::TerminalConflict {
                run_id: record.run_id,
                state: record.state,
            });
        }
        if record.state.is_active() && self.worker_alive(run_id).await? {
            return Err(ClientError::Input(format!(
                "run {run_id} is {} with a live worker",
                record.state
            )));
        }

        let approved_at = if options.approve_restart {
            let Some(ledger) = self.ledger.clone() else {
                return Err(ClientError::Input(
                    "restart approval needs a restart ledger".to_owned(),
                ));
            };
            let approval = ApprovalRecord {
                approved_at: now_unix_millis(),
                approved_by: Some(format!("resume:{run_id}")),
            };
            let approved_at = approval.approved_at;
            tokio::task::spawn_blocking(move || ledger.write_approval(&approval))
                .await
                .map_err(|err| ClientError::Store(format!("ledger worker join failed: {err}")))??;
            tracing::info!(run_id = %run_id, "browser restart approved by caller");
            Some(approved_at)
        } else {
            None
        };

        let run_id_owned = run_id.to_owned();
        let record = self
            .store_io(move |store| {
                store.update(&run_id_owned, &mut |record| {
                    record.state = RunState::Running;
                    record.error = None;
                    record.needs_user_reason = None;
                    record.worker_pid = None;
                    record.resumes = record.resumes.saturating_add(1);
                    if approved_at.is_some() {
                        record.restart_approved_at = approved_at;
                    }
                    Ok(())
                })
            })
            .await?;
        tracing::info!(run_id = %run_id, resumes = record.resumes, "run resumed");

        self.launch(run_id).await?;
        Ok(record)
    }

    /// All runs, newest first.
    pub async fn list(&self) -> Result<Vec<RunRecord>, ClientError> {
        self.store_io(|store| store.list()).await
    }

    /// Delete runs older than `horizon` (default `ClientConfig::gc_horizon`). Returns removed ids.
    pub async fn gc(&self, horizon: Option<Duration>) -> Result<Vec<String>, ClientError> {
        let horizon = horizon.unwrap_or(self.config.gc_horizon);
        let removed = self
            .store_io(move |store| store.gc(now_unix_millis(), horizon))
            .await?;
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "expired runs removed");
        }
        Ok(removed)
    }

    pub async fn read_artifact(&self, run_id: &str, name: &str) -> Result<String, ClientError> {
        let run_id = run_id.to_owned();
        let name = name.to_owned();
        self.store_io(move |store| store.read_artifact(&run_id, &name))
            .await
    }

    async fn launch(&self, run_id: &str) -> Result<(), ClientError> {
        let Err(err) = self.launcher.launch(run_id).await else {
            return Ok(());
        };
        tracing::warn!(run_id = %run_id, error = %err, "worker launch failed");
        let failure = RunFailure::new(
            ErrorKind::Session,
            err.to_string(),
            "check the worker program and PARLEY_HOME, then start a new run",
        );
        let run_id_owned = run_id.to_owned();
        let persisted = self
            .store_io(move |store| {
                store.update(&run_id_owned, &mut |record| {
                    record.state = RunState::Failed;
                    record.error = Some(failure.clone());
                    record.worker_pid = None;
                    Ok(())
                })
            })
            .await;
        if let Err(store_err) = persisted {
            tracing::warn!(run_id = %run_id, error = %store_err, "recording launch failure failed");
        }
        Err(ClientError::Runtime(err))
    }

    async fn worker_alive(&self, run_id: &str) -> Result<bool, ClientError> {
        let run_id = run_id.to_owned();
        let stale_after = self.config.worker_lock_stale_after;
        self.store_io(move |store| {
            let lock = store.worker_lock(&run_id, stale_after);
            if lock.try_acquire()? {
                lock.release()?;
                Ok(false)
            } else {
                Ok(true)
            }
        })
        .await
    }

    async fn store_io<T: Send + 'static>(
        &self,
        op: impl FnOnce(&dyn RunStore) -> Result<T, StoreErr> + Send + 'static,
    ) -> Result<T, ClientError> {
        let store = Arc::clone(&self.store);
        let joined = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| ClientError::Store(format!("store worker join failed: {err}")))?;
        joined.map_err(ClientError::from)
    }
}

#[cfg(test)]
mod tests;
