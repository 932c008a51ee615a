//! Run state machine: drives one run from `pending`/`needs_user` to a resting state.
//!
//! Every decision re-reads the persisted record first, so a caller's cancel (or any other
//! terminal write) wins over whatever the worker observed in the page.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parley_store::{
    now_unix_millis, ErrorKind, ExclusiveLock, NeedsUserReason, RunFailure, RunRecord, RunState,
    RunStore, StoreErr, TurnRecord, REASONING_ARTIFACT, RESPONSE_ARTIFACT,
};
use tokio::time::{sleep, Instant};

use crate::errors::{RuntimeError, SessionError};
use crate::restart::{RestartCoordinator, RestartOutcome, RestartRequest};
use crate::worker::WorkerDeps;

mod session;

const KILL_BROWSER_SUGGESTION: &str = "approve the browser restart, then run resume";
const LOGIN_SUGGESTION: &str = "log in to the chat service in the browser profile, then run resume";
const CHALLENGE_SUGGESTION: &str = "solve the verification challenge in the browser, then run resume";

/// Why an attempt stopped before reaching a resting state.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// Transient browser failure; retried with backoff, then escalated to a restart.
    Session(SessionError),
    Fatal(RuntimeError),
}

impl From<SessionError> for Interrupt {
    fn from(value: SessionError) -> Self {
        Self::Session(value)
    }
}

impl From<RuntimeError> for Interrupt {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Session(err) => Self::Session(err),
            other => Self::Fatal(other),
        }
    }
}

pub struct RunMachine {
    deps: WorkerDeps,
    run_id: String,
    last_seen: Arc<ArcSwapOption<RunRecord>>,
    heartbeat: Option<Arc<dyn ExclusiveLock>>,
}

impl RunMachine {
    pub fn new(deps: WorkerDeps, run_id: impl Into<String>) -> Self {
        Self {
            deps,
            run_id: run_id.into(),
            last_seen: Arc::new(ArcSwapOption::new(None)),
            heartbeat: None,
        }
    }

    /// Lock refreshed on every poll so peers can tell this worker is alive.
    pub fn with_heartbeat(mut self, lock: Arc<dyn ExclusiveLock>) -> Self {
        self.heartbeat = Some(lock);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Last record this machine read or wrote. Lock-free; for in-process observers.
    pub fn last_seen(&self) -> Option<Arc<RunRecord>> {
        self.last_seen.load_full()
    }

    /// Shared handle to the published snapshot; stays valid after the machine is dropped.
    pub fn snapshot_handle(&self) -> Arc<ArcSwapOption<RunRecord>> {
        Arc::clone(&self.last_seen)
    }

    /// Drive the run until it is terminal or needs the user. Returns the resting record.
    /// Side effects: browser automation, store writes, possibly a browser restart.
    pub async fn drive(&self) -> Result<RunRecord, RuntimeError> {
        let retry = self.deps.config.retry;
        let deadline = Instant::now() + self.deps.config.timeouts.run_timeout;

        let record = self.enter_running().await?;
        if record.state != RunState::Running {
            return Ok(record);
        }
        tracing::info!(run_id = %self.run_id, turns_submitted = record.turns_submitted, "run started");

        let mut session_failures = 0u32;
        let mut restarts = 0u32;
        loop {
            if Instant::now() >= deadline {
                return self.fail_timeout().await;
            }

            let err = match self.attempt(deadline).await {
                Ok(record) => return Ok(record),
                Err(Interrupt::Fatal(err)) => return self.fail_with(&err).await,
                Err(Interrupt::Session(err)) => err,
            };

            let current = self.load().await?;
            if current.is_terminal() {
                return Ok(current);
            }

            session_failures += 1;
            tracing::warn!(
                run_id = %self.run_id,
                attempt = session_failures,
                error = %err,
                "browser session error"
            );
            if session_failures < retry.session_attempts {
                sleep(retry.backoff_for(session_failures - 1)).await;
                continue;
            }

            if restarts >= retry.max_restarts {
                return self
                    .fail(
                        RunFailure::new(
                            ErrorKind::Session,
                            format!("browser session unrecoverable: {err}"),
                            "check that the browser can start with this profile, then start a new run",
                        ),
                        None,
                    )
                    .await;
            }
            restarts += 1;
            session_failures = 0;

            let outcome = match self.escalate_restart().await {
                Ok(outcome) => outcome,
                Err(err) => return self.fail_with(&err).await,
            };
            match outcome {
                RestartOutcome::Restarted | RestartOutcome::ResolvedByPeer => continue,
                RestartOutcome::Canceled => return self.load().await,
                RestartOutcome::TimedOut => {
                    return self
                        .needs_user(
                            NeedsUserReason::KillBrowserRequired,
                            "browser restart was not approved in time".to_owned(),
                            KILL_BROWSER_SUGGESTION,
                        )
                        .await;
                }
            }
        }
    }

    async fn escalate_restart(&self) -> Result<RestartOutcome, RuntimeError> {
        let config = &self.deps.config;
        let coordinator = RestartCoordinator::new(
            Arc::clone(&self.deps.ledger),
            Arc::clone(&self.deps.notifier),
            Arc::clone(&self.deps.driver),
        )
        .with_poll_interval(config.timeouts.restart_poll_interval)
        .with_wait_timeout(config.timeouts.approval_wait_timeout)
        .with_relaunch_timeout(config.timeouts.relaunch_timeout);
        let now = now_unix_millis();
        // A caller approval given on resume is consumed by the first wait after it.
        let approved_at = self.load().await?.restart_approved_at;
        if approved_at.is_some() {
            self.update(|record| {
                record.restart_approved_at = None;
                Ok(())
            })
            .await?;
        }
        let request = RestartRequest {
            run_id: self.run_id.clone(),
            profile: config.profile_scope(),
            wait_since: approved_at.map_or(now, |approved_at| approved_at.min(now)),
        };
        tracing::info!(run_id = %self.run_id, profile = %request.profile, "escalating to browser restart");

        coordinator
            .await_restart(&request, || {
                let store = Arc::clone(&self.deps.store);
                let run_id = self.run_id.clone();
                let heartbeat = self.heartbeat.clone();
                async move {
                    if let Some(lock) = heartbeat {
                        let _ = lock.refresh();
                    }
                    tokio::task::spawn_blocking(move || {
                        store.get(&run_id).map(|record| record.is_terminal())
                    })
                    .await
                    .map(|result| result.unwrap_or(false))
                    .unwrap_or(false)
                }
            })
            .await
    }

    /// `pending|needs_user|running -> running`, stamping this worker's pid.
    async fn enter_running(&self) -> Result<RunRecord, RuntimeError> {
        let record = self.load().await?;
        if record.is_terminal() {
            return Ok(record);
        }
        let pid = std::process::id();
        self.update(move |record| {
            record.state = RunState::Running;
            record.error = None;
            record.needs_user_reason = None;
            record.worker_pid = Some(pid);
            Ok(())
        })
        .await
    }

    async fn fail_timeout(&self) -> Result<RunRecord, RuntimeError> {
        let timeout = self.deps.config.timeouts.run_timeout;
        self.fail(
            RunFailure::new(
                ErrorKind::Timeout,
                format!("run exceeded {timeout:?}"),
                "raise the run timeout or split the prompt, then start a new run",
            ),
            None,
        )
        .await
    }

    async fn fail_with(&self, err: &RuntimeError) -> Result<RunRecord, RuntimeError> {
        let suggestion = match err.kind() {
            ErrorKind::Input => "fix the prompt or its file references, then start a new run",
            _ => "inspect the worker logs, then start a new run",
        };
        self.fail(RunFailure::new(err.kind(), err.to_string(), suggestion), None)
            .await
    }

    /// `-> failed`. `partial` keeps the latest visible text on the record.
    pub(crate) async fn fail(
        &self,
        failure: RunFailure,
        partial: Option<(String, String)>,
    ) -> Result<RunRecord, RuntimeError> {
        tracing::warn!(
            run_id = %self.run_id,
            kind = ?failure.kind,
            message = %failure.message,
            "run failed"
        );
        self.update(move |record| {
            record.state = RunState::Failed;
            record.error = Some(failure.clone());
            record.needs_user_reason = None;
            record.worker_pid = None;
            if let Some((response, reasoning)) = &partial {
                if !response.is_empty() {
                    record.response_text = response.clone();
                }
                if !reasoning.is_empty() {
                    record.reasoning_text = reasoning.clone();
                }
            }
            Ok(())
        })
        .await
    }

    /// `running -> needs_user`. The worker exits afterwards; `resume` starts a new one.
    pub(crate) async fn needs_user(
        &self,
        reason: NeedsUserReason,
        message: String,
        suggestion: &'static str,
    ) -> Result<RunRecord, RuntimeError> {
        tracing::info!(run_id = %self.run_id, reason = ?reason, "run needs user action");
        self.update(move |record| {
            record.state = RunState::NeedsUser;
            record.needs_user_reason = Some(reason);
            record.error = Some(RunFailure::new(
                ErrorKind::NeedsUser,
                message.clone(),
                suggestion,
            ));
            record.worker_pid = None;
            Ok(())
        })
        .await
    }

    pub(crate) async fn needs_user_for(
        &self,
        reason: NeedsUserReason,
    ) -> Result<RunRecord, RuntimeError> {
        match reason {
            NeedsUserReason::Login => {
                self.needs_user(reason, "chat service requires login".to_owned(), LOGIN_SUGGESTION)
                    .await
            }
            NeedsUserReason::Challenge => {
                self.needs_user(
                    reason,
                    "chat service shows a verification challenge".to_owned(),
                    CHALLENGE_SUGGESTION,
                )
                .await
            }
            NeedsUserReason::KillBrowserRequired => {
                self.needs_user(
                    reason,
                    "browser must be restarted".to_owned(),
                    KILL_BROWSER_SUGGESTION,
                )
                .await
            }
        }
    }

    /// Record a completed turn; the run completes with its last turn.
    pub(crate) async fn complete_turn(
        &self,
        turn_index: usize,
        response_text: String,
        reasoning_text: String,
        conversation_ref: Option<String>,
    ) -> Result<RunRecord, RuntimeError> {
        let record = self
            .update(move |record| {
                // A retried poll may observe the same completion twice.
                if record.turns.len() == turn_index && turn_index < record.prompt_count() {
                    let prompt = record.prompt_at(turn_index).unwrap_or_default().to_owned();
                    record.turns.push(TurnRecord {
                        prompt,
                        response_text: response_text.clone(),
                        reasoning_text: reasoning_text.clone(),
                        completed_at: now_unix_millis(),
                    });
                    record.response_text = response_text.clone();
                    record.reasoning_text = reasoning_text.clone();
                    record.baseline_turns = None;
                }
                if conversation_ref.is_some() {
                    record.conversation_ref = conversation_ref.clone();
                }
                if record.turns.len() >= record.prompt_count() {
                    record.state = RunState::Completed;
                    record.error = None;
                    record.needs_user_reason = None;
                    record.worker_pid = None;
                }
                Ok(())
            })
            .await?;

        if record.state == RunState::Completed {
            self.write_artifacts(&record).await?;
            tracing::info!(run_id = %self.run_id, turns = record.turns.len(), "run completed");
        } else if !record.is_terminal() {
            tracing::debug!(run_id = %self.run_id, turn = turn_index, "turn completed");
        }
        Ok(record)
    }

    async fn write_artifacts(&self, record: &RunRecord) -> Result<(), RuntimeError> {
        let run_id = self.run_id.clone();
        let response = record.response_text.clone();
        let reasoning = record.reasoning_text.clone();
        self.store_io(move |store| {
            store.write_artifact(&run_id, RESPONSE_ARTIFACT, &response)?;
            if !reasoning.is_empty() {
                store.write_artifact(&run_id, REASONING_ARTIFACT, &reasoning)?;
            }
            Ok(())
        })
        .await
    }

    pub(crate) async fn load(&self) -> Result<RunRecord, RuntimeError> {
        let run_id = self.run_id.clone();
        let record = self.store_io(move |store| store.get(&run_id)).await?;
        self.last_seen.store(Some(Arc::new(record.clone())));
        Ok(record)
    }

    /// Locked read-modify-write. When the stored record already went terminal (cancel), the
    /// mutation is dropped and the terminal record is returned instead.
    pub(crate) async fn update<F>(&self, mutate: F) -> Result<RunRecord, RuntimeError>
    where
        F: FnMut(&mut RunRecord) -> Result<(), StoreErr> + Send + 'static,
    {
        let run_id = self.run_id.clone();
        let result = self
            .store_io(move |store| {
                let mut mutate = mutate;
                store.update(&run_id, &mut mutate)
            })
            .await;
        match result {
            Ok(record) => {
                self.last_seen.store(Some(Arc::new(record.clone())));
                Ok(record)
            }
            Err(RuntimeError::TerminalConflict { .. }) => self.load().await,
            Err(err) => Err(err),
        }
    }

    pub(crate) fn refresh_heartbeat(&self) {
        if let Some(lock) = &self.heartbeat {
            if let Err(err) = lock.refresh() {
                tracing::warn!(run_id = %self.run_id, error = %err, "worker heartbeat failed");
            }
        }
    }

    async fn store_io<T: Send + 'static>(
        &self,
        op: impl FnOnce(&dyn RunStore) -> Result<T, StoreErr> + Send + 'static,
    ) -> Result<T, RuntimeError> {
        let store = Arc::clone(&self.deps.store);
        let joined = tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| RuntimeError::Store(format!("store worker join failed: {err}")))?;
        joined.map_err(RuntimeError::from)
    }
}
