//! Worker entry point: one worker drives one run, guarded by the run's worker lock.

use std::sync::Arc;
use std::time::Duration;

use parley_store::{FsRestartLedger, FsRunStore, RestartLedger, RunRecord, RunStore};
use tokio::time::{sleep, Instant};

use crate::browser::{BrowserDriver, PassthroughResolver, PromptResolver};
use crate::config::RuntimeConfig;
use crate::errors::RuntimeError;
use crate::machine::RunMachine;
use crate::notify::Notifier;

/// Flag carrying the run id on a worker process command line.
pub const RUN_ID_FLAG: &str = "--run-id";

const WORKER_LOCK_WAIT: Duration = Duration::from_secs(2);
const WORKER_LOCK_RETRY: Duration = Duration::from_millis(50);

/// Everything a worker needs. Cheap to clone; shared by `TaskLauncher` across runs.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn RunStore>,
    pub driver: Arc<dyn BrowserDriver>,
    pub ledger: Arc<dyn RestartLedger>,
    pub notifier: Arc<dyn Notifier>,
    pub resolver: Arc<dyn PromptResolver>,
    pub config: RuntimeConfig,
}

impl WorkerDeps {
    /// Filesystem store and restart ledger under `config.home`, prompts passed through verbatim.
    pub fn from_config(
        config: RuntimeConfig,
        driver: Arc<dyn BrowserDriver>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let ledger = FsRestartLedger::new(
            &config.home,
            &config.profile_scope(),
            config.timeouts.restart_lock_stale_after,
        );
        Self {
            store: Arc::new(FsRunStore::new(&config.home)),
            driver,
            ledger: Arc::new(ledger),
            notifier,
            resolver: Arc::new(PassthroughResolver),
            config,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn PromptResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

/// Drive `run_id` to rest under its worker lock.
/// Fails with `WorkerActive` when another live worker already holds the lock.
/// Side effects: takes/releases `worker.lock`, browser automation, store writes.
pub async fn run_worker(deps: WorkerDeps, run_id: &str) -> Result<RunRecord, RuntimeError> {
    let lock = deps
        .store
        .worker_lock(run_id, deps.config.timeouts.worker_lock_stale_after);
    // A previous worker may still be on its way out right after a resume.
    let lock_deadline = Instant::now() + WORKER_LOCK_WAIT;
    while !lock.try_acquire()? {
        if Instant::now() >= lock_deadline {
            tracing::warn!(run_id = %run_id, "worker lock held by another worker");
            return Err(RuntimeError::WorkerActive(run_id.to_owned()));
        }
        sleep(WORKER_LOCK_RETRY).await;
    }

    let machine = RunMachine::new(deps, run_id).with_heartbeat(Arc::clone(&lock));
    let result = machine.drive().await;
    if let Err(err) = lock.release() {
        tracing::warn!(run_id = %run_id, error = %err, "worker lock release failed");
    }
    match &result {
        Ok(record) => tracing::info!(run_id = %run_id, state = %record.state, "worker finished"),
        Err(err) => tracing::warn!(run_id = %run_id, error = %err, "worker aborted"),
    }
    result
}

/// Extract the run id from worker process arguments (`--run-id <id>` or `--run-id=<id>`).
/// Allocation: one String. Complexity: O(n), n = argument count.
pub fn worker_run_id_from_args<I, S>(args: I) -> Result<String, RuntimeError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        if arg == RUN_ID_FLAG {
            return match args.next() {
                Some(value) if !value.as_ref().trim().is_empty() => {
                    Ok(value.as_ref().trim().to_owned())
                }
                _ => Err(RuntimeError::Input(format!("{RUN_ID_FLAG} needs a value"))),
            };
        }
        if let Some(value) = arg.strip_prefix(RUN_ID_FLAG).and_then(|v| v.strip_prefix('=')) {
            if value.trim().is_empty() {
                return Err(RuntimeError::Input(format!("{RUN_ID_FLAG} needs a value")));
            }
            return Ok(value.trim().to_owned());
        }
    }
    Err(RuntimeError::Input(format!("missing {RUN_ID_FLAG}")))
}
