use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::HOME_ENV;
use crate::errors::RuntimeError;
use crate::worker::{run_worker, WorkerDeps, RUN_ID_FLAG};

pub type LaunchFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Starts a worker for a run and returns without waiting for it.
pub trait WorkerLauncher: Send + Sync {
    fn launch<'a>(&'a self, run_id: &'a str) -> LaunchFuture<'a, Result<(), RuntimeError>>;
}

/// Spawns `<program> <args...> --run-id <id>` as a detached OS process.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    home: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, home: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            home: home.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Full worker command line, program first.
    pub fn command_line(&self, run_id: &str) -> Vec<String> {
        let mut line = Vec::with_capacity(self.args.len() + 3);
        line.push(self.program.to_string_lossy().into_owned());
        line.extend(self.args.iter().cloned());
        line.push(RUN_ID_FLAG.to_owned());
        line.push(run_id.to_owned());
        line
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch<'a>(&'a self, run_id: &'a str) -> LaunchFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            let mut command = Command::new(&self.program);
            command
                .args(&self.args)
                .arg(RUN_ID_FLAG)
                .arg(run_id)
                .env(HOME_ENV, &self.home)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            #[cfg(unix)]
            command.process_group(0);

            let child = command.spawn().map_err(|err| {
                RuntimeError::Launch(format!("spawn {} failed: {err}", self.program.display()))
            })?;
            tracing::info!(run_id = %run_id, pid = ?child.id(), "worker process launched");
            Ok(())
        })
    }
}

/// Runs workers as Tokio tasks inside the calling process.
#[derive(Clone)]
pub struct TaskLauncher {
    deps: WorkerDeps,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskLauncher {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn deps(&self) -> &WorkerDeps {
        &self.deps
    }

    /// Await every worker launched so far.
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = match self.tasks.lock() {
                Ok(mut tasks) => tasks.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            };
            if pending.is_empty() {
                return;
            }
            for task in pending {
                let _ = task.await;
            }
        }
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch<'a>(&'a self, run_id: &'a str) -> LaunchFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            let deps = self.deps.clone();
            let run_id = run_id.to_owned();
            let task = tokio::spawn(async move {
                if let Err(err) = run_worker(deps, &run_id).await {
                    tracing::warn!(run_id = %run_id, error = %err, "worker task ended with error");
                }
            });
            match self.tasks.lock() {
                Ok(mut tasks) => tasks.push(task),
                Err(poisoned) => poisoned.into_inner().push(task),
            }
            Ok(())
        })
    }
}
