//! Public facade for the parley workspace.
//! Default path: use `Client` from this crate. Use `parley::runtime` to embed or customize
//! the worker, `parley::store` for direct access to persisted runs.

mod client;

pub use client::{
    Client, ClientConfig, ClientError, ResumeOptions, StartRequest, WatchOptions, RUN_ID_PREFIX,
};
pub use parley_runtime::{
    run_worker, worker_run_id_from_args, BrowserDriver, CommandNotifier, Decision,
    ExtractionSignal, FallbackNotifier, Notifier, ProcessLauncher, PromptResolver, RuntimeConfig,
    RuntimeError, ScriptedBrowser, StaticNotifier, TaskLauncher, WorkerDeps, WorkerLauncher,
};
pub use parley_store::{
    ErrorKind, NeedsUserReason, RunFailure, RunRecord, RunState, TurnRecord, REASONING_ARTIFACT,
    RESPONSE_ARTIFACT,
};

pub use parley_runtime as runtime;
pub use parley_store as store;
