pub mod browser;
pub mod config;
pub mod errors;
pub mod extract;
pub mod launcher;
pub mod machine;
pub mod notify;
pub mod restart;
pub mod scripted;
pub mod worker;

pub use browser::{
    BrowserDriver, BrowserFuture, ExpandedPrompt, PassthroughResolver, PromptResolver,
    SessionHandle,
};
pub use config::{
    RetryPolicy, RuntimeConfig, Timeouts, UiSelectors, BASE_URL_ENV, DEFAULT_BASE_URL, HOME_ENV,
    PROFILE_DIR_ENV, RUN_TIMEOUT_ENV, STALL_TIMEOUT_ENV,
};
pub use errors::{NotifyError, RuntimeError, SessionError};
pub use extract::{
    classify, snapshot_script, DomSnapshot, ExtractionSignal, Observation, ResponseExtractor,
};
pub use launcher::{LaunchFuture, ProcessLauncher, TaskLauncher, WorkerLauncher};
pub use machine::RunMachine;
pub use notify::{
    CommandNotifier, ConfirmRequest, Decision, FallbackNotifier, Notifier, NotifyFuture,
    StaticNotifier,
};
pub use restart::{RestartCoordinator, RestartOutcome, RestartRequest};
pub use scripted::{ScriptedBrowser, ScriptedCounters};
pub use worker::{run_worker, worker_run_id_from_args, WorkerDeps, RUN_ID_FLAG};
