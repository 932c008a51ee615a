use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::RuntimeError;

pub const HOME_ENV: &str = "PARLEY_HOME";
pub const PROFILE_DIR_ENV: &str = "PARLEY_PROFILE_DIR";
pub const BASE_URL_ENV: &str = "PARLEY_BASE_URL";
pub const RUN_TIMEOUT_ENV: &str = "PARLEY_RUN_TIMEOUT_SECS";
pub const STALL_TIMEOUT_ENV: &str = "PARLEY_STALL_TIMEOUT_SECS";

pub const DEFAULT_HOME_DIR_NAME: &str = ".parley";
pub const DEFAULT_BASE_URL: &str = "https://chatgpt.com/";

/// CSS selectors describing the remote chat UI.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UiSelectors {
    pub composer: String,
    pub send_button: String,
    pub stop_button: String,
    pub copy_button: String,
    pub assistant_turn: String,
    /// Container holding one turn and its action bar; empty means the turn element itself.
    pub turn_container: String,
    pub response_body: String,
    pub reasoning: String,
    pub file_input: String,
    pub login_markers: Vec<String>,
    pub challenge_markers: Vec<String>,
}

impl Default for UiSelectors {
    fn default() -> Self {
        Self {
            composer: "#prompt-textarea".to_owned(),
            send_button: "button[data-testid=\"send-button\"]".to_owned(),
            stop_button: "button[data-testid=\"stop-button\"]".to_owned(),
            copy_button: "button[data-testid=\"copy-turn-action-button\"]".to_owned(),
            assistant_turn: "[data-message-author-role=\"assistant\"]".to_owned(),
            turn_container: "article".to_owned(),
            response_body: ".markdown".to_owned(),
            reasoning: "[data-testid=\"reasoning-summary\"]".to_owned(),
            file_input: "input[type=\"file\"]".to_owned(),
            login_markers: vec![
                "button[data-testid=\"login-button\"]".to_owned(),
                "form[action*=\"/login\"]".to_owned(),
            ],
            challenge_markers: vec![
                "iframe[src*=\"challenges.cloudflare.com\"]".to_owned(),
                "#challenge-form".to_owned(),
                "#cf-challenge-running".to_owned(),
            ],
        }
    }
}

/// Three independent timeout layers plus the polling cadence of every wait loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub poll_interval: Duration,
    /// Bound on one DOM evaluation / browser operation.
    pub dom_op_timeout: Duration,
    /// Bound on reaching the ready condition after navigation, and on a new assistant turn
    /// showing up after a prompt is sent.
    pub ready_timeout: Duration,
    pub stall_timeout: Duration,
    /// Whole-run ceiling, measured from the start of the current worker attempt.
    pub run_timeout: Duration,
    pub approval_wait_timeout: Duration,
    /// Bound on one browser relaunch once a restart is approved.
    pub relaunch_timeout: Duration,
    pub restart_poll_interval: Duration,
    pub worker_lock_stale_after: Duration,
    pub restart_lock_stale_after: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(400),
            dom_op_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(45),
            stall_timeout: Duration::from_secs(5 * 60),
            run_timeout: Duration::from_secs(2 * 60 * 60),
            approval_wait_timeout: Duration::from_secs(10 * 60),
            relaunch_timeout: Duration::from_secs(2 * 60),
            restart_poll_interval: Duration::from_secs(1),
            worker_lock_stale_after: Duration::from_secs(60),
            restart_lock_stale_after: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub session_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failure classifications needed before a run is failed.
    pub failure_confirm_polls: u32,
    /// Browser restarts one worker attempt may go through before failing with `SESSION`.
    pub max_restarts: u32,
}

impl RetryPolicy {
    /// Delay before session attempt `attempt + 1`: the ceiling doubles from
    /// `base_backoff_ms` up to `max_backoff_ms`, and the delay lands in its upper half.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(32))
            .min(self.max_backoff_ms);
        let floor = ceiling / 2;
        let spread = ceiling - floor;
        if spread == 0 {
            return Duration::from_millis(ceiling);
        }
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u32(attempt);
        Duration::from_millis(floor + hasher.finish() % (spread + 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            session_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            failure_confirm_polls: 3,
            max_restarts: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Store root: `runs/` and `restart/` live below it.
    pub home: PathBuf,
    /// Browser profile directory; the restart coordination scope.
    pub profile_dir: PathBuf,
    pub base_url: String,
    pub selectors: UiSelectors,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

impl RuntimeConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            profile_dir: home.join("browser-profile"),
            home,
            base_url: DEFAULT_BASE_URL.to_owned(),
            selectors: UiSelectors::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Build config from process env, falling back to `$HOME/.parley`.
    /// Side effects: reads process env.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let home = match env_nonempty(HOME_ENV) {
            Some(home) => PathBuf::from(home),
            None => {
                let user_home = env_nonempty("HOME").ok_or_else(|| {
                    RuntimeError::Input(format!("neither {HOME_ENV} nor HOME is set"))
                })?;
                Path::new(&user_home).join(DEFAULT_HOME_DIR_NAME)
            }
        };

        let mut config = Self::new(home);
        if let Some(profile) = env_nonempty(PROFILE_DIR_ENV) {
            config.profile_dir = PathBuf::from(profile);
        }
        if let Some(base_url) = env_nonempty(BASE_URL_ENV) {
            config = config.with_base_url(base_url);
        }
        if let Some(secs) = env_secs(RUN_TIMEOUT_ENV)? {
            config.timeouts.run_timeout = secs;
        }
        if let Some(secs) = env_secs(STALL_TIMEOUT_ENV)? {
            config.timeouts.stall_timeout = secs;
        }
        Ok(config)
    }

    pub fn with_profile_dir(mut self, profile_dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = profile_dir.into();
        self
    }

    /// Override the chat UI origin. A trailing slash is enforced.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    pub fn with_selectors(mut self, selectors: UiSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Coordination scope string for the restart ledger.
    pub fn profile_scope(&self) -> String {
        self.profile_dir.to_string_lossy().into_owned()
    }

    /// Page to open for a run: the existing conversation, or a fresh chat.
    /// Allocation: one String. Complexity: O(url length).
    pub fn conversation_url(&self, conversation_ref: Option<&str>) -> String {
        match conversation_ref {
            Some(reference) => format!("{}c/{}", self.base_url, reference),
            None => self.base_url.clone(),
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn env_secs(name: &str) -> Result<Option<Duration>, RuntimeError> {
    let Some(raw) = env_nonempty(name) else {
        return Ok(None);
    };
    raw.parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|err| RuntimeError::Input(format!("{name}={raw}: {err}")))
}
