//! Scripted in-memory browser for tests and dry runs.
//!
//! The page shows an idle snapshot until the first send click. Each send click starts the
//! next per-submission sequence; every evaluation advances one step and the last step repeats.
//! A page registered for a URL replaces all of that while the session is parked on it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use crate::browser::{BrowserDriver, BrowserFuture, SessionHandle};
use crate::errors::SessionError;
use crate::extract::DomSnapshot;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScriptedCounters {
    pub opens: usize,
    pub relaunches: usize,
    pub navigations: Vec<String>,
    pub typed: Vec<String>,
    pub sends: usize,
    pub attachments: usize,
}

#[derive(Debug, Default)]
struct ScriptState {
    idle: DomSnapshot,
    pages: HashMap<String, DomSnapshot>,
    location: Option<String>,
    submissions: Vec<Vec<DomSnapshot>>,
    cursor: usize,
    failing_opens: u32,
    broken: bool,
    next_session: u64,
    counters: ScriptedCounters,
}

impl ScriptState {
    fn current(&mut self) -> DomSnapshot {
        if let Some(page) = self.location.as_ref().and_then(|url| self.pages.get(url)) {
            return page.clone();
        }
        if self.counters.sends == 0 {
            return self.idle.clone();
        }
        let Some(steps) = self
            .submissions
            .get(self.counters.sends - 1)
            .or_else(|| self.submissions.last())
        else {
            return self.idle.clone();
        };
        let Some(step) = steps.get(self.cursor.min(steps.len().saturating_sub(1))) else {
            return self.idle.clone();
        };
        self.cursor = self.cursor.saturating_add(1);
        step.clone()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScriptedBrowser {
    state: Arc<Mutex<ScriptState>>,
    relaunch_delay: Duration,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default().with_idle(Self::idle_page(0))
    }

    /// Ready chat page showing `turns` finished assistant turns.
    pub fn idle_page(turns: usize) -> DomSnapshot {
        DomSnapshot {
            composer_present: true,
            copy_visible: turns > 0,
            assistant_turns: turns,
            ..DomSnapshot::default()
        }
    }

    /// Reply for the `turn`-th submission (1-based): streams `text` in `streaming_polls`
    /// growing steps, then shows the copy affordance.
    pub fn streamed_reply(turn: usize, text: &str, streaming_polls: usize) -> Vec<DomSnapshot> {
        let chars: Vec<char> = text.chars().collect();
        let mut steps = Vec::with_capacity(streaming_polls + 1);
        for poll in 1..=streaming_polls {
            let cut = chars.len() * poll / (streaming_polls + 1);
            steps.push(DomSnapshot {
                stop_visible: true,
                composer_present: true,
                assistant_turns: turn,
                response_text: chars[..cut].iter().collect(),
                conversation_ref: Some("conv-1".to_owned()),
                ..DomSnapshot::default()
            });
        }
        steps.push(DomSnapshot {
            copy_visible: true,
            composer_present: true,
            assistant_turns: turn,
            response_text: text.to_owned(),
            conversation_ref: Some("conv-1".to_owned()),
            ..DomSnapshot::default()
        });
        steps
    }

    pub fn with_idle(self, idle: DomSnapshot) -> Self {
        self.lock().idle = idle;
        self
    }

    /// Fixed page served whenever the session is navigated to `url`.
    pub fn with_page(self, url: impl Into<String>, page: DomSnapshot) -> Self {
        self.set_page(url, page);
        self
    }

    pub fn with_submission(self, steps: Vec<DomSnapshot>) -> Self {
        self.lock().submissions.push(steps);
        self
    }

    /// Next `count` opens fail with `Unreachable`.
    pub fn with_failing_opens(self, count: u32) -> Self {
        self.lock().failing_opens = count;
        self
    }

    pub fn with_relaunch_delay(mut self, delay: Duration) -> Self {
        self.relaunch_delay = delay;
        self
    }

    pub fn set_idle(&self, idle: DomSnapshot) {
        self.lock().idle = idle;
    }

    pub fn set_page(&self, url: impl Into<String>, page: DomSnapshot) {
        self.lock().pages.insert(url.into(), page);
    }

    /// Every operation fails until the next relaunch.
    pub fn break_session(&self) {
        self.lock().broken = true;
    }

    pub fn counters(&self) -> ScriptedCounters {
        self.lock().counters.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_alive(&self) -> Result<MutexGuard<'_, ScriptState>, SessionError> {
        let state = self.lock();
        if state.broken {
            return Err(SessionError::Detached("scripted browser is down".to_owned()));
        }
        Ok(state)
    }
}

impl BrowserDriver for ScriptedBrowser {
    fn open<'a>(&'a self, profile: &'a str)
        -> BrowserFuture<'a, Result<SessionHandle, SessionError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.counters.opens += 1;
            if state.broken {
                return Err(SessionError::Unreachable("scripted browser is down".to_owned()));
            }
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(SessionError::Unreachable("scripted open failure".to_owned()));
            }
            state.next_session += 1;
            Ok(SessionHandle {
                id: format!("page-{}", state.next_session),
                profile: profile.to_owned(),
            })
        })
    }

    fn navigate<'a>(
        &'a self,
        _session: &'a SessionHandle,
        url: &'a str,
    ) -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let mut state = self.check_alive()?;
            state.location = Some(url.to_owned());
            state.counters.navigations.push(url.to_owned());
            Ok(())
        })
    }

    fn evaluate<'a>(
        &'a self,
        _session: &'a SessionHandle,
        _script: &'a str,
    ) -> BrowserFuture<'a, Result<Value, SessionError>> {
        Box::pin(async move {
            let snapshot = self.check_alive()?.current();
            serde_json::to_value(snapshot).map_err(|err| SessionError::Script(err.to_string()))
        })
    }

    fn wait_for_selector<'a>(
        &'a self,
        _session: &'a SessionHandle,
        _selector: &'a str,
        _timeout: Duration,
    ) -> BrowserFuture<'a, Result<bool, SessionError>> {
        Box::pin(async move {
            self.check_alive()?;
            Ok(true)
        })
    }

    fn type_text<'a>(
        &'a self,
        _session: &'a SessionHandle,
        _selector: &'a str,
        text: &'a str,
    ) -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            self.check_alive()?.counters.typed.push(text.to_owned());
            Ok(())
        })
    }

    /// Every click is treated as the send button.
    fn click<'a>(
        &'a self,
        _session: &'a SessionHandle,
        _selector: &'a str,
    ) -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            let mut state = self.check_alive()?;
            state.counters.sends += 1;
            state.cursor = 0;
            state.location = None;
            Ok(())
        })
    }

    fn attach_files<'a>(
        &'a self,
        _session: &'a SessionHandle,
        _selector: &'a str,
        files: &'a [PathBuf],
    ) -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            self.check_alive()?.counters.attachments += files.len();
            Ok(())
        })
    }

    fn close<'a>(&'a self, _session: &'a SessionHandle)
        -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async { Ok(()) })
    }

    fn relaunch<'a>(&'a self, _profile: &'a str) -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            if !self.relaunch_delay.is_zero() {
                tokio::time::sleep(self.relaunch_delay).await;
            }
            let mut state = self.lock();
            state.counters.relaunches += 1;
            state.broken = false;
            state.failing_opens = 0;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn idle_until_send_then_steps_repeat_last() {
        let browser = ScriptedBrowser::new()
            .with_submission(ScriptedBrowser::streamed_reply(1, "Echo: Hello", 2));
        let session = browser.open("p").await.expect("open");
        let read = |value: Value| -> DomSnapshot { serde_json::from_value(value).expect("snapshot") };

        let idle = read(browser.evaluate(&session, "").await.expect("idle"));
        assert_eq!(idle.assistant_turns, 0);

        browser.click(&session, "send").await.expect("send");
        let first = read(browser.evaluate(&session, "").await.expect("step 1"));
        assert!(first.stop_visible);
        let _ = browser.evaluate(&session, "").await.expect("step 2");
        let done = read(browser.evaluate(&session, "").await.expect("step 3"));
        assert!(done.copy_visible);
        assert_eq!(done.response_text, "Echo: Hello");
        let again = read(browser.evaluate(&session, "").await.expect("repeat"));
        assert_eq!(again, done);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn broken_session_recovers_after_relaunch() {
        let browser = ScriptedBrowser::new().with_failing_opens(1);
        assert!(browser.open("p").await.is_err());
        let session = browser.open("p").await.expect("second open");

        browser.break_session();
        assert!(browser.evaluate(&session, "").await.is_err());
        assert!(browser.open("p").await.is_err());

        browser.relaunch("p").await.expect("relaunch");
        assert!(browser.evaluate(&session, "").await.is_ok());
        assert_eq!(browser.counters().relaunches, 1);
        assert_eq!(browser.counters().opens, 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn registered_page_is_served_for_its_url() {
        let answered = DomSnapshot {
            response_text: "stored answer".to_owned(),
            ..ScriptedBrowser::idle_page(1)
        };
        let browser = ScriptedBrowser::new().with_page("https://chat.test/c/conv-9", answered.clone());
        let session = browser.open("p").await.expect("open");
        let read = |value: Value| -> DomSnapshot { serde_json::from_value(value).expect("snapshot") };

        browser.navigate(&session, "https://chat.test/").await.expect("home");
        let home = read(browser.evaluate(&session, "").await.expect("home page"));
        assert_eq!(home.assistant_turns, 0);

        browser.navigate(&session, "https://chat.test/c/conv-9").await.expect("conversation");
        let page = read(browser.evaluate(&session, "").await.expect("conversation page"));
        assert_eq!(page, answered);
    }
}
