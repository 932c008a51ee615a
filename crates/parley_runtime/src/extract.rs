//! Response extraction: classify live page state into discrete lifecycle signals.
//!
//! The remote UI exposes no completion event. While a reply streams it shows a "stop"
//! control; a successful reply ends with a "copy" affordance on the new turn. The poller
//! evaluates one snapshot script per tick and feeds the result through the pure `classify`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{timeout, Instant};

use crate::browser::{BrowserDriver, SessionHandle};
use crate::config::UiSelectors;
use crate::errors::SessionError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSignal {
    NotReady,
    NeedsLogin,
    NeedsChallenge,
    Streaming,
    Completed,
    FailedNoOutput,
    FailedWithText,
    Stalled,
}

impl ExtractionSignal {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::FailedNoOutput | Self::FailedWithText)
    }
}

/// Point-in-time view of the chat page returned by `snapshot_script`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DomSnapshot {
    pub login_wall: bool,
    pub challenge: bool,
    pub stop_visible: bool,
    /// Copy affordance visible on the latest assistant turn.
    pub copy_visible: bool,
    pub composer_present: bool,
    pub assistant_turns: usize,
    pub response_text: String,
    pub reasoning_text: String,
    pub conversation_ref: Option<String>,
}

impl DomSnapshot {
    /// Page is usable for submitting a prompt.
    pub fn is_ready(&self) -> bool {
        self.composer_present && !self.login_wall && !self.challenge
    }

    fn text_len(&self) -> usize {
        self.response_text.chars().count() + self.reasoning_text.chars().count()
    }
}

/// Pure classifier over one snapshot. First match wins:
/// blockers, then the stop control, then the new-turn check, then the copy affordance.
/// `baseline_turns` is the assistant-turn count observed right before submission; a page
/// that has not grown a new turn yet is `NotReady`, never a failure.
/// Allocation: none. Complexity: O(n), n = response text length (emptiness check).
pub fn classify(snapshot: &DomSnapshot, baseline_turns: Option<usize>) -> ExtractionSignal {
    if snapshot.login_wall {
        return ExtractionSignal::NeedsLogin;
    }
    if snapshot.challenge {
        return ExtractionSignal::NeedsChallenge;
    }
    if snapshot.stop_visible {
        return ExtractionSignal::Streaming;
    }
    if snapshot.assistant_turns <= baseline_turns.unwrap_or(0) {
        return ExtractionSignal::NotReady;
    }
    if snapshot.copy_visible {
        return ExtractionSignal::Completed;
    }
    if snapshot.response_text.trim().is_empty() {
        ExtractionSignal::FailedNoOutput
    } else {
        ExtractionSignal::FailedWithText
    }
}

/// Build the snapshot script for `selectors`.
/// Allocation: one String. Complexity: O(s), s = total selector length.
pub fn snapshot_script(selectors: &UiSelectors) -> String {
    let config = json!({
        "composer": selectors.composer,
        "stop": selectors.stop_button,
        "copy": selectors.copy_button,
        "turn": selectors.assistant_turn,
        "container": selectors.turn_container,
        "body": selectors.response_body,
        "reasoning": selectors.reasoning,
        "login": selectors.login_markers,
        "challenge": selectors.challenge_markers,
    });
    format!(
        r#"(() => {{
  const sel = {config};
  const visible = (el) => !!el && !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);
  const any = (list) => list.some((s) => visible(document.querySelector(s)));
  const turns = Array.from(document.querySelectorAll(sel.turn));
  const last = turns.length ? turns[turns.length - 1] : null;
  const scope = last ? ((sel.container && last.closest(sel.container)) || last) : null;
  const body = last ? (last.querySelector(sel.body) || last) : null;
  const reasoning = scope ? scope.querySelector(sel.reasoning) : null;
  const match = location.pathname.match(/\/c\/([^/?#]+)/);
  return {{
    loginWall: any(sel.login),
    challenge: any(sel.challenge),
    stopVisible: visible(document.querySelector(sel.stop)),
    copyVisible: !!scope && visible(scope.querySelector(sel.copy)),
    composerPresent: !!document.querySelector(sel.composer),
    assistantTurns: turns.length,
    responseText: body ? (body.innerText || '') : '',
    reasoningText: reasoning ? (reasoning.innerText || '') : '',
    conversationRef: match ? match[1] : null
  }};
}})()"#
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub signal: ExtractionSignal,
    pub snapshot: DomSnapshot,
}

/// Stateful poller: `classify` plus the stall clock and the new-turn wait.
#[derive(Debug)]
pub struct ResponseExtractor {
    script: String,
    stall_timeout: Duration,
    dom_op_timeout: Duration,
    /// How long a submitted prompt may go without a new assistant turn.
    turn_wait: Duration,
    awaiting_since: Option<Instant>,
    streaming: bool,
    last_len: usize,
    last_growth: Instant,
}

impl ResponseExtractor {
    pub fn new(selectors: &UiSelectors, stall_timeout: Duration, dom_op_timeout: Duration) -> Self {
        Self {
            script: snapshot_script(selectors),
            stall_timeout,
            dom_op_timeout,
            turn_wait: stall_timeout,
            awaiting_since: None,
            streaming: false,
            last_len: 0,
            last_growth: Instant::now(),
        }
    }

    pub fn with_turn_wait(mut self, turn_wait: Duration) -> Self {
        self.turn_wait = turn_wait;
        self
    }

    /// Forget stall bookkeeping; called when a new turn is submitted.
    pub fn reset(&mut self) {
        self.awaiting_since = None;
        self.streaming = false;
        self.last_len = 0;
        self.last_growth = Instant::now();
    }

    /// Evaluate the snapshot script once, bounded by the DOM operation timeout.
    pub async fn snapshot(
        &self,
        driver: &dyn BrowserDriver,
        session: &SessionHandle,
    ) -> Result<DomSnapshot, SessionError> {
        let value = timeout(self.dom_op_timeout, driver.evaluate(session, &self.script))
            .await
            .map_err(|_| SessionError::Timeout("snapshot evaluation".to_owned()))??;
        serde_json::from_value(value)
            .map_err(|err| SessionError::Script(format!("snapshot payload invalid: {err}")))
    }

    pub async fn poll(
        &mut self,
        driver: &dyn BrowserDriver,
        session: &SessionHandle,
        baseline_turns: Option<usize>,
    ) -> Result<Observation, SessionError> {
        let snapshot = self.snapshot(driver, session).await?;
        let signal = self.observe(&snapshot, baseline_turns, Instant::now());
        Ok(Observation { signal, snapshot })
    }

    /// Fold one snapshot into the stall clock. `Streaming` whose text has not grown for
    /// `stall_timeout` becomes `Stalled`. `NotReady` that lasts `turn_wait` becomes
    /// `FailedNoOutput`. Every other signal passes through and stops both clocks.
    pub fn observe(
        &mut self,
        snapshot: &DomSnapshot,
        baseline_turns: Option<usize>,
        now: Instant,
    ) -> ExtractionSignal {
        let signal = classify(snapshot, baseline_turns);
        if signal == ExtractionSignal::NotReady {
            self.streaming = false;
            let since = *self.awaiting_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.turn_wait {
                return ExtractionSignal::FailedNoOutput;
            }
            return signal;
        }
        self.awaiting_since = None;
        if signal != ExtractionSignal::Streaming {
            self.streaming = false;
            return signal;
        }

        let len = snapshot.text_len();
        if !self.streaming || len > self.last_len {
            self.streaming = true;
            self.last_len = len;
            self.last_growth = now;
            return ExtractionSignal::Streaming;
        }
        if now.saturating_duration_since(self.last_growth) >= self.stall_timeout {
            return ExtractionSignal::Stalled;
        }
        ExtractionSignal::Streaming
    }
}

#[cfg(test)]
mod tests;
