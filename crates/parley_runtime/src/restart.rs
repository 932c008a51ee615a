//! Restart approval protocol.
//!
//! Killing the browser is disruptive to every run sharing its profile, so a restart needs
//! a human approval and at most one performer. Every worker whose session died waits here;
//! the shared `RestartLedger` carries approval/done records and the two locks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_store::{now_unix_millis, ApprovalRecord, DoneRecord, ExclusiveLock, RestartLedger};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use crate::browser::BrowserDriver;
use crate::errors::{RuntimeError, SessionError};
use crate::notify::{ConfirmRequest, Decision, Notifier};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartRequest {
    pub run_id: String,
    pub profile: String,
    /// Unix ms when this wait began; older ledger records never satisfy it.
    pub wait_since: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestartOutcome {
    /// This process relaunched the browser.
    Restarted,
    ResolvedByPeer,
    Canceled,
    TimedOut,
}

impl RestartOutcome {
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Restarted | Self::ResolvedByPeer)
    }
}

enum Perform {
    Performed,
    PeerDone,
    Busy,
    Canceled,
}

enum Asked {
    Decided(Decision),
    /// Ledger changed while the question was open; re-evaluate from the top.
    Interrupted,
    Canceled,
    TimedOut,
}

#[derive(Clone)]
pub struct RestartCoordinator {
    ledger: Arc<dyn RestartLedger>,
    notifier: Arc<dyn Notifier>,
    driver: Arc<dyn BrowserDriver>,
    poll_interval: Duration,
    wait_timeout: Duration,
    relaunch_timeout: Duration,
}

impl RestartCoordinator {
    pub fn new(
        ledger: Arc<dyn RestartLedger>,
        notifier: Arc<dyn Notifier>,
        driver: Arc<dyn BrowserDriver>,
    ) -> Self {
        Self {
            ledger,
            notifier,
            driver,
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(10 * 60),
            relaunch_timeout: Duration::from_secs(2 * 60),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_relaunch_timeout(mut self, relaunch_timeout: Duration) -> Self {
        self.relaunch_timeout = relaunch_timeout;
        self
    }

    /// Wait until the browser for `request.profile` has been restarted by anyone, the caller
    /// cancels, or the approval wait times out.
    /// `should_cancel` is polled once per iteration, including while a notification is open
    /// and while a relaunch is in flight.
    /// Side effects: may post one notification, write ledger records, relaunch the browser.
    pub async fn await_restart<C, F>(
        &self,
        request: &RestartRequest,
        mut should_cancel: C,
    ) -> Result<RestartOutcome, RuntimeError>
    where
        C: FnMut() -> F,
        F: Future<Output = bool>,
    {
        let deadline = Instant::now() + self.wait_timeout;
        let notify = self.ledger.notify_lock();
        let outcome = self
            .wait_loop(request, deadline, notify.as_ref(), &mut should_cancel)
            .await;
        if let Err(err) = notify.release() {
            tracing::warn!(run_id = %request.run_id, error = %err, "notify lock release failed");
        }
        match &outcome {
            Ok(outcome) => {
                tracing::info!(run_id = %request.run_id, outcome = ?outcome, "restart wait finished")
            }
            Err(err) => tracing::warn!(run_id = %request.run_id, error = %err, "restart wait failed"),
        }
        outcome
    }

    async fn wait_loop<C, F>(
        &self,
        request: &RestartRequest,
        deadline: Instant,
        notify: &dyn ExclusiveLock,
        should_cancel: &mut C,
    ) -> Result<RestartOutcome, RuntimeError>
    where
        C: FnMut() -> F,
        F: Future<Output = bool>,
    {
        let mut notified = false;
        loop {
            if should_cancel().await {
                return Ok(RestartOutcome::Canceled);
            }
            if self.fresh_done(request.wait_since)? {
                return Ok(RestartOutcome::ResolvedByPeer);
            }

            if let Some(approval) = self.fresh_approval(request.wait_since)? {
                match self
                    .try_perform(request, approval.approved_at, should_cancel)
                    .await?
                {
                    Perform::Performed => return Ok(RestartOutcome::Restarted),
                    Perform::PeerDone => return Ok(RestartOutcome::ResolvedByPeer),
                    Perform::Canceled => return Ok(RestartOutcome::Canceled),
                    Perform::Busy => {}
                }
            } else if !notified && notify.try_acquire()? {
                notified = true;
                match self.ask(request, deadline, notify, should_cancel).await {
                    Asked::Decided(Decision::Approved) => {
                        let approved_at = now_unix_millis();
                        self.ledger.write_approval(&ApprovalRecord {
                            approved_at,
                            approved_by: Some(request.run_id.clone()),
                        })?;
                        notify.release()?;
                        match self.try_perform(request, approved_at, should_cancel).await? {
                            Perform::Performed => return Ok(RestartOutcome::Restarted),
                            Perform::PeerDone => return Ok(RestartOutcome::ResolvedByPeer),
                            Perform::Canceled => return Ok(RestartOutcome::Canceled),
                            Perform::Busy => {}
                        }
                    }
                    Asked::Decided(Decision::Denied) => {
                        tracing::warn!(run_id = %request.run_id, "browser restart denied");
                        notify.release()?;
                    }
                    Asked::Interrupted => {
                        notify.release()?;
                        continue;
                    }
                    Asked::Canceled => return Ok(RestartOutcome::Canceled),
                    Asked::TimedOut => return Ok(RestartOutcome::TimedOut),
                }
            }

            if Instant::now() >= deadline {
                return Ok(RestartOutcome::TimedOut);
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Post the confirmation and wait for the answer while still honoring cancel, the
    /// deadline and peer progress. Notifier errors count as a denial.
    async fn ask<C, F>(
        &self,
        request: &RestartRequest,
        deadline: Instant,
        notify: &dyn ExclusiveLock,
        should_cancel: &mut C,
    ) -> Asked
    where
        C: FnMut() -> F,
        F: Future<Output = bool>,
    {
        let confirm_request = ConfirmRequest::browser_restart(&request.run_id, &request.profile);
        tracing::info!(run_id = %request.run_id, "requesting browser restart approval");
        let confirm = self.notifier.confirm(&confirm_request);
        tokio::pin!(confirm);

        loop {
            tokio::select! {
                decision = &mut confirm => {
                    return Asked::Decided(decision.unwrap_or_else(|err| {
                        tracing::warn!(run_id = %request.run_id, error = %err, "notifier failed");
                        Decision::Denied
                    }));
                }
                _ = sleep(self.poll_interval) => {
                    if should_cancel().await {
                        return Asked::Canceled;
                    }
                    if Instant::now() >= deadline {
                        return Asked::TimedOut;
                    }
                    let progressed = matches!(self.fresh_done(request.wait_since), Ok(true))
                        || matches!(self.fresh_approval(request.wait_since), Ok(Some(_)));
                    if progressed {
                        return Asked::Interrupted;
                    }
                    if let Err(err) = notify.refresh() {
                        tracing::warn!(run_id = %request.run_id, error = %err, "notify lock refresh failed");
                    }
                }
            }
        }
    }

    async fn try_perform<C, F>(
        &self,
        request: &RestartRequest,
        approved_at: i64,
        should_cancel: &mut C,
    ) -> Result<Perform, RuntimeError>
    where
        C: FnMut() -> F,
        F: Future<Output = bool>,
    {
        let lock = self.ledger.performer_lock();
        if !lock.try_acquire()? {
            return Ok(Perform::Busy);
        }
        let result = self
            .perform_locked(request, approved_at, lock.as_ref(), should_cancel)
            .await;
        if let Err(err) = lock.release() {
            tracing::warn!(run_id = %request.run_id, error = %err, "performer lock release failed");
        }
        result
    }

    async fn perform_locked<C, F>(
        &self,
        request: &RestartRequest,
        approved_at: i64,
        lock: &dyn ExclusiveLock,
        should_cancel: &mut C,
    ) -> Result<Perform, RuntimeError>
    where
        C: FnMut() -> F,
        F: Future<Output = bool>,
    {
        // A peer may have finished between our ledger read and taking the lock.
        if self.fresh_done(request.wait_since)? {
            return Ok(Perform::PeerDone);
        }
        tracing::info!(run_id = %request.run_id, profile = %request.profile, "relaunching browser");
        let relaunch_deadline = Instant::now() + self.relaunch_timeout;
        let relaunch = self.driver.relaunch(&request.profile);
        tokio::pin!(relaunch);
        loop {
            tokio::select! {
                relaunched = &mut relaunch => {
                    relaunched?;
                    break;
                }
                _ = sleep(self.poll_interval) => {
                    if should_cancel().await {
                        tracing::warn!(run_id = %request.run_id, "relaunch abandoned after cancel");
                        return Ok(Perform::Canceled);
                    }
                    if Instant::now() >= relaunch_deadline {
                        return Err(SessionError::Timeout(format!(
                            "browser relaunch exceeded {:?}",
                            self.relaunch_timeout
                        ))
                        .into());
                    }
                    if let Err(err) = lock.refresh() {
                        tracing::warn!(run_id = %request.run_id, error = %err, "performer lock refresh failed");
                    }
                }
            }
        }
        self.ledger.write_done(&DoneRecord {
            done_at: now_unix_millis(),
            approved_at: Some(approved_at),
        })?;
        self.ledger.clear_approval()?;
        Ok(Perform::Performed)
    }

    fn fresh_done(&self, wait_since: i64) -> Result<bool, RuntimeError> {
        Ok(self
            .ledger
            .read_done()?
            .is_some_and(|done| done.is_fresh(wait_since)))
    }

    fn fresh_approval(&self, wait_since: i64) -> Result<Option<ApprovalRecord>, RuntimeError> {
        Ok(self
            .ledger
            .read_approval()?
            .filter(|approval| approval.is_fresh(wait_since)))
    }
}

#[cfg(test)]
mod tests;
