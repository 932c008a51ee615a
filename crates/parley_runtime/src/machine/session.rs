use std::future::Future;

use parley_store::{ErrorKind, NeedsUserReason, RunFailure, RunRecord};
use tokio::time::{sleep, timeout, Instant};

use super::{Interrupt, RunMachine};
use crate::browser::SessionHandle;
use crate::errors::SessionError;
use crate::extract::{DomSnapshot, ExtractionSignal, ResponseExtractor};

enum Readiness {
    Ready,
    Blocked(NeedsUserReason),
    /// The record went terminal while waiting.
    Stopped(RunRecord),
}

enum TurnEnd {
    Completed(DomSnapshot),
    Rested(RunRecord),
}

impl RunMachine {
    /// One session lifetime: open, navigate, submit what is outstanding and poll until the
    /// run rests. The page is closed whatever the outcome.
    pub(super) async fn attempt(&self, deadline: Instant) -> Result<RunRecord, Interrupt> {
        let config = &self.deps.config;
        let profile = config.profile_scope();
        let session = self
            .bounded("open browser", self.deps.driver.open(&profile))
            .await?;
        let result = self.run_session(&session, deadline).await;
        if let Err(err) = self
            .bounded("close page", self.deps.driver.close(&session))
            .await
        {
            tracing::debug!(run_id = %self.run_id, error = %err, "page close failed");
        }
        result
    }

    async fn run_session(
        &self,
        session: &SessionHandle,
        deadline: Instant,
    ) -> Result<RunRecord, Interrupt> {
        let config = &self.deps.config;
        let mut extractor = ResponseExtractor::new(
            &config.selectors,
            config.timeouts.stall_timeout,
            config.timeouts.dom_op_timeout,
        )
        .with_turn_wait(config.timeouts.ready_timeout);

        let record = self.load().await?;
        if record.is_terminal() {
            return Ok(record);
        }
        let url = config.conversation_url(record.conversation_ref.as_deref());
        self.bounded("navigate", self.deps.driver.navigate(session, &url))
            .await?;

        match self.await_ready(session, &extractor).await? {
            Readiness::Ready => {}
            Readiness::Blocked(reason) => return Ok(self.needs_user_for(reason).await?),
            Readiness::Stopped(record) => return Ok(record),
        }

        loop {
            let record = self.load().await?;
            if record.is_terminal() {
                return Ok(record);
            }
            let turn_index = record.turns.len();
            if turn_index >= record.prompt_count() {
                // Every turn is recorded but the run never got marked complete.
                return Ok(self
                    .complete_turn(
                        turn_index,
                        record.response_text.clone(),
                        record.reasoning_text.clone(),
                        None,
                    )
                    .await?);
            }

            let record = match record.awaiting_turn() {
                Some(_) => record,
                None => {
                    let record = self.submit(session, &extractor, &record, turn_index).await?;
                    if record.is_terminal() {
                        return Ok(record);
                    }
                    record
                }
            };

            extractor.reset();
            match self
                .poll_turn(session, &mut extractor, record.baseline_turns, deadline)
                .await?
            {
                TurnEnd::Rested(record) => return Ok(record),
                TurnEnd::Completed(snapshot) => {
                    let record = self
                        .complete_turn(
                            turn_index,
                            snapshot.response_text,
                            snapshot.reasoning_text,
                            snapshot.conversation_ref,
                        )
                        .await?;
                    if record.is_terminal() {
                        return Ok(record);
                    }
                }
            }
        }
    }

    /// Wait for the composer, surfacing login walls and challenges as soon as they show.
    async fn await_ready(
        &self,
        session: &SessionHandle,
        extractor: &ResponseExtractor,
    ) -> Result<Readiness, Interrupt> {
        let timeouts = self.deps.config.timeouts;
        let ready_deadline = Instant::now() + timeouts.ready_timeout;
        loop {
            let snapshot = extractor.snapshot(self.deps.driver.as_ref(), session).await?;
            if snapshot.login_wall {
                return Ok(Readiness::Blocked(NeedsUserReason::Login));
            }
            if snapshot.challenge {
                return Ok(Readiness::Blocked(NeedsUserReason::Challenge));
            }
            if snapshot.is_ready() {
                return Ok(Readiness::Ready);
            }
            if Instant::now() >= ready_deadline {
                return Err(Interrupt::Session(SessionError::Timeout(
                    "chat page never became ready".to_owned(),
                )));
            }
            let record = self.load().await?;
            if record.is_terminal() {
                return Ok(Readiness::Stopped(record));
            }
            sleep(timeouts.poll_interval).await;
        }
    }

    /// Hand prompt `turn_index` to the page. The submission is persisted only after the
    /// send click, so a crash in between resubmits at most this one prompt.
    async fn submit(
        &self,
        session: &SessionHandle,
        extractor: &ResponseExtractor,
        record: &RunRecord,
        turn_index: usize,
    ) -> Result<RunRecord, Interrupt> {
        let selectors = &self.deps.config.selectors;
        let dom_timeout = self.deps.config.timeouts.dom_op_timeout;
        let prompt = record.prompt_at(turn_index).unwrap_or_default();
        let expanded = self.deps.resolver.expand(prompt)?;

        let baseline = extractor
            .snapshot(self.deps.driver.as_ref(), session)
            .await?
            .assistant_turns;
        let composer_ready = self
            .bounded(
                "wait for composer",
                self.deps
                    .driver
                    .wait_for_selector(session, &selectors.composer, dom_timeout),
            )
            .await?;
        if !composer_ready {
            return Err(Interrupt::Session(SessionError::Timeout(
                "composer not found".to_owned(),
            )));
        }
        if !expanded.attachments.is_empty() {
            self.bounded(
                "attach files",
                self.deps
                    .driver
                    .attach_files(session, &selectors.file_input, &expanded.attachments),
            )
            .await?;
        }
        self.bounded(
            "type prompt",
            self.deps
                .driver
                .type_text(session, &selectors.composer, &expanded.text),
        )
        .await?;
        self.bounded(
            "send prompt",
            self.deps.driver.click(session, &selectors.send_button),
        )
        .await?;

        tracing::debug!(run_id = %self.run_id, turn = turn_index, baseline, "prompt submitted");
        Ok(self
            .update(move |record| {
                record.turns_submitted = record.turns_submitted.max(turn_index + 1);
                record.baseline_turns = Some(baseline);
                Ok(())
            })
            .await?)
    }

    /// Poll the outstanding turn until it completes or the run rests elsewhere.
    async fn poll_turn(
        &self,
        session: &SessionHandle,
        extractor: &mut ResponseExtractor,
        baseline_turns: Option<usize>,
        deadline: Instant,
    ) -> Result<TurnEnd, Interrupt> {
        let config = &self.deps.config;
        let confirm_polls = config.retry.failure_confirm_polls.max(1);
        let mut failures = 0u32;
        let mut shown = (String::new(), String::new());

        loop {
            self.refresh_heartbeat();
            let record = self.load().await?;
            if record.is_terminal() {
                return Ok(TurnEnd::Rested(record));
            }
            if Instant::now() >= deadline {
                return Ok(TurnEnd::Rested(
                    self.fail(
                        RunFailure::new(
                            ErrorKind::Timeout,
                            format!("run exceeded {:?}", config.timeouts.run_timeout),
                            "raise the run timeout or split the prompt, then start a new run",
                        ),
                        Some((record.response_text.clone(), record.reasoning_text.clone())),
                    )
                    .await?,
                ));
            }

            let observation = extractor
                .poll(self.deps.driver.as_ref(), session, baseline_turns)
                .await?;
            let snapshot = observation.snapshot;
            let partial = || (snapshot.response_text.clone(), snapshot.reasoning_text.clone());

            match observation.signal {
                ExtractionSignal::NotReady => failures = 0,
                ExtractionSignal::Streaming => {
                    failures = 0;
                    // The reference shows up once the page has a conversation URL; keep it
                    // so a lost session reopens this conversation instead of a blank chat.
                    let new_ref = snapshot
                        .conversation_ref
                        .clone()
                        .filter(|found| record.conversation_ref.as_deref() != Some(found.as_str()));
                    if partial() != shown || new_ref.is_some() {
                        shown = partial();
                        let (response, reasoning) = partial();
                        let record = self
                            .update(move |record| {
                                record.response_text = response.clone();
                                record.reasoning_text = reasoning.clone();
                                if let Some(found) = &new_ref {
                                    record.conversation_ref = Some(found.clone());
                                }
                                Ok(())
                            })
                            .await?;
                        if record.is_terminal() {
                            return Ok(TurnEnd::Rested(record));
                        }
                    }
                }
                ExtractionSignal::Completed => return Ok(TurnEnd::Completed(snapshot)),
                ExtractionSignal::NeedsLogin => {
                    return Ok(TurnEnd::Rested(
                        self.needs_user_for(NeedsUserReason::Login).await?,
                    ));
                }
                ExtractionSignal::NeedsChallenge => {
                    return Ok(TurnEnd::Rested(
                        self.needs_user_for(NeedsUserReason::Challenge).await?,
                    ));
                }
                ExtractionSignal::Stalled => {
                    let failure = RunFailure::new(
                        ErrorKind::Timeout,
                        format!(
                            "response stopped growing for {:?}",
                            config.timeouts.stall_timeout
                        ),
                        "check the conversation in the browser, then start a new run",
                    );
                    return Ok(TurnEnd::Rested(self.fail(failure, Some(partial())).await?));
                }
                ExtractionSignal::FailedNoOutput | ExtractionSignal::FailedWithText => {
                    failures += 1;
                    tracing::debug!(
                        run_id = %self.run_id,
                        signal = ?observation.signal,
                        failures,
                        "reply shows neither stop nor copy control"
                    );
                    if failures >= confirm_polls {
                        let message = if observation.signal == ExtractionSignal::FailedWithText {
                            "reply ended without completion marker; partial text kept"
                        } else if snapshot.assistant_turns <= baseline_turns.unwrap_or(0) {
                            "no reply appeared after the prompt was sent"
                        } else {
                            "reply ended without any output"
                        };
                        let failure = RunFailure::new(
                            ErrorKind::BrowserFailure,
                            message,
                            "retry the prompt with a new run",
                        );
                        return Ok(TurnEnd::Rested(self.fail(failure, Some(partial())).await?));
                    }
                }
            }

            sleep(config.timeouts.poll_interval).await;
        }
    }

    /// Bound one browser operation by the DOM operation timeout.
    async fn bounded<T>(
        &self,
        label: &str,
        op: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        timeout(self.deps.config.timeouts.dom_op_timeout, op)
            .await
            .map_err(|_| SessionError::Timeout(label.to_owned()))?
    }
}
