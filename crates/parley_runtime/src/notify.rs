use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::errors::NotifyError;

pub type NotifyFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Denied,
}

/// Human confirmation prompt for a browser restart.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub run_id: String,
    pub title: String,
    pub message: String,
}

impl ConfirmRequest {
    pub fn browser_restart(run_id: &str, profile: &str) -> Self {
        Self {
            run_id: run_id.to_owned(),
            title: "parley: restart browser?".to_owned(),
            message: format!(
                "Run {run_id} lost its browser session for profile {profile}. \
                 Restarting the browser interrupts every run sharing it. Approve?"
            ),
        }
    }
}

/// Out-of-band channel asking a human yes/no.
pub trait Notifier: Send + Sync {
    fn confirm<'a>(
        &'a self,
        request: &'a ConfirmRequest,
    ) -> NotifyFuture<'a, Result<Decision, NotifyError>>;
}

/// Fixed answer, optionally after a delay. Headless deployments and tests.
#[derive(Clone, Debug)]
pub struct StaticNotifier {
    decision: Decision,
    delay: Duration,
}

impl StaticNotifier {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            delay: Duration::ZERO,
        }
    }

    pub fn approving() -> Self {
        Self::new(Decision::Approved)
    }

    pub fn denying() -> Self {
        Self::new(Decision::Denied)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Notifier for StaticNotifier {
    fn confirm<'a>(
        &'a self,
        _request: &'a ConfirmRequest,
    ) -> NotifyFuture<'a, Result<Decision, NotifyError>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.decision)
        })
    }
}

/// Runs `<program> <args...> <title> <message>`; exit status 0 means approved.
#[derive(Clone, Debug)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(5 * 60),
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

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Notifier for CommandNotifier {
    fn confirm<'a>(
        &'a self,
        request: &'a ConfirmRequest,
    ) -> NotifyFuture<'a, Result<Decision, NotifyError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .arg(&request.title)
                .arg(&request.message)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| NotifyError::Unavailable(format!("{}: {err}", self.program)))?;

            let status = tokio::time::timeout(self.timeout, child.wait())
                .await
                .map_err(|_| NotifyError::Timeout)?
                .map_err(|err| NotifyError::Failed(err.to_string()))?;

            Ok(if status.success() {
                Decision::Approved
            } else {
                Decision::Denied
            })
        })
    }
}

/// Ask `primary`; on error ask `fallback`; if both fail the answer is `Denied`.
#[derive(Clone)]
pub struct FallbackNotifier {
    primary: Arc<dyn Notifier>,
    fallback: Arc<dyn Notifier>,
}

impl FallbackNotifier {
    pub fn new(primary: Arc<dyn Notifier>, fallback: Arc<dyn Notifier>) -> Self {
        Self { primary, fallback }
    }
}

impl Notifier for FallbackNotifier {
    fn confirm<'a>(
        &'a self,
        request: &'a ConfirmRequest,
    ) -> NotifyFuture<'a, Result<Decision, NotifyError>> {
        Box::pin(async move {
            match self.primary.confirm(request).await {
                Ok(decision) => return Ok(decision),
                Err(err) => {
                    tracing::warn!(run_id = %request.run_id, error = %err, "primary notifier failed");
                }
            }
            match self.fallback.confirm(request).await {
                Ok(decision) => Ok(decision),
                Err(err) => {
                    tracing::warn!(
                        run_id = %request.run_id,
                        error = %err,
                        "fallback notifier failed; treating as denied"
                    );
                    Ok(Decision::Denied)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    impl Notifier for FailingNotifier {
        fn confirm<'a>(
            &'a self,
            _request: &'a ConfirmRequest,
        ) -> NotifyFuture<'a, Result<Decision, NotifyError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(NotifyError::Unavailable("no display".to_owned())) })
        }
    }

    fn request() -> ConfirmRequest {
        ConfirmRequest::browser_restart("run_1", "/tmp/profile")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn static_notifier_returns_fixed_answer() {
        let approved = StaticNotifier::approving().confirm(&request()).await;
        assert_eq!(approved, Ok(Decision::Approved));
        let denied = StaticNotifier::denying()
            .with_delay(Duration::from_millis(5))
            .confirm(&request())
            .await;
        assert_eq!(denied, Ok(Decision::Denied));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fallback_is_asked_when_primary_fails() {
        let primary = Arc::new(FailingNotifier {
            calls: AtomicUsize::new(0),
        });
        let notifier = FallbackNotifier::new(primary.clone(), Arc::new(StaticNotifier::approving()));
        assert_eq!(notifier.confirm(&request()).await, Ok(Decision::Approved));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn double_notifier_failure_is_denied_not_an_error() {
        let failing = || {
            Arc::new(FailingNotifier {
                calls: AtomicUsize::new(0),
            })
        };
        let notifier = FallbackNotifier::new(failing(), failing());
        assert_eq!(notifier.confirm(&request()).await, Ok(Decision::Denied));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_command_is_unavailable() {
        let notifier = CommandNotifier::new("/nonexistent/parley-notify-bin");
        let result = notifier.confirm(&request()).await;
        assert!(matches!(result, Err(NotifyError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn command_exit_status_maps_to_decision() {
        let yes = CommandNotifier::new("sh").with_args(["-c", "exit 0", "notify"]);
        assert_eq!(yes.confirm(&request()).await, Ok(Decision::Approved));
        let no = CommandNotifier::new("sh").with_args(["-c", "exit 1", "notify"]);
        assert_eq!(no.confirm(&request()).await, Ok(Decision::Denied));
    }

    #[test]
    fn restart_request_names_the_run() {
        let request = request();
        assert!(request.message.contains("run_1"));
        assert!(request.message.contains("/tmp/profile"));
    }
}
