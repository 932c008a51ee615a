use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{RuntimeError, SessionError};

pub type BrowserFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One page inside the shared browser bound to a profile.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub id: String,
    pub profile: String,
}

/// Browser automation capability. The driver owns the physical browser process; the worker
/// only sees pages through `SessionHandle`.
pub trait BrowserDriver: Send + Sync {
    /// Open a page in the browser for `profile`, launching it when absent and reusing it
    /// otherwise.
    fn open<'a>(&'a self, profile: &'a str)
        -> BrowserFuture<'a, Result<SessionHandle, SessionError>>;

    fn navigate<'a>(
        &'a self,
        session: &'a SessionHandle,
        url: &'a str,
    ) -> BrowserFuture<'a, Result<(), SessionError>>;

    /// Evaluate a script in the page and return its JSON result.
    fn evaluate<'a>(
        &'a self,
        session: &'a SessionHandle,
        script: &'a str,
    ) -> BrowserFuture<'a, Result<Value, SessionError>>;

    /// `Ok(false)` when the selector did not appear within `timeout`.
    fn wait_for_selector<'a>(
        &'a self,
        session: &'a SessionHandle,
        selector: &'a str,
        timeout: Duration,
    ) -> BrowserFuture<'a, Result<bool, SessionError>>;

    fn type_text<'a>(
        &'a self,
        session: &'a SessionHandle,
        selector: &'a str,
        text: &'a str,
    ) -> BrowserFuture<'a, Result<(), SessionError>>;

    fn click<'a>(
        &'a self,
        session: &'a SessionHandle,
        selector: &'a str,
    ) -> BrowserFuture<'a, Result<(), SessionError>>;

    fn attach_files<'a>(
        &'a self,
        _session: &'a SessionHandle,
        _selector: &'a str,
        files: &'a [PathBuf],
    ) -> BrowserFuture<'a, Result<(), SessionError>> {
        Box::pin(async move {
            if files.is_empty() {
                Ok(())
            } else {
                Err(SessionError::Script(
                    "driver does not support file attachments".to_owned(),
                ))
            }
        })
    }

    /// Close the page. The browser process itself stays up for other runs.
    fn close<'a>(&'a self, session: &'a SessionHandle)
        -> BrowserFuture<'a, Result<(), SessionError>>;

    /// Kill and relaunch the browser process bound to `profile`. Disruptive for every run
    /// sharing it; only called by the restart-performer.
    fn relaunch<'a>(&'a self, profile: &'a str) -> BrowserFuture<'a, Result<(), SessionError>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpandedPrompt {
    pub text: String,
    pub attachments: Vec<PathBuf>,
}

/// Expands file references inside a prompt before submission. Must be pure.
pub trait PromptResolver: Send + Sync {
    fn expand(&self, prompt: &str) -> Result<ExpandedPrompt, RuntimeError>;
}

/// Resolver that submits prompts verbatim with no attachments.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughResolver;

impl PromptResolver for PassthroughResolver {
    fn expand(&self, prompt: &str) -> Result<ExpandedPrompt, RuntimeError> {
        Ok(ExpandedPrompt {
            text: prompt.to_owned(),
            attachments: Vec::new(),
        })
    }
}
