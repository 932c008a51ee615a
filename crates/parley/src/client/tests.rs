use std::sync::Mutex;

use parley_runtime::LaunchFuture;
use parley_store::{ErrorKind, MemoryRestartLedger, MemoryRunStore, NeedsUserReason};
use pretty_assertions::assert_eq;

use super::*;

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingLauncher {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn launched(&self) -> Vec<String> {
        self.launched.lock().expect("launched").clone()
    }
}

impl WorkerLauncher for RecordingLauncher {
    fn launch<'a>(&'a self, run_id: &'a str) -> LaunchFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            if self.fail {
                return Err(RuntimeError::Launch("no worker binary".to_owned()));
            }
            self.launched.lock().expect("launched").push(run_id.to_owned());
            Ok(())
        })
    }
}

struct Fixture {
    store: Arc<MemoryRunStore>,
    launcher: Arc<RecordingLauncher>,
    client: Client,
}

fn fixture_with(launcher: RecordingLauncher) -> Fixture {
    let store = Arc::new(MemoryRunStore::new());
    let launcher = Arc::new(launcher);
    let client = Client::new(store.clone(), launcher.clone());
    Fixture {
        store,
        launcher,
        client,
    }
}

fn fixture() -> Fixture {
    fixture_with(RecordingLauncher::default())
}

fn put_state(store: &MemoryRunStore, run_id: &str, state: RunState) {
    store
        .update(run_id, &mut |record| {
            record.state = state;
            Ok(())
        })
        .expect("set state");
}

#[tokio::test(flavor = "current_thread")]
async fn start_persists_pending_run_and_launches_worker() {
    let fx = fixture();
    let run_id = fx
        .client
        .start(StartRequest::new("  Hello  ").with_follow_up("And again?"))
        .await
        .expect("start");

    assert!(run_id.starts_with(RUN_ID_PREFIX));
    let record = fx.client.status(&run_id).await.expect("status");
    assert_eq!(record.state, RunState::Pending);
    assert_eq!(record.prompt, "Hello");
    assert_eq!(record.follow_ups, vec!["And again?".to_owned()]);
    assert_eq!(fx.launcher.launched(), vec![run_id]);
}

#[tokio::test(flavor = "current_thread")]
async fn empty_prompts_are_input_errors_without_worker() {
    let fx = fixture();
    let err = fx
        .client
        .start(StartRequest::new("   "))
        .await
        .expect_err("empty prompt");
    assert_eq!(err.kind(), ErrorKind::Input);

    let err = fx
        .client
        .start(StartRequest::new("Hello").with_follow_up(""))
        .await
        .expect_err("empty follow-up");
    assert_eq!(err.kind(), ErrorKind::Input);
    assert!(fx.launcher.launched().is_empty());
    assert!(fx.client.list().await.expect("list").is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn follow_up_copies_conversation_of_terminal_parent() {
    let fx = fixture();
    let parent_id = fx.client.start(StartRequest::new("first")).await.expect("parent");

    let err = fx
        .client
        .start(StartRequest::new("second").continuing(&parent_id))
        .await
        .expect_err("parent still pending");
    assert_eq!(err.kind(), ErrorKind::Input);

    fx.store
        .update(&parent_id, &mut |record| {
            record.state = RunState::Completed;
            record.conversation_ref = Some("conv-9".to_owned());
            Ok(())
        })
        .expect("complete parent");

    let child_id = fx
        .client
        .start(StartRequest::new("second").continuing(&parent_id))
        .await
        .expect("child");
    let child = fx.client.status(&child_id).await.expect("child status");
    assert_eq!(child.conversation_ref.as_deref(), Some("conv-9"));
    assert_eq!(child.parent_run_id.as_deref(), Some(parent_id.as_str()));
}

#[tokio::test(flavor = "current_thread")]
async fn follow_up_rejects_unknown_or_conversationless_parent() {
    let fx = fixture();
    let err = fx
        .client
        .start(StartRequest::new("second").continuing("run_missing"))
        .await
        .expect_err("missing parent");
    assert_eq!(err.kind(), ErrorKind::Input);

    let parent_id = fx.client.start(StartRequest::new("first")).await.expect("parent");
    put_state(&fx.store, &parent_id, RunState::Failed);
    let err = fx
        .client
        .start(StartRequest::new("second").continuing(&parent_id))
        .await
        .expect_err("no conversation");
    assert_eq!(err.kind(), ErrorKind::Input);
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_run_is_not_found() {
    let fx = fixture();
    let err = fx.client.status("run_nope").await.expect_err("missing");
    assert_eq!(err, ClientError::NotFound("run_nope".to_owned()));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_is_terminal_and_second_cancel_conflicts() {
    let fx = fixture();
    let run_id = fx.client.start(StartRequest::new("Hello")).await.expect("start");

    let record = fx.client.cancel(&run_id).await.expect("cancel");
    assert_eq!(record.state, RunState::Canceled);

    let err = fx.client.cancel(&run_id).await.expect_err("second cancel");
    assert_eq!(
        err,
        ClientError::TerminalConflict {
            run_id: run_id.clone(),
            state: RunState::Canceled,
        }
    );
    assert_eq!(err.kind(), ErrorKind::TerminalConflict);
}

#[tokio::test(flavor = "current_thread")]
async fn resume_needs_user_reenters_running_and_relaunches() {
    let fx = fixture();
    let run_id = fx.client.start(StartRequest::new("Hello")).await.expect("start");
    fx.store
        .update(&run_id, &mut |record| {
            record.state = RunState::NeedsUser;
            record.needs_user_reason = Some(NeedsUserReason::Login);
            Ok(())
        })
        .expect("needs user");

    let record = fx
        .client
        .resume(&run_id, ResumeOptions::default())
        .await
        .expect("resume");

    assert_eq!(record.state, RunState::Running);
    assert_eq!(record.needs_user_reason, None);
    assert_eq!(record.resumes, 1);
    assert_eq!(record.restart_approved_at, None);
    assert_eq!(fx.launcher.launched().len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn resume_rejects_terminal_and_live_runs() {
    let fx = fixture();
    let run_id = fx.client.start(StartRequest::new("Hello")).await.expect("start");

    let live = fx.store.worker_lock(&run_id, Duration::from_secs(60));
    assert!(live.try_acquire().expect("worker lock"));
    let err = fx
        .client
        .resume(&run_id, ResumeOptions::default())
        .await
        .expect_err("live worker");
    assert_eq!(err.kind(), ErrorKind::Input);

    live.release().expect("release");
    let record = fx
        .client
        .resume(&run_id, ResumeOptions::default())
        .await
        .expect("orphaned run resumes");
    assert_eq!(record.state, RunState::Running);

    put_state(&fx.store, &run_id, RunState::Completed);
    let err = fx
        .client
        .resume(&run_id, ResumeOptions::default())
        .await
        .expect_err("terminal");
    assert_eq!(err.kind(), ErrorKind::TerminalConflict);
}

#[tokio::test(flavor = "current_thread")]
async fn resume_with_approval_writes_fresh_ledger_record() {
    let fx = fixture();
    let ledger = Arc::new(MemoryRestartLedger::new());
    let client = fx.client.clone().with_ledger(ledger.clone());
    let run_id = client.start(StartRequest::new("Hello")).await.expect("start");
    fx.store
        .update(&run_id, &mut |record| {
            record.state = RunState::NeedsUser;
            record.needs_user_reason = Some(NeedsUserReason::KillBrowserRequired);
            Ok(())
        })
        .expect("needs user");
    let before = now_unix_millis();

    let record = client
        .resume(&run_id, ResumeOptions::approving_restart())
        .await
        .expect("resume");

    let approval = ledger.read_approval().expect("read").expect("approval");
    assert!(approval.is_fresh(before));
    assert_eq!(record.restart_approved_at, Some(approval.approved_at));
}

#[tokio::test(flavor = "current_thread")]
async fn approval_without_ledger_is_input_error() {
    let fx = fixture();
    let run_id = fx.client.start(StartRequest::new("Hello")).await.expect("start");
    put_state(&fx.store, &run_id, RunState::NeedsUser);

    let err = fx
        .client
        .resume(&run_id, ResumeOptions::approving_restart())
        .await
        .expect_err("no ledger");
    assert_eq!(err.kind(), ErrorKind::Input);
}

#[tokio::test(flavor = "current_thread")]
async fn launch_failure_fails_the_run_with_session() {
    let fx = fixture_with(RecordingLauncher::failing());
    let err = fx
        .client
        .start(StartRequest::new("Hello"))
        .await
        .expect_err("launch fails");
    assert_eq!(err.kind(), ErrorKind::Session);

    let runs = fx.client.list().await.expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Failed);
    assert_eq!(
        runs[0].error.as_ref().map(|error| error.kind),
        Some(ErrorKind::Session)
    );
}

#[tokio::test(flavor = "current_thread")]
async fn watch_returns_on_needs_user_and_times_out_on_active_runs() {
    let fx = fixture();
    let run_id = fx.client.start(StartRequest::new("Hello")).await.expect("start");
    let options = WatchOptions::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_millis(30));

    let err = fx.client.watch(&run_id, options).await.expect_err("timeout");
    assert_eq!(
        err,
        ClientError::WatchTimeout {
            run_id: run_id.clone(),
            state: RunState::Pending,
        }
    );

    put_state(&fx.store, &run_id, RunState::NeedsUser);
    let record = fx.client.watch(&run_id, options).await.expect("watch");
    assert_eq!(record.state, RunState::NeedsUser);
}

#[tokio::test(flavor = "current_thread")]
async fn gc_removes_expired_runs_only() {
    let fx = fixture();
    let mut old = RunRecord::new("run_old", "old", now_unix_millis() - 3 * 24 * 60 * 60 * 1000);
    old.state = RunState::Completed;
    fx.store.create(&old).expect("old run");
    let fresh_id = fx.client.start(StartRequest::new("fresh")).await.expect("fresh");

    let removed = fx.client.gc(None).await.expect("gc");

    assert_eq!(removed, vec!["run_old".to_owned()]);
    assert!(fx.client.status(&fresh_id).await.is_ok());
}
