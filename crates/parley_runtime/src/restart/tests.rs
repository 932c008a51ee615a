use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parley_store::{FsRestartLedger, MemoryRestartLedger};
use pretty_assertions::assert_eq;

use super::*;
use crate::notify::StaticNotifier;
use crate::scripted::ScriptedBrowser;

struct TempDir {
    root: PathBuf,
}

impl TempDir {
    fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("parley_restart_{nanos}"));
        std::fs::create_dir_all(&root).expect("create temp root");
        Self { root }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn coordinator(
    ledger: Arc<dyn RestartLedger>,
    notifier: StaticNotifier,
    browser: &ScriptedBrowser,
) -> RestartCoordinator {
    RestartCoordinator::new(ledger, Arc::new(notifier), Arc::new(browser.clone()))
        .with_poll_interval(Duration::from_millis(5))
        .with_wait_timeout(Duration::from_millis(400))
}

fn approving() -> StaticNotifier {
    StaticNotifier::approving()
}

fn denying() -> StaticNotifier {
    StaticNotifier::denying()
}

fn request(run_id: &str, wait_since: i64) -> RestartRequest {
    RestartRequest {
        run_id: run_id.to_owned(),
        profile: "/tmp/profile".to_owned(),
        wait_since,
    }
}

async fn never() -> bool {
    false
}

#[tokio::test(flavor = "current_thread")]
async fn self_approval_restarts_immediately() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let browser = ScriptedBrowser::new();
    let coordinator = coordinator(ledger.clone(), approving(), &browser);

    let outcome = coordinator
        .await_restart(&request("run_a", now_unix_millis()), never)
        .await
        .expect("restart");

    assert_eq!(outcome, RestartOutcome::Restarted);
    assert_eq!(browser.counters().relaunches, 1);
    assert_eq!(ledger.read_approval().expect("approval"), None);
    assert!(ledger.read_done().expect("done").is_some());
    assert!(!ledger.notify_taken());
    assert!(!ledger.performer_taken());
}

#[tokio::test(flavor = "current_thread")]
async fn fresh_done_from_peer_resolves_without_notifying() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let wait_since = now_unix_millis();
    ledger
        .write_done(&DoneRecord {
            done_at: wait_since + 1,
            approved_at: None,
        })
        .expect("done");
    let browser = ScriptedBrowser::new();
    let coordinator = coordinator(ledger, approving(), &browser);

    let outcome = coordinator
        .await_restart(&request("run_a", wait_since), never)
        .await
        .expect("restart");
    assert_eq!(outcome, RestartOutcome::ResolvedByPeer);
    assert_eq!(browser.counters().relaunches, 0);
}

#[tokio::test(flavor = "current_thread")]
async fn stale_records_are_ignored_and_approval_is_requested_again() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let wait_since = now_unix_millis();
    ledger
        .write_done(&DoneRecord {
            done_at: wait_since - 60_000,
            approved_at: Some(wait_since - 61_000),
        })
        .expect("old done");
    ledger
        .write_approval(&ApprovalRecord {
            approved_at: wait_since - 30_000,
            approved_by: None,
        })
        .expect("old approval");
    let browser = ScriptedBrowser::new();
    let coordinator = coordinator(ledger.clone(), approving(), &browser);

    let outcome = coordinator
        .await_restart(&request("run_a", wait_since), never)
        .await
        .expect("restart");

    assert_eq!(outcome, RestartOutcome::Restarted);
    let done = ledger.read_done().expect("done").expect("fresh done");
    assert!(done.is_fresh(wait_since));
    assert!(done.approved_at.expect("approved_at") >= wait_since);
}

#[tokio::test(flavor = "current_thread")]
async fn denied_approval_times_out_without_restart() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let browser = ScriptedBrowser::new();
    let coordinator = coordinator(ledger.clone(), denying(), &browser)
        .with_wait_timeout(Duration::from_millis(60));

    let outcome = coordinator
        .await_restart(&request("run_a", now_unix_millis()), never)
        .await
        .expect("restart");

    assert_eq!(outcome, RestartOutcome::TimedOut);
    assert_eq!(browser.counters().relaunches, 0);
    assert!(!ledger.notify_taken());
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_predicate_interrupts_an_open_notification() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let browser = ScriptedBrowser::new();
    let slow = approving().with_delay(Duration::from_secs(30));
    let coordinator = coordinator(ledger.clone(), slow, &browser);
    let canceled = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&canceled);
    let cancel_later = async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        flag.store(true, Ordering::SeqCst);
    };
    let request = request("run_a", now_unix_millis());
    let wait = coordinator.await_restart(&request, || {
        let canceled = Arc::clone(&canceled);
        async move { canceled.load(Ordering::SeqCst) }
    });
    let (outcome, ()) = tokio::join!(wait, cancel_later);

    assert_eq!(outcome.expect("restart"), RestartOutcome::Canceled);
    assert_eq!(browser.counters().relaunches, 0);
    assert!(!ledger.notify_taken());
}

#[tokio::test(flavor = "current_thread")]
async fn external_approval_is_performed_by_a_waiter() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let browser = ScriptedBrowser::new();
    // The waiter's own question never gets answered in time.
    let silent = denying().with_delay(Duration::from_secs(30));
    let coordinator = coordinator(ledger.clone(), silent, &browser);
    let request = request("run_a", now_unix_millis());

    let approver = ledger.clone();
    let approve_later = async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        approver
            .write_approval(&ApprovalRecord {
                approved_at: now_unix_millis(),
                approved_by: Some("caller".to_owned()),
            })
            .expect("approve");
    };
    let (outcome, ()) = tokio::join!(
        coordinator.await_restart(&request, never),
        approve_later
    );

    assert_eq!(outcome.expect("restart"), RestartOutcome::Restarted);
    assert_eq!(browser.counters().relaunches, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn concurrent_waiters_share_one_restart() {
    let temp = TempDir::new();
    let stale = Duration::from_secs(60);
    let ledger_a: Arc<dyn RestartLedger> =
        Arc::new(FsRestartLedger::new(&temp.root, "/tmp/profile", stale));
    let ledger_b: Arc<dyn RestartLedger> =
        Arc::new(FsRestartLedger::new(&temp.root, "/tmp/profile", stale));
    let browser = ScriptedBrowser::new().with_relaunch_delay(Duration::from_millis(20));
    let notifier = || approving().with_delay(Duration::from_millis(10));
    let a = coordinator(ledger_a, notifier(), &browser);
    let b = coordinator(ledger_b, notifier(), &browser);
    let wait_since = now_unix_millis();
    let request_a = request("run_a", wait_since);
    let request_b = request("run_b", wait_since);

    let (first, second) = tokio::join!(
        a.await_restart(&request_a, never),
        b.await_restart(&request_b, never)
    );
    let mut outcomes = vec![first.expect("a"), second.expect("b")];
    outcomes.sort_by_key(|outcome| *outcome != RestartOutcome::Restarted);

    assert_eq!(
        outcomes,
        vec![RestartOutcome::Restarted, RestartOutcome::ResolvedByPeer]
    );
    assert_eq!(browser.counters().relaunches, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_abandons_a_hung_relaunch() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let browser = ScriptedBrowser::new().with_relaunch_delay(Duration::from_secs(30));
    let coordinator = coordinator(ledger.clone(), approving(), &browser);
    let canceled = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&canceled);
    let cancel_later = async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        flag.store(true, Ordering::SeqCst);
    };
    let request = request("run_a", now_unix_millis());
    let wait = coordinator.await_restart(&request, || {
        let canceled = Arc::clone(&canceled);
        async move { canceled.load(Ordering::SeqCst) }
    });
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(wait, cancel_later)
    })
    .await
    .expect("relaunch wait must stop soon after cancel");

    assert_eq!(outcome.expect("restart"), RestartOutcome::Canceled);
    assert_eq!(browser.counters().relaunches, 0);
    assert!(!ledger.performer_taken());
    assert_eq!(ledger.read_done().expect("done"), None);
}

#[tokio::test(flavor = "current_thread")]
async fn hung_relaunch_times_out_and_frees_the_performer_lock() {
    let ledger = Arc::new(MemoryRestartLedger::new());
    let browser = ScriptedBrowser::new().with_relaunch_delay(Duration::from_secs(30));
    let coordinator = coordinator(ledger.clone(), approving(), &browser)
        .with_relaunch_timeout(Duration::from_millis(50));
    let request = request("run_a", now_unix_millis());

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        coordinator.await_restart(&request, never),
    )
    .await
    .expect("relaunch must be bounded");

    match outcome {
        Err(RuntimeError::Session(SessionError::Timeout(message))) => {
            assert!(message.contains("relaunch"), "{message}");
        }
        other => panic!("expected relaunch timeout, got {other:?}"),
    }
    assert_eq!(browser.counters().relaunches, 0);
    assert!(!ledger.performer_taken());
    assert_eq!(ledger.read_done().expect("done"), None);
}
