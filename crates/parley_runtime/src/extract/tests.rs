use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use super::*;

fn streaming(text: &str) -> DomSnapshot {
    DomSnapshot {
        stop_visible: true,
        composer_present: true,
        assistant_turns: 1,
        response_text: text.to_owned(),
        ..DomSnapshot::default()
    }
}

fn finished(text: &str, copy_visible: bool) -> DomSnapshot {
    DomSnapshot {
        copy_visible,
        composer_present: true,
        assistant_turns: 1,
        response_text: text.to_owned(),
        ..DomSnapshot::default()
    }
}

#[test]
fn blockers_win_over_every_other_marker() {
    let mut snapshot = streaming("partial");
    snapshot.copy_visible = true;
    snapshot.login_wall = true;
    snapshot.challenge = true;
    assert_eq!(classify(&snapshot, None), ExtractionSignal::NeedsLogin);

    snapshot.login_wall = false;
    assert_eq!(classify(&snapshot, None), ExtractionSignal::NeedsChallenge);
}

#[test]
fn stop_control_means_streaming_even_with_copy_visible() {
    let mut snapshot = streaming("Echo");
    snapshot.copy_visible = true;
    assert_eq!(classify(&snapshot, Some(0)), ExtractionSignal::Streaming);
}

#[test]
fn completion_requires_copy_affordance_on_a_new_turn() {
    assert_eq!(
        classify(&finished("Echo: Hello", true), Some(0)),
        ExtractionSignal::Completed
    );
    // The only copy button belongs to a turn that predates the submission.
    assert_eq!(
        classify(&finished("old answer", true), Some(1)),
        ExtractionSignal::NotReady
    );
}

#[test]
fn missing_stop_and_copy_is_browser_failure() {
    assert_eq!(
        classify(&finished("", false), Some(0)),
        ExtractionSignal::FailedNoOutput
    );
    assert_eq!(
        classify(&finished("   \n", false), Some(0)),
        ExtractionSignal::FailedNoOutput
    );
    assert_eq!(
        classify(&finished("Echo: Hel", false), Some(0)),
        ExtractionSignal::FailedWithText
    );
    assert!(ExtractionSignal::FailedWithText.is_failure());
    assert!(!ExtractionSignal::Stalled.is_failure());
}

#[test]
fn answer_text_describing_an_error_is_still_completed() {
    let snapshot = finished("Error: I cannot help with that request.", true);
    assert_eq!(classify(&snapshot, Some(0)), ExtractionSignal::Completed);
}

#[test]
fn snapshot_payload_parses_from_script_shape() {
    let payload = serde_json::json!({
        "loginWall": false,
        "challenge": false,
        "stopVisible": true,
        "copyVisible": false,
        "composerPresent": true,
        "assistantTurns": 2,
        "responseText": "Echo",
        "reasoningText": "thinking",
        "conversationRef": "abc"
    });
    let snapshot: DomSnapshot = serde_json::from_value(payload).expect("parse snapshot");
    assert_eq!(snapshot.assistant_turns, 2);
    assert_eq!(snapshot.conversation_ref.as_deref(), Some("abc"));
    assert!(snapshot.is_ready());

    let sparse: DomSnapshot =
        serde_json::from_value(serde_json::json!({"composerPresent": true})).expect("defaults");
    assert_eq!(sparse.assistant_turns, 0);
}

#[test]
fn snapshot_script_embeds_selectors_as_json() {
    let selectors = UiSelectors {
        stop_button: "button[data-testid=\"stop\"]".to_owned(),
        ..UiSelectors::default()
    };
    let script = snapshot_script(&selectors);
    assert!(script.starts_with("(() => {"));
    assert!(script.contains(r#""stop":"button[data-testid=\"stop\"]""#));
    assert!(script.contains("conversationRef"));
}

#[test]
fn growing_text_keeps_streaming_and_frozen_text_stalls() {
    let stall = Duration::from_secs(60);
    let mut extractor =
        ResponseExtractor::new(&UiSelectors::default(), stall, Duration::from_secs(1));
    let t0 = Instant::now();

    assert_eq!(
        extractor.observe(&streaming("E"), Some(0), t0),
        ExtractionSignal::Streaming
    );
    assert_eq!(
        extractor.observe(&streaming("Ec"), Some(0), t0 + Duration::from_secs(50)),
        ExtractionSignal::Streaming
    );
    // Growth at t0+50s restarts the clock.
    assert_eq!(
        extractor.observe(&streaming("Ec"), Some(0), t0 + Duration::from_secs(100)),
        ExtractionSignal::Streaming
    );
    assert_eq!(
        extractor.observe(&streaming("Ec"), Some(0), t0 + Duration::from_secs(110)),
        ExtractionSignal::Stalled
    );
}

#[test]
fn reasoning_growth_counts_as_progress() {
    let stall = Duration::from_secs(10);
    let mut extractor =
        ResponseExtractor::new(&UiSelectors::default(), stall, Duration::from_secs(1));
    let t0 = Instant::now();
    let mut snapshot = streaming("");
    assert_eq!(
        extractor.observe(&snapshot, Some(0), t0),
        ExtractionSignal::Streaming
    );
    snapshot.reasoning_text = "considering".to_owned();
    assert_eq!(
        extractor.observe(&snapshot, Some(0), t0 + Duration::from_secs(9)),
        ExtractionSignal::Streaming
    );
    assert_eq!(
        extractor.observe(&snapshot, Some(0), t0 + Duration::from_secs(18)),
        ExtractionSignal::Streaming
    );
}

#[test]
fn non_streaming_signal_resets_stall_clock() {
    let stall = Duration::from_secs(10);
    let mut extractor =
        ResponseExtractor::new(&UiSelectors::default(), stall, Duration::from_secs(1));
    let t0 = Instant::now();
    extractor.observe(&streaming("abc"), Some(0), t0);
    assert_eq!(
        extractor.observe(&finished("abc", false), Some(0), t0 + Duration::from_secs(5)),
        ExtractionSignal::FailedWithText
    );
    // Streaming resumes: clock starts again from this tick.
    assert_eq!(
        extractor.observe(&streaming("abc"), Some(0), t0 + Duration::from_secs(12)),
        ExtractionSignal::Streaming
    );
    assert_eq!(
        extractor.observe(&streaming("abc"), Some(0), t0 + Duration::from_secs(21)),
        ExtractionSignal::Streaming
    );
}

#[test]
fn missing_new_turn_fails_after_turn_wait() {
    let mut extractor = ResponseExtractor::new(
        &UiSelectors::default(),
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .with_turn_wait(Duration::from_secs(3));
    let t0 = Instant::now();
    let unchanged = finished("old answer", true);

    assert_eq!(
        extractor.observe(&unchanged, Some(1), t0),
        ExtractionSignal::NotReady
    );
    assert_eq!(
        extractor.observe(&unchanged, Some(1), t0 + Duration::from_secs(2)),
        ExtractionSignal::NotReady
    );
    assert_eq!(
        extractor.observe(&unchanged, Some(1), t0 + Duration::from_secs(3)),
        ExtractionSignal::FailedNoOutput
    );
}

#[test]
fn new_turn_restarts_the_turn_wait() {
    let mut extractor = ResponseExtractor::new(
        &UiSelectors::default(),
        Duration::from_secs(10),
        Duration::from_secs(1),
    )
    .with_turn_wait(Duration::from_secs(3));
    let t0 = Instant::now();
    let idle = finished("", false);

    extractor.observe(&idle, Some(1), t0);
    assert_eq!(
        extractor.observe(&streaming("E"), Some(0), t0 + Duration::from_secs(2)),
        ExtractionSignal::Streaming
    );
    // A page that drops back to no new turn gets a fresh window.
    assert_eq!(
        extractor.observe(&idle, Some(1), t0 + Duration::from_secs(4)),
        ExtractionSignal::NotReady
    );
    extractor.reset();
    assert_eq!(
        extractor.observe(&idle, Some(1), t0 + Duration::from_secs(6)),
        ExtractionSignal::NotReady
    );
}
