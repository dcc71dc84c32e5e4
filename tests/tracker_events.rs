//! Status tracker: event-fed projection of run state.

mod common;

use std::time::Duration;

use rustc_hash::FxHashMap;

use castflow::config::{EpisodeKind, RunRequest};
use castflow::pipeline::names;
use castflow::run::RunStatus;
use castflow::tracker::StatusTracker;

use common::{MockBehavior, build_harness};

fn request() -> RunRequest {
    RunRequest::new(EpisodeKind::RaceReview).with_event_id("gp-interlagos-2025")
}

/// Polls the tracker until the run reaches a terminal status.
async fn await_terminal(tracker: &StatusTracker, run_id: &str) -> castflow::run::RunStatusView {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(view) = tracker.status(run_id)
            && view.status.is_terminal()
        {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tracker never observed a terminal status for {run_id}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn tracker_projects_completed_runs() {
    let harness = build_harness(FxHashMap::default());
    let tracker = StatusTracker::spawn(harness.engine.subscribe());

    let run_id = harness.engine.submit(&request()).unwrap();
    harness.engine.wait_for_terminal(&run_id).await.unwrap();

    let view = await_terminal(&tracker, &run_id).await;
    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!(view.current_stage.as_deref(), Some(names::AUDIO_PRODUCTION));
    assert!(view.error.is_none());
    assert!(view.finished_at.is_some());
}

#[tokio::test]
async fn tracker_carries_failure_detail() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(names::SCRIPT_GENERATION, MockBehavior::FatalValidation);
    let harness = build_harness(behaviors);
    let tracker = StatusTracker::spawn(harness.engine.subscribe());

    let run_id = harness.engine.submit(&request()).unwrap();
    harness.engine.wait_for_terminal(&run_id).await.unwrap();

    let view = await_terminal(&tracker, &run_id).await;
    assert_eq!(view.status, RunStatus::Failed);
    let error = view.error.expect("projection carries the failure detail");
    assert_eq!(error.stage, names::SCRIPT_GENERATION);
    assert_eq!(error.attempts, 1);
}

#[tokio::test]
async fn tracker_accumulates_artifact_references() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(
        names::VOICE_SYNTHESIS,
        MockBehavior::SucceedWithArtifact("audio/episode.mp3".to_string()),
    );
    let harness = build_harness(behaviors);
    let tracker = StatusTracker::spawn(harness.engine.subscribe());

    let run_id = harness.engine.submit(&request()).unwrap();
    let engine_view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(engine_view.artifacts.len(), 1);
    assert_eq!(engine_view.artifacts[0].key, "audio/episode.mp3");

    let tracked = await_terminal(&tracker, &run_id).await;
    assert_eq!(tracked.artifacts, engine_view.artifacts);
}

#[tokio::test]
async fn tracker_lists_runs_by_status() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(names::RESEARCH, MockBehavior::FatalValidation);
    let harness = build_harness(behaviors);
    let tracker = StatusTracker::spawn(harness.engine.subscribe());

    let failed = harness.engine.submit(&request()).unwrap();
    harness.engine.wait_for_terminal(&failed).await.unwrap();
    await_terminal(&tracker, &failed).await;

    assert_eq!(tracker.with_status(RunStatus::Failed).len(), 1);
    assert!(tracker.with_status(RunStatus::Completed).is_empty());
    assert_eq!(tracker.list().len(), 1);
}
