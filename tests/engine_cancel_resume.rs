//! Cooperative cancellation and explicit resume.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustc_hash::FxHashMap;

use castflow::checkpoint::CheckpointStore;
use castflow::config::{EpisodeKind, RunRequest};
use castflow::engine::EngineError;
use castflow::event_bus::Event;
use castflow::pipeline::names;
use castflow::retry::RetryPolicy;
use castflow::run::RunStatus;

use common::{MockBehavior, build_harness, build_harness_with, build_harness_with_store};

fn request() -> RunRequest {
    RunRequest::new(EpisodeKind::RaceReview).with_event_id("gp-suzuka-2025")
}

/// A cancellation flag set while stage 4 of 5 waits out a retry backoff:
/// the run transitions to cancelled before stage 4's next attempt, and the
/// checkpoints for stages 1–3 remain.
#[tokio::test]
async fn cancel_during_backoff_wait_preempts_next_attempt() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(names::VOICE_SYNTHESIS, MockBehavior::AlwaysTransient);
    // Wide backoff so the cancel lands inside the wait.
    let harness = build_harness_with(
        behaviors,
        RetryPolicy::new(3, Duration::from_millis(500)),
        Duration::from_secs(5),
    );
    let events = harness.engine.subscribe();

    let run_id = harness.engine.submit(&request()).unwrap();

    // Wait for the first retry announcement of stage 4, then cancel.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
            .await
            .expect("retry event before timeout")
            .expect("event channel open");
        if let Event::Stage(stage) = event
            && stage.run_id == run_id
            && stage.stage == names::VOICE_SYNTHESIS
            && stage.scope == "retry"
        {
            break;
        }
    }
    harness.engine.cancel(&run_id).unwrap();

    let view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Cancelled);
    assert!(view.error.is_none(), "cancellation is not a failure");

    // The backoff was 500ms; the cancel preempted the second attempt.
    assert_eq!(harness.probes[names::VOICE_SYNTHESIS].invocations(), 1);

    let checkpoints = harness.checkpoints.list(&run_id).await.unwrap();
    let stages: Vec<&str> = checkpoints.iter().map(|c| c.stage_name.as_str()).collect();
    assert_eq!(
        stages,
        vec![
            names::RESEARCH,
            names::CONTENT_PLANNING,
            names::SCRIPT_GENERATION
        ]
    );
}

/// Cancellation during a long-running stage lands at the next stage
/// boundary: the in-flight stage commits, nothing after it starts.
#[tokio::test]
async fn cancel_mid_stage_takes_effect_at_the_boundary() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(
        names::VOICE_SYNTHESIS,
        MockBehavior::Delay(Duration::from_millis(300)),
    );
    let harness = build_harness(behaviors);
    let events = harness.engine.subscribe();

    let run_id = harness.engine.submit(&request()).unwrap();

    // Cancel once stage 3 has committed, while stage 4 sleeps.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
            .await
            .expect("commit event before timeout")
            .expect("event channel open");
        if let Event::Stage(stage) = event
            && stage.run_id == run_id
            && stage.stage == names::SCRIPT_GENERATION
            && stage.scope == "committed"
        {
            break;
        }
    }
    harness.engine.cancel(&run_id).unwrap();

    let view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Cancelled);

    // voice_synthesis was already in flight, so it committed; the boundary
    // check then stopped audio_production from ever starting.
    assert_eq!(harness.probes[names::AUDIO_PRODUCTION].invocations(), 0);
    let checkpoints = harness.checkpoints.list(&run_id).await.unwrap();
    assert_eq!(checkpoints.len(), 4);
}

/// Resume after a failure continues from the first uncompleted stage and
/// converges to the same terminal state as an uninterrupted run.
#[tokio::test]
async fn resume_continues_from_latest_checkpoint() {
    let broken = Arc::new(AtomicBool::new(true));
    let mut behaviors = FxHashMap::default();
    behaviors.insert(
        names::SCRIPT_GENERATION,
        MockBehavior::FatalWhile(broken.clone()),
    );
    let harness = build_harness(behaviors);

    let run_id = harness.engine.submit(&request()).unwrap();
    let failed = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(harness.checkpoints.list(&run_id).await.unwrap().len(), 2);

    // Fix the collaborator and resume.
    broken.store(false, Ordering::SeqCst);
    harness.engine.resume(&run_id).unwrap();
    let view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Completed);
    assert!(view.error.is_none());

    // Stages 1–2 were not repeated; stage 3 ran once per traversal.
    assert_eq!(harness.probes[names::RESEARCH].invocations(), 1);
    assert_eq!(harness.probes[names::CONTENT_PLANNING].invocations(), 1);
    assert_eq!(harness.probes[names::SCRIPT_GENERATION].invocations(), 2);

    let checkpoints = harness.checkpoints.list(&run_id).await.unwrap();
    let indices: Vec<u32> = checkpoints.iter().map(|c| c.stage_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    // Deterministic stages: the resumed run's final state matches an
    // uninterrupted execution of the same request.
    let pristine = build_harness(FxHashMap::default());
    let reference = pristine.engine.submit(&request()).unwrap();
    pristine.engine.wait_for_terminal(&reference).await.unwrap();
    let reference_state = pristine
        .checkpoints
        .latest(&reference)
        .await
        .unwrap()
        .unwrap()
        .state;
    let resumed_state = harness
        .checkpoints
        .latest(&run_id)
        .await
        .unwrap()
        .unwrap()
        .state;
    assert_eq!(resumed_state, reference_state);
}

/// Resume is refused for runs that are live or completed, and for unknown
/// run ids.
#[tokio::test]
async fn resume_guards_reject_misuse() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(
        names::RESEARCH,
        MockBehavior::Delay(Duration::from_millis(300)),
    );
    let harness = build_harness(behaviors);

    let run_id = harness.engine.submit(&request()).unwrap();
    // Still executing: the per-run guard blocks a concurrent resume.
    assert!(matches!(
        harness.engine.resume(&run_id),
        Err(EngineError::AlreadyExecuting { .. })
    ));

    let view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Completed);
    assert!(matches!(
        harness.engine.resume(&run_id),
        Err(EngineError::NotResumable { .. })
    ));

    assert!(matches!(
        harness.engine.resume("run_never_submitted"),
        Err(EngineError::RunNotFound { .. })
    ));
    assert!(matches!(
        harness.engine.cancel("run_never_submitted"),
        Err(EngineError::RunNotFound { .. })
    ));
}

/// A cancelled run can be resumed; the new traversal completes.
#[tokio::test]
async fn cancelled_run_is_resumable() {
    let mut behaviors = FxHashMap::default();
    behaviors.insert(names::VOICE_SYNTHESIS, MockBehavior::AlwaysTransient);
    let harness = build_harness_with(
        behaviors,
        RetryPolicy::new(3, Duration::from_millis(400)),
        Duration::from_secs(5),
    );
    let events = harness.engine.subscribe();
    let run_id = harness.engine.submit(&request()).unwrap();

    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv_async())
            .await
            .expect("retry event before timeout")
            .expect("event channel open");
        if let Event::Stage(stage) = event
            && stage.scope == "retry"
        {
            break;
        }
    }
    harness.engine.cancel(&run_id).unwrap();
    let view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Cancelled);

    // The collaborator never recovers, so the resumed traversal exhausts
    // its retries and fails — but from stage 4, not from the start.
    harness.engine.resume(&run_id).unwrap();
    let view = harness.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(view.status, RunStatus::Failed);
    assert_eq!(view.error.unwrap().stage, names::VOICE_SYNTHESIS);
    assert_eq!(harness.probes[names::RESEARCH].invocations(), 1);
}

/// After a process restart the in-memory record is gone; resume_detached
/// rebuilds it from the request and continues from the durable checkpoint.
#[tokio::test]
async fn resume_detached_survives_engine_restart() {
    let broken = Arc::new(AtomicBool::new(true));
    let mut behaviors = FxHashMap::default();
    behaviors.insert(
        names::SCRIPT_GENERATION,
        MockBehavior::FatalWhile(broken.clone()),
    );
    let first = build_harness(behaviors);

    let run_id = first.engine.submit(&request()).unwrap();
    let failed = first.engine.wait_for_terminal(&run_id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);

    // "Restart": a fresh engine over the same checkpoint store, healthy
    // collaborators this time.
    broken.store(false, Ordering::SeqCst);
    let second = build_harness_with_store(FxHashMap::default(), first.checkpoints.clone());
    second.engine.resume_detached(&run_id, &request()).unwrap();
    let view = second.engine.wait_for_terminal(&run_id).await.unwrap();

    assert_eq!(view.status, RunStatus::Completed);
    // The first two stages were restored, not re-executed.
    assert_eq!(second.probes[names::RESEARCH].invocations(), 0);
    assert_eq!(second.probes[names::CONTENT_PLANNING].invocations(), 0);
    assert_eq!(second.probes[names::SCRIPT_GENERATION].invocations(), 1);
    assert_eq!(second.checkpoints.list(&run_id).await.unwrap().len(), 5);
}
