//! The execution engine: drives compiled plans against runs.
//!
//! One engine serves many concurrent runs. Each submission validates the
//! request, records a pending [`Run`], and spawns a driver task; a bounded
//! semaphore caps how many drivers execute at once. Within a run, stages are
//! strictly sequential: stage *i + 1* never starts before stage *i*'s delta
//! is merged and checkpointed. Across runs there is no shared state at all —
//! a retry loop blocking one run never blocks another.
//!
//! # Status machine
//!
//! `Pending → Running → {Completed | Failed | Cancelled}`, enforced through
//! a single transition path. [`ExecutionEngine::resume`] begins a fresh
//! lifecycle for a failed or cancelled run: the traversal continues from the
//! last checkpoint, and within the new lifecycle transitions are again
//! strictly forward.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tracing::instrument;

use miette::Diagnostic;
use thiserror::Error;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore};
use crate::config::{ConfigError, RunParams, RunRequest};
use crate::event_bus::{ChannelSink, Event, EventBus};
use crate::ids::IdGenerator;
use crate::pipeline::namespaces;
use crate::plan::{PlanBuilder, PlanError, PlannedStage, StageRegistry};
use crate::run::{ErrorInfo, Run, RunId, RunStatus, RunStatusView};
use crate::stage::{StageContext, StageDelta, StageError};
use crate::state::SharedState;
use crate::storage::{ArtifactStore, MemoryArtifactStore};

use super::cancel::CancelToken;

/// Engine-level failures (distinct from in-run stage failures, which are
/// recorded on the run itself).
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("run not found: {run_id}")]
    #[diagnostic(code(castflow::engine::run_not_found))]
    RunNotFound { run_id: RunId },

    #[error(transparent)]
    #[diagnostic(code(castflow::engine::config))]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(castflow::engine::plan))]
    Plan(#[from] PlanError),

    #[error(transparent)]
    #[diagnostic(code(castflow::engine::checkpoint))]
    Checkpoint(#[from] CheckpointError),

    #[error("run `{run_id}` is {status}; only failed or cancelled runs can be resumed")]
    #[diagnostic(
        code(castflow::engine::not_resumable),
        help("Completed runs are immutable; submit a new run instead.")
    )]
    NotResumable { run_id: RunId, status: RunStatus },

    #[error("run `{run_id}` already has an active driver")]
    #[diagnostic(code(castflow::engine::already_executing))]
    AlreadyExecuting { run_id: RunId },
}

struct RunEntry {
    run: Run,
    cancel: CancelToken,
    /// Single-writer guard: true while a driver task owns this run's
    /// checkpoint sequence. Blocks concurrent resume.
    executing: bool,
    status_tx: watch::Sender<RunStatus>,
}

struct EngineInner {
    registry: Arc<StageRegistry>,
    plan: PlanBuilder,
    checkpoints: Arc<dyn CheckpointStore>,
    artifacts: Arc<dyn ArtifactStore>,
    runs: Mutex<FxHashMap<RunId, RunEntry>>,
    permits: Arc<Semaphore>,
    event_bus: EventBus,
    ids: IdGenerator,
}

/// Orchestrates runs of a compiled pipeline. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`ExecutionEngine`].
///
/// Only the registry and plan are mandatory; stores default to the in-memory
/// bindings and concurrency to the host's available parallelism.
pub struct EngineBuilder {
    registry: Option<Arc<StageRegistry>>,
    plan: Option<PlanBuilder>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    event_bus: Option<EventBus>,
    max_concurrent_runs: Option<usize>,
}

impl EngineBuilder {
    #[must_use]
    pub fn registry(mut self, registry: StageRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    #[must_use]
    pub fn plan(mut self, plan: PlanBuilder) -> Self {
        self.plan = Some(plan);
        self
    }

    #[must_use]
    pub fn checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    #[must_use]
    pub fn artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    #[must_use]
    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Caps the worker pool for concurrent run drivers.
    #[must_use]
    pub fn max_concurrent_runs(mut self, limit: usize) -> Self {
        self.max_concurrent_runs = Some(limit.max(1));
        self
    }

    /// Builds the engine and starts the event listener.
    ///
    /// # Panics
    ///
    /// Panics if registry or plan were not provided; both are wiring errors
    /// caught at startup, not runtime conditions.
    #[must_use]
    pub fn build(self) -> ExecutionEngine {
        let limit = self.max_concurrent_runs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });
        let event_bus = self.event_bus.unwrap_or_default();
        event_bus.listen_for_events();
        ExecutionEngine {
            inner: Arc::new(EngineInner {
                registry: self.registry.expect("engine requires a stage registry"),
                plan: self.plan.expect("engine requires a plan"),
                checkpoints: self
                    .checkpoints
                    .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
                artifacts: self
                    .artifacts
                    .unwrap_or_else(|| Arc::new(MemoryArtifactStore::new())),
                runs: Mutex::new(FxHashMap::default()),
                permits: Arc::new(Semaphore::new(limit)),
                event_bus,
                ids: IdGenerator::new(),
            }),
        }
    }
}

impl ExecutionEngine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            registry: None,
            plan: None,
            checkpoints: None,
            artifacts: None,
            event_bus: None,
            max_concurrent_runs: None,
        }
    }

    /// Validates a request and starts a run, returning its id immediately.
    ///
    /// Execution proceeds asynchronously on a spawned driver task; use
    /// [`status`](Self::status), [`wait_for_terminal`](Self::wait_for_terminal),
    /// or an event subscription to observe progress.
    #[instrument(skip(self, request), err)]
    pub fn submit(&self, request: &RunRequest) -> Result<RunId, EngineError> {
        let params = RunParams::validate(request)?;
        let run_id = self.inner.ids.generate_run_id();
        let params = Arc::new(params);

        let cancel = CancelToken::new();
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        {
            let mut runs = self.inner.runs.lock();
            runs.insert(
                run_id.clone(),
                RunEntry {
                    run: Run::new(run_id.clone(), (*params).clone()),
                    cancel: cancel.clone(),
                    executing: true,
                    status_tx,
                },
            );
        }
        self.publish_transition(&run_id, RunStatus::Pending, None, "run submitted");

        let inner = Arc::clone(&self.inner);
        let id = run_id.clone();
        tokio::spawn(async move {
            drive_run(inner, id, params, None).await;
        });
        Ok(run_id)
    }

    /// Requests cooperative cancellation of a run.
    ///
    /// Takes effect at the next stage boundary or backoff wait; an in-flight
    /// collaborator call is never interrupted.
    pub fn cancel(&self, run_id: &str) -> Result<(), EngineError> {
        let runs = self.inner.runs.lock();
        let entry = runs.get(run_id).ok_or_else(|| EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Resumes a failed or cancelled run from its latest checkpoint.
    ///
    /// Distinct from automatic retry: this starts a new traversal that
    /// continues the plan from the first uncompleted stage, never repeating
    /// a checkpointed one. The run's checkpoint sequence carries on under
    /// the same run id.
    #[instrument(skip(self), err)]
    pub fn resume(&self, run_id: &str) -> Result<(), EngineError> {
        let params = {
            let mut runs = self.inner.runs.lock();
            let entry = runs
                .get_mut(run_id)
                .ok_or_else(|| EngineError::RunNotFound {
                    run_id: run_id.to_string(),
                })?;
            if entry.executing {
                return Err(EngineError::AlreadyExecuting {
                    run_id: run_id.to_string(),
                });
            }
            if !matches!(entry.run.status, RunStatus::Failed | RunStatus::Cancelled) {
                return Err(EngineError::NotResumable {
                    run_id: run_id.to_string(),
                    status: entry.run.status,
                });
            }
            // Fresh lifecycle: clear the failure, rearm cancellation.
            entry.executing = true;
            entry.cancel = CancelToken::new();
            entry.run.status = RunStatus::Pending;
            entry.run.error = None;
            entry.run.finished_at = None;
            entry.status_tx.send_replace(RunStatus::Pending);
            Arc::new(entry.run.params.clone())
        };
        self.publish_transition(run_id, RunStatus::Pending, None, "run resumed");

        let inner = Arc::clone(&self.inner);
        let id = run_id.to_string();
        tokio::spawn(async move {
            drive_run(inner, id, params, Some(ResumeFrom::LatestCheckpoint)).await;
        });
        Ok(())
    }

    /// Rebuilds and resumes a run whose in-memory record was lost (process
    /// restart). The caller supplies the original request; execution
    /// continues from the latest checkpoint in the configured store.
    #[instrument(skip(self, request), err)]
    pub fn resume_detached(&self, run_id: &str, request: &RunRequest) -> Result<(), EngineError> {
        let params = Arc::new(RunParams::validate(request)?);
        {
            let mut runs = self.inner.runs.lock();
            if let Some(entry) = runs.get(run_id) {
                return if entry.executing {
                    Err(EngineError::AlreadyExecuting {
                        run_id: run_id.to_string(),
                    })
                } else {
                    Err(EngineError::NotResumable {
                        run_id: run_id.to_string(),
                        status: entry.run.status,
                    })
                };
            }
            let (status_tx, _) = watch::channel(RunStatus::Pending);
            runs.insert(
                run_id.to_string(),
                RunEntry {
                    run: Run::new(run_id.to_string(), (*params).clone()),
                    cancel: CancelToken::new(),
                    executing: true,
                    status_tx,
                },
            );
        }
        self.publish_transition(run_id, RunStatus::Pending, None, "run resumed after restart");

        let inner = Arc::clone(&self.inner);
        let id = run_id.to_string();
        tokio::spawn(async move {
            drive_run(inner, id, params, Some(ResumeFrom::LatestCheckpoint)).await;
        });
        Ok(())
    }

    /// Current projection of a run, if known to this engine.
    #[must_use]
    pub fn status(&self, run_id: &str) -> Option<RunStatusView> {
        self.inner
            .runs
            .lock()
            .get(run_id)
            .map(|entry| RunStatusView::from(&entry.run))
    }

    /// Recent runs, most recent first, optionally filtered by event id.
    #[must_use]
    pub fn list_runs(&self, limit: usize, event_id: Option<&str>) -> Vec<RunStatusView> {
        let runs = self.inner.runs.lock();
        let mut views: Vec<RunStatusView> = runs
            .values()
            .filter(|entry| match event_id {
                Some(filter) => entry.run.params.event_id.as_deref() == Some(filter),
                None => true,
            })
            .map(|entry| RunStatusView::from(&entry.run))
            .collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        views.truncate(limit);
        views
    }

    /// Waits until the run reaches a terminal status and returns it.
    pub async fn wait_for_terminal(&self, run_id: &str) -> Result<RunStatusView, EngineError> {
        let mut rx = {
            let runs = self.inner.runs.lock();
            let entry = runs.get(run_id).ok_or_else(|| EngineError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
            entry.status_tx.subscribe()
        };
        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.status(run_id).ok_or_else(|| EngineError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Subscribes a new channel to the engine's event stream.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.inner.event_bus.add_sink(ChannelSink::new(tx));
        rx
    }

    /// The checkpoint store backing this engine.
    #[must_use]
    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.inner.checkpoints)
    }

    fn publish_transition(
        &self,
        run_id: &str,
        status: RunStatus,
        stage: Option<String>,
        message: &str,
    ) {
        let _ = self
            .inner
            .event_bus
            .get_sender()
            .send(Event::run_transition(run_id, status, stage, message));
    }
}

enum ResumeFrom {
    LatestCheckpoint,
}

/// Outcome of one stage's attempt loop.
enum StageOutcome {
    Committed,
    Cancelled,
    Failed(ErrorInfo),
}

#[instrument(skip(inner, params, resume), fields(run_id = %run_id))]
async fn drive_run(
    inner: Arc<EngineInner>,
    run_id: RunId,
    params: Arc<RunParams>,
    resume: Option<ResumeFrom>,
) {
    let _permit = inner
        .permits
        .acquire()
        .await
        .expect("run permit semaphore closed");

    let cancel = {
        let runs = inner.runs.lock();
        match runs.get(&run_id) {
            Some(entry) => entry.cancel.clone(),
            None => return,
        }
    };

    if cancel.is_cancelled() {
        transition(
            &inner,
            &run_id,
            RunStatus::Cancelled,
            None,
            "cancelled before start",
        );
        return;
    }

    let plan = match inner
        .plan
        .compile(&inner.registry, &params, &[namespaces::REQUEST])
    {
        Ok(plan) => plan,
        Err(e) => {
            record_failure(
                &inner,
                &run_id,
                ErrorInfo {
                    stage: "plan".to_string(),
                    message: e.to_string(),
                    attempts: 0,
                },
            );
            return;
        }
    };

    // Fresh runs seed state from the request; resumed runs rebuild it from
    // the latest checkpoint and continue at the next uncompleted stage.
    let (mut state, start_index) = match resume {
        None => (
            SharedState::builder()
                .with_namespace(namespaces::REQUEST, params.initial_namespace())
                .build(),
            0usize,
        ),
        Some(ResumeFrom::LatestCheckpoint) => match inner.checkpoints.latest(&run_id).await {
            Ok(Some(checkpoint)) => {
                let next = checkpoint.stage_index as usize + 1;
                (checkpoint.state, next)
            }
            Ok(None) => (
                SharedState::builder()
                    .with_namespace(namespaces::REQUEST, params.initial_namespace())
                    .build(),
                0usize,
            ),
            Err(e) => {
                record_failure(
                    &inner,
                    &run_id,
                    ErrorInfo {
                        stage: "checkpoint".to_string(),
                        message: e.to_string(),
                        attempts: 0,
                    },
                );
                return;
            }
        },
    };

    transition(&inner, &run_id, RunStatus::Running, None, "run started");
    tracing::info!(
        stages = plan.len(),
        start_index,
        skipped = plan.skipped().len(),
        "driving plan"
    );

    for (index, planned) in plan.stages().iter().enumerate().skip(start_index) {
        set_current_stage(&inner, &run_id, planned.name());

        // Cancellation lands at stage boundaries.
        if cancel.is_cancelled() {
            transition(
                &inner,
                &run_id,
                RunStatus::Cancelled,
                Some(planned.name().to_string()),
                "cancelled at stage boundary",
            );
            return;
        }

        match run_stage(&inner, &run_id, &params, &cancel, planned, index, &mut state).await {
            StageOutcome::Committed => {}
            StageOutcome::Cancelled => {
                transition(
                    &inner,
                    &run_id,
                    RunStatus::Cancelled,
                    Some(planned.name().to_string()),
                    "cancelled during stage",
                );
                return;
            }
            StageOutcome::Failed(error) => {
                record_failure(&inner, &run_id, error);
                return;
            }
        }
    }

    transition(&inner, &run_id, RunStatus::Completed, None, "run completed");
}

/// Executes one stage's attempt loop: precondition check, timeout-bounded
/// invocation, contract verification, merge, checkpoint.
async fn run_stage(
    inner: &Arc<EngineInner>,
    run_id: &str,
    params: &Arc<RunParams>,
    cancel: &CancelToken,
    planned: &PlannedStage,
    index: usize,
    state: &mut SharedState,
) -> StageOutcome {
    let descriptor = &planned.descriptor;

    // Missing inputs mean the compiler was bypassed or a producer lied;
    // either way this is fatal, not retryable.
    for namespace in &descriptor.requires {
        if !state.contains(namespace) {
            return StageOutcome::Failed(ErrorInfo {
                stage: descriptor.name.clone(),
                message: StageError::MissingInput {
                    namespace: namespace.clone(),
                }
                .to_string(),
                attempts: 0,
            });
        }
    }

    let mut attempt: u32 = 1;
    loop {
        let ctx = StageContext {
            run_id: run_id.to_string(),
            stage: descriptor.name.clone(),
            attempt,
            params: Arc::clone(params),
            artifacts: Arc::clone(&inner.artifacts),
            cancel: cancel.clone(),
            event_sender: inner.event_bus.get_sender(),
        };

        let result = match tokio::time::timeout(
            descriptor.timeout,
            planned.stage.run(state.snapshot(), ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(descriptor.timeout)),
        };

        match result {
            Ok(delta) => {
                return commit_stage(inner, run_id, planned, index, attempt, delta, state).await;
            }
            Err(StageError::Cancelled) => return StageOutcome::Cancelled,
            Err(e) if e.is_retryable() && descriptor.retry.allows_retry(attempt) => {
                let delay = descriptor.retry.backoff_delay(attempt);
                tracing::warn!(
                    stage = %descriptor.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient stage failure; backing off"
                );
                emit_stage_event(
                    inner,
                    run_id,
                    &descriptor.name,
                    attempt,
                    "retry",
                    format!("attempt {attempt} failed ({e}); retrying in {delay:?}"),
                );
                // Race the backoff against cancellation so a cancel request
                // does not wait out the timer (shared state is unchanged).
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return StageOutcome::Cancelled,
                }
                attempt += 1;
            }
            Err(e) => {
                return StageOutcome::Failed(ErrorInfo {
                    stage: descriptor.name.clone(),
                    message: e.to_string(),
                    attempts: attempt,
                });
            }
        }
    }
}

/// Verifies the output contract, merges the delta, and checkpoints.
async fn commit_stage(
    inner: &Arc<EngineInner>,
    run_id: &str,
    planned: &PlannedStage,
    index: usize,
    attempt: u32,
    delta: StageDelta,
    state: &mut SharedState,
) -> StageOutcome {
    let descriptor = &planned.descriptor;

    let declared: FxHashSet<&str> = descriptor.produces.iter().map(String::as_str).collect();
    let returned: FxHashSet<&str> = delta.namespaces.keys().map(String::as_str).collect();
    if declared != returned {
        let mut missing: Vec<&str> = declared.difference(&returned).copied().collect();
        let mut extra: Vec<&str> = returned.difference(&declared).copied().collect();
        missing.sort_unstable();
        extra.sort_unstable();
        return StageOutcome::Failed(ErrorInfo {
            stage: descriptor.name.clone(),
            message: StageError::Contract(format!(
                "delta must cover exactly the declared outputs (missing: {missing:?}, undeclared: {extra:?})"
            ))
            .to_string(),
            attempts: attempt,
        });
    }

    if let Err(e) = state.merge(&descriptor.name, &delta.namespaces) {
        return StageOutcome::Failed(ErrorInfo {
            stage: descriptor.name.clone(),
            message: StageError::Contract(e.to_string()).to_string(),
            attempts: attempt,
        });
    }

    if !delta.artifacts.is_empty() {
        let mut runs = inner.runs.lock();
        if let Some(entry) = runs.get_mut(run_id) {
            entry.run.artifacts.extend(delta.artifacts.iter().cloned());
        }
    }

    // Checkpoint strictly after the merge; resume relies on index i
    // certifying stages 0..=i committed.
    let checkpoint = Checkpoint::new(run_id, index as u32, &descriptor.name, state);
    if let Err(e) = inner.checkpoints.put(checkpoint).await {
        return StageOutcome::Failed(ErrorInfo {
            stage: descriptor.name.clone(),
            message: e.to_string(),
            attempts: attempt,
        });
    }

    let _ = inner.event_bus.get_sender().send(Event::stage_committed(
        run_id,
        &descriptor.name,
        attempt,
        index,
        delta.artifacts,
    ));
    StageOutcome::Committed
}

fn set_current_stage(inner: &Arc<EngineInner>, run_id: &str, stage: &str) {
    let mut runs = inner.runs.lock();
    if let Some(entry) = runs.get_mut(run_id) {
        entry.run.current_stage = Some(stage.to_string());
    }
}

fn record_failure(inner: &Arc<EngineInner>, run_id: &str, error: ErrorInfo) {
    {
        let mut runs = inner.runs.lock();
        if let Some(entry) = runs.get_mut(run_id) {
            entry.run.error = Some(error.clone());
        }
    }
    if apply_transition(inner, run_id, RunStatus::Failed) {
        tracing::info!(run_id, error = %error, "run failed");
        let _ = inner
            .event_bus
            .get_sender()
            .send(Event::run_failed(run_id, error));
    }
}

fn transition(
    inner: &Arc<EngineInner>,
    run_id: &str,
    next: RunStatus,
    stage: Option<String>,
    message: &str,
) {
    if apply_transition(inner, run_id, next) {
        tracing::info!(run_id, status = %next, message, "run transition");
        let _ = inner
            .event_bus
            .get_sender()
            .send(Event::run_transition(run_id, next, stage, message));
    }
}

/// The single transition path: enforces the forward-only machine, stamps
/// completion time, and releases the execution guard on terminal states.
/// Returns whether the transition was applied (and should be published).
fn apply_transition(inner: &Arc<EngineInner>, run_id: &str, next: RunStatus) -> bool {
    let mut runs = inner.runs.lock();
    let Some(entry) = runs.get_mut(run_id) else {
        return false;
    };
    if !entry.run.status.can_transition_to(next) {
        tracing::error!(
            run_id,
            from = %entry.run.status,
            to = %next,
            "illegal run status transition suppressed"
        );
        return false;
    }
    entry.run.status = next;
    if next.is_terminal() {
        entry.run.finished_at = Some(chrono::Utc::now());
        entry.executing = false;
    }
    // send_replace updates the watched value even with no live receivers,
    // so a late wait_for_terminal never sees a stale status.
    entry.status_tx.send_replace(next);
    true
}

fn emit_stage_event(
    inner: &Arc<EngineInner>,
    run_id: &str,
    stage: &str,
    attempt: u32,
    scope: &str,
    message: String,
) {
    let _ = inner
        .event_bus
        .get_sender()
        .send(Event::stage_message(run_id, stage, attempt, scope, message));
}
