//! Deferred and recurring run scheduling.
//!
//! The scheduler owns a table of [`ScheduledJob`]s shared between its timing
//! loop and external submit/cancel calls. A tick finds jobs whose
//! `next_fire_time` has passed, submits a run built from each job's request
//! template, reschedules recurring jobs, and removes one-shots.
//!
//! # Missed triggers
//!
//! When the process was down past a recurring job's fire time, the behavior
//! is explicit configuration, never inference:
//!
//! - [`CatchUp::FireOnce`] — fire one immediate run, then skip to the next
//!   future occurrence.
//! - [`CatchUp::SkipToNext`] — fire nothing, skip to the next future
//!   occurrence.
//!
//! A recurring trigger counts as *missed* (rather than simply due) once the
//! tick observes it at least one whole period late; within one period of the
//! fire time it fires normally under either policy. One-shot jobs have no
//! next occurrence to skip to, so a late one-shot fires once under either
//! policy and is removed.

use chrono::{DateTime, TimeDelta, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::oneshot, task};
use tracing::instrument;

use crate::config::{ConfigError, RunParams, RunRequest};
use crate::engine::{EngineError, ExecutionEngine};
use crate::ids::IdGenerator;
use crate::run::RunId;

/// Scheduled-job identifier (`job_<stamp>_<suffix>`).
pub type JobId = String;

/// When and how often a job fires.
#[derive(Clone, Debug)]
pub enum Trigger {
    /// Fire once at the given instant, then delete the job.
    Once(DateTime<Utc>),
    /// Fire at `first` and then every `period` thereafter.
    Every {
        first: DateTime<Utc>,
        period: Duration,
    },
}

/// Catch-up policy for recurring triggers missed while the scheduler was
/// offline. See the module docs for exact semantics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUp {
    FireOnce,
    /// Never replay a backlog; the original system's behavior.
    #[default]
    SkipToNext,
}

/// A deferred or recurring request to submit a new run.
#[derive(Clone, Debug)]
pub struct ScheduledJob {
    pub id: JobId,
    pub request: RunRequest,
    pub trigger: Trigger,
    /// Next instant this job is due. The scheduler is the sole writer.
    pub next_fire_time: DateTime<Utc>,
}

/// Read-only job projection for listings.
#[derive(Clone, Debug)]
pub struct ScheduledJobView {
    pub job_id: JobId,
    pub event_id: Option<String>,
    pub next_fire_time: DateTime<Utc>,
    pub recurring: bool,
}

/// Scheduler failures.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("scheduled job not found: {job_id}")]
    #[diagnostic(code(castflow::scheduler::job_not_found))]
    JobNotFound { job_id: JobId },

    /// The job template failed validation at submission time.
    #[error(transparent)]
    #[diagnostic(code(castflow::scheduler::config))]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(code(castflow::scheduler::engine))]
    Engine(#[from] EngineError),
}

/// Holds deferred/recurring run requests and feeds due ones to the engine.
#[derive(Clone)]
pub struct Scheduler {
    jobs: Arc<Mutex<FxHashMap<JobId, ScheduledJob>>>,
    engine: ExecutionEngine,
    catch_up: CatchUp,
    ids: IdGenerator,
}

impl Scheduler {
    /// Scheduler with the default [`CatchUp::SkipToNext`] policy.
    #[must_use]
    pub fn new(engine: ExecutionEngine) -> Self {
        Self::with_catch_up(engine, CatchUp::default())
    }

    #[must_use]
    pub fn with_catch_up(engine: ExecutionEngine, catch_up: CatchUp) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(FxHashMap::default())),
            engine,
            catch_up,
            ids: IdGenerator::new(),
        }
    }

    /// Schedules a one-shot run at `when`.
    ///
    /// The request template is validated now, so a malformed job is rejected
    /// at submission instead of failing silently at fire time.
    #[instrument(skip(self, request), err)]
    pub fn schedule_at(
        &self,
        request: RunRequest,
        when: DateTime<Utc>,
    ) -> Result<JobId, SchedulerError> {
        RunParams::validate(&request)?;
        Ok(self.insert(request, Trigger::Once(when), when))
    }

    /// Schedules a recurring run, first firing at `first`.
    #[instrument(skip(self, request), err)]
    pub fn schedule_every(
        &self,
        request: RunRequest,
        first: DateTime<Utc>,
        period: Duration,
    ) -> Result<JobId, SchedulerError> {
        RunParams::validate(&request)?;
        Ok(self.insert(request, Trigger::Every { first, period }, first))
    }

    fn insert(&self, request: RunRequest, trigger: Trigger, next: DateTime<Utc>) -> JobId {
        let job_id = self.ids.generate_job_id();
        let job = ScheduledJob {
            id: job_id.clone(),
            request,
            trigger,
            next_fire_time: next,
        };
        self.jobs.lock().insert(job_id.clone(), job);
        tracing::info!(job_id, next_fire = %next, "job scheduled");
        job_id
    }

    /// Deletes a job before it fires (or between recurrences).
    pub fn cancel_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        match self.jobs.lock().remove(job_id) {
            Some(_) => {
                tracing::info!(job_id, "job cancelled");
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    /// Pending jobs, soonest first, optionally filtered by event id.
    #[must_use]
    pub fn list_jobs(&self, event_id: Option<&str>) -> Vec<ScheduledJobView> {
        let jobs = self.jobs.lock();
        let mut views: Vec<ScheduledJobView> = jobs
            .values()
            .filter(|job| match event_id {
                Some(filter) => job.request.event_id.as_deref() == Some(filter),
                None => true,
            })
            .map(|job| ScheduledJobView {
                job_id: job.id.clone(),
                event_id: job.request.event_id.clone(),
                next_fire_time: job.next_fire_time,
                recurring: matches!(job.trigger, Trigger::Every { .. }),
            })
            .collect();
        views.sort_by_key(|view| view.next_fire_time);
        views
    }

    /// Evaluates every job against `now`, submitting runs for due triggers.
    ///
    /// Returns the ids of runs submitted this tick. Exposed with an injected
    /// clock so catch-up behavior is testable without waiting on timers.
    #[instrument(skip(self))]
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<RunId> {
        let due: Vec<ScheduledJob> = {
            let jobs = self.jobs.lock();
            jobs.values()
                .filter(|job| job.next_fire_time <= now)
                .cloned()
                .collect()
        };

        let mut fired = Vec::new();
        for job in due {
            match job.trigger {
                Trigger::Once(_) => {
                    // No next occurrence to skip to: a late one-shot still
                    // fires once under either catch-up policy.
                    if let Some(run_id) = self.fire(&job) {
                        fired.push(run_id);
                    }
                    self.jobs.lock().remove(&job.id);
                }
                Trigger::Every { first, period } => {
                    let missed = now >= job.next_fire_time + period_delta(period);
                    let fire = !missed || self.catch_up == CatchUp::FireOnce;
                    if fire && let Some(run_id) = self.fire(&job) {
                        fired.push(run_id);
                    }
                    if missed && !fire {
                        tracing::info!(
                            job_id = %job.id,
                            missed_since = %job.next_fire_time,
                            "missed trigger skipped to next occurrence"
                        );
                    }
                    let next = next_occurrence_after(first, period, now);
                    if let Some(entry) = self.jobs.lock().get_mut(&job.id) {
                        entry.next_fire_time = next;
                    }
                }
            }
        }
        fired
    }

    fn fire(&self, job: &ScheduledJob) -> Option<RunId> {
        match self.engine.submit(&job.request) {
            Ok(run_id) => {
                tracing::info!(job_id = %job.id, run_id, "scheduled run submitted");
                Some(run_id)
            }
            Err(e) => {
                // Validated at schedule time, so this is an engine fault;
                // the job stays (or is removed) per its trigger either way.
                tracing::warn!(job_id = %job.id, error = %e, "scheduled submission failed");
                None
            }
        }
    }

    /// Spawns the timing loop, ticking every `poll_interval`.
    #[must_use]
    pub fn spawn(&self, poll_interval: Duration) -> SchedulerHandle {
        let scheduler = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = task::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        scheduler.tick(Utc::now());
                    }
                }
            }
        });
        SchedulerHandle {
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }
}

/// Handle for a running timing loop; stops the loop on [`stop`](Self::stop)
/// or drop.
pub struct SchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the timing loop and waits for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

fn period_delta(period: Duration) -> TimeDelta {
    TimeDelta::from_std(period).unwrap_or_else(|_| TimeDelta::seconds(1))
}

/// First occurrence of the `first + k * period` series strictly after `now`.
fn next_occurrence_after(
    first: DateTime<Utc>,
    period: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let step = period_delta(period).max(TimeDelta::milliseconds(1));
    if first > now {
        return first;
    }
    let elapsed_ms = (now - first).num_milliseconds();
    let step_ms = step.num_milliseconds().max(1);
    let next_k = elapsed_ms / step_ms + 1;
    first + TimeDelta::milliseconds(next_k * step_ms)
}
