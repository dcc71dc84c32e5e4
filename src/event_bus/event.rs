use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::{ErrorInfo, RunId, RunStatus};
use crate::storage::ArtifactRef;

/// Events published on the bus during run execution.
///
/// Run transitions are the feed the status tracker projects from; stage and
/// diagnostic events exist for logging sinks and live dashboards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    Run(RunTransitionEvent),
    Stage(StageEvent),
    Diagnostic(DiagnosticEvent),
}

/// A run status transition, published exactly once per transition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunTransitionEvent {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Stage in flight (or at fault) when the transition happened.
    pub stage: Option<String>,
    /// Failure detail, present on transitions to `Failed`.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    pub message: String,
    pub when: DateTime<Utc>,
}

/// A message emitted from inside a stage attempt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageEvent {
    pub run_id: RunId,
    pub stage: String,
    pub attempt: u32,
    pub scope: String,
    pub message: String,
    /// Artifact references committed with this stage, if any.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub when: DateTime<Utc>,
}

/// Out-of-band diagnostics from the engine or scheduler.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}

impl Event {
    pub fn run_transition(
        run_id: impl Into<RunId>,
        status: RunStatus,
        stage: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Event::Run(RunTransitionEvent {
            run_id: run_id.into(),
            status,
            stage,
            error: None,
            message: message.into(),
            when: Utc::now(),
        })
    }

    /// Transition to `Failed` carrying the recorded failure detail.
    pub fn run_failed(run_id: impl Into<RunId>, error: ErrorInfo) -> Self {
        let message = error.to_string();
        Event::Run(RunTransitionEvent {
            run_id: run_id.into(),
            status: RunStatus::Failed,
            stage: Some(error.stage.clone()),
            error: Some(error),
            message,
            when: Utc::now(),
        })
    }

    pub fn stage_message(
        run_id: impl Into<RunId>,
        stage: impl Into<String>,
        attempt: u32,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Event::Stage(StageEvent {
            run_id: run_id.into(),
            stage: stage.into(),
            attempt,
            scope: scope.into(),
            message: message.into(),
            artifacts: Vec::new(),
            when: Utc::now(),
        })
    }

    /// Stage commit notification carrying the artifacts it produced.
    pub fn stage_committed(
        run_id: impl Into<RunId>,
        stage: impl Into<String>,
        attempt: u32,
        plan_index: usize,
        artifacts: Vec<ArtifactRef>,
    ) -> Self {
        Event::Stage(StageEvent {
            run_id: run_id.into(),
            stage: stage.into(),
            attempt,
            scope: "committed".to_string(),
            message: format!("stage committed at plan index {plan_index}"),
            artifacts,
            when: Utc::now(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    /// Scope label used by sinks for filtering.
    #[must_use]
    pub fn scope_label(&self) -> &str {
        match self {
            Event::Run(run) => run.status.as_str(),
            Event::Stage(stage) => &stage.scope,
            Event::Diagnostic(diag) => &diag.scope,
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Event::Run(run) => &run.message,
            Event::Stage(stage) => &stage.message,
            Event::Diagnostic(diag) => &diag.message,
        }
    }

    /// The run the event belongs to, when it is run-scoped.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Event::Run(run) => Some(&run.run_id),
            Event::Stage(stage) => Some(&stage.run_id),
            Event::Diagnostic(_) => None,
        }
    }
}
