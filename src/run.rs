//! Run records and the run status state machine.
//!
//! A [`Run`] is one end-to-end traversal of the pipeline for a single
//! content request. Records are created on submission, mutated exclusively
//! by the execution engine, and become immutable once a terminal status is
//! reached. Status transitions are strictly forward:
//!
//! ```text
//! Pending → Running → { Completed | Failed | Cancelled }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RunParams;
use crate::storage::ArtifactRef;

/// Run identifier (`run_<stamp>_<suffix>`).
pub type RunId = String;

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Whether the status permits no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving to `next` respects the forward-only state machine.
    #[must_use]
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            // A cancel request may land before the run task ever starts.
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure detail recorded when a run fails.
///
/// Every failure is attributable to exactly one stage and attempt count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stage the failure occurred in.
    pub stage: String,
    /// Rendered message of the last error observed.
    pub message: String,
    /// Attempts consumed, the failing one included.
    pub attempts: u32,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage `{}` failed after {} attempt(s): {}",
            self.stage, self.attempts, self.message
        )
    }
}

/// One end-to-end pipeline execution for a single content request.
#[derive(Clone, Debug)]
pub struct Run {
    pub id: RunId,
    pub params: RunParams,
    pub status: RunStatus,
    /// Stage currently executing (or the stage that failed).
    pub current_stage: Option<String>,
    pub error: Option<ErrorInfo>,
    /// References to artifacts produced by completed stages.
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Fresh pending run for validated parameters.
    #[must_use]
    pub fn new(id: RunId, params: RunParams) -> Self {
        Self {
            id,
            params,
            status: RunStatus::Pending,
            current_stage: None,
            error: None,
            artifacts: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Read-only projection of a run answered to status queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub error: Option<ErrorInfo>,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunStatusView {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            current_stage: run.current_stage.clone(),
            error: run.error.clone(),
            artifacts: run.artifacts.clone(),
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}
