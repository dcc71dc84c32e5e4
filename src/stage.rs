//! The stage contract: one unit of pipeline work wrapping an external
//! collaborator.
//!
//! A stage consumes an immutable [`StateSnapshot`](crate::state::StateSnapshot)
//! plus its per-run typed options and produces a [`StageDelta`] — one or more
//! new namespaces and any artifact references — or a classified
//! [`StageError`]. Stages never mutate shared state directly and never see
//! another run's data.
//!
//! # Error classification
//!
//! The engine retries only what [`StageError::is_retryable`] admits:
//! transient collaborator failures and timeouts. Validation and contract
//! defects fail the run immediately; [`StageError::Cancelled`] is a clean
//! abort, not a failure.
//!
//! # Examples
//!
//! ```rust
//! use async_trait::async_trait;
//! use castflow::stage::{Stage, StageContext, StageDelta, StageError};
//! use castflow::state::StateSnapshot;
//! use serde_json::json;
//!
//! struct OutlineStage;
//!
//! #[async_trait]
//! impl Stage for OutlineStage {
//!     async fn run(
//!         &self,
//!         snapshot: StateSnapshot,
//!         ctx: StageContext,
//!     ) -> Result<StageDelta, StageError> {
//!         let research = snapshot
//!             .namespace("research_data")
//!             .ok_or_else(|| StageError::MissingInput {
//!                 namespace: "research_data".into(),
//!             })?;
//!         ctx.emit("outline", "building section list")?;
//!         Ok(StageDelta::new().with_namespace(
//!             "content_outline",
//!             json!({"sections": research["sources"]}),
//!         ))
//!     }
//! }
//! ```

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::RunParams;
use crate::engine::CancelToken;
use crate::event_bus::Event;
use crate::run::RunId;
use crate::state::StateSnapshot;
use crate::storage::{ArtifactStore, StorageError};

/// One named transformation step with a declared input/output contract.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Execute this stage against the current state snapshot.
    async fn run(&self, snapshot: StateSnapshot, ctx: StageContext)
    -> Result<StageDelta, StageError>;
}

/// Execution context handed to a stage for one attempt.
#[derive(Clone)]
pub struct StageContext {
    /// The run this attempt belongs to.
    pub run_id: RunId,
    /// Name of the executing stage.
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Validated per-run options; each stage reads its own record.
    pub params: Arc<RunParams>,
    /// Storage interface for artifact bytes.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Run-scoped cancellation view; long stages should poll this.
    pub cancel: CancelToken,
    /// Channel into the run's event stream.
    pub event_sender: flume::Sender<Event>,
}

impl StageContext {
    /// Emit a stage-scoped event enriched with this context's metadata.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), StageContextError> {
        self.event_sender
            .send(Event::stage_message(
                self.run_id.clone(),
                self.stage.clone(),
                self.attempt,
                scope,
                message,
            ))
            .map_err(|_| StageContextError::EventBusUnavailable)
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("stage", &self.stage)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Output of one successful stage attempt.
///
/// The delta must cover exactly the namespaces the stage's descriptor
/// declares; the engine rejects anything else as a contract violation.
#[derive(Clone, Debug, Default)]
pub struct StageDelta {
    /// New namespaces to merge into shared state.
    pub namespaces: FxHashMap<String, Value>,
    /// References to artifacts written through the storage interface.
    pub artifacts: Vec<crate::storage::ArtifactRef>,
}

impl StageDelta {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>, value: Value) -> Self {
        self.namespaces.insert(namespace.into(), value);
        self
    }

    #[must_use]
    pub fn with_artifact(mut self, artifact: crate::storage::ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Errors that can occur when using [`StageContext`] methods.
#[derive(Debug, Error, Diagnostic)]
pub enum StageContextError {
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(code(castflow::stage::event_bus_unavailable))]
    EventBusUnavailable,
}

/// Classified stage failure.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// A declared input namespace was absent from the snapshot. Fatal;
    /// indicates a plan defect, never retried.
    #[error("missing required input namespace: {namespace}")]
    #[diagnostic(
        code(castflow::stage::missing_input),
        help("Check that an earlier stage produces this namespace or that the request seeds it.")
    )]
    MissingInput { namespace: String },

    /// Input data failed the stage's own validation. Fatal.
    #[error("validation failed: {0}")]
    #[diagnostic(code(castflow::stage::validation))]
    Validation(String),

    /// Failure attributable to the external collaborator. Retried per the
    /// stage's policy.
    #[error("transient failure ({collaborator}): {message}")]
    #[diagnostic(code(castflow::stage::transient))]
    Transient {
        collaborator: &'static str,
        message: String,
    },

    /// The attempt exceeded the stage's timeout. Retryable.
    #[error("stage timed out after {0:?}")]
    #[diagnostic(code(castflow::stage::timeout))]
    Timeout(std::time::Duration),

    /// The stage broke its output contract or an internal invariant. Fatal;
    /// surfaced as a defect.
    #[error("stage contract violated: {0}")]
    #[diagnostic(code(castflow::stage::contract))]
    Contract(String),

    /// Clean cooperative abort. Not a failure; the run transitions to
    /// cancelled instead of failed.
    #[error("stage observed cancellation")]
    #[diagnostic(code(castflow::stage::cancelled))]
    Cancelled,

    /// JSON (de)serialization error inside the stage. Fatal.
    #[error(transparent)]
    #[diagnostic(code(castflow::stage::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Artifact storage failure.
    #[error(transparent)]
    #[diagnostic(code(castflow::stage::storage))]
    Storage(#[from] StorageError),

    /// Event bus communication error.
    #[error("event bus error: {0}")]
    #[diagnostic(code(castflow::stage::event_bus))]
    EventBus(#[from] StageContextError),
}

impl StageError {
    /// Whether the engine may retry the attempt under the stage's policy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout(_) | Self::Storage(StorageError::Write { .. })
        )
    }
}
