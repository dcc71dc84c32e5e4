//! Durable snapshots of run state, keyed by run id and stage index.
//!
//! The engine persists one checkpoint strictly *after* each successful stage
//! merge, so a checkpoint at index `i` always certifies that stages `0..=i`
//! of the compiled plan are committed. Indices for a run are therefore
//! strictly increasing and contiguous from 0 — a gap or repeat means the
//! engine itself is broken, and [`CheckpointStore::put`] fails fatally
//! rather than papering over it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::run::RunId;
use crate::state::SharedState;

/// Snapshot of a run's shared state as of one completed stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub run_id: RunId,
    /// Index of the completed stage in the compiled plan, from 0.
    pub stage_index: u32,
    pub stage_name: String,
    pub state: SharedState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        run_id: impl Into<RunId>,
        stage_index: u32,
        stage_name: impl Into<String>,
        state: &SharedState,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage_index,
            stage_name: stage_name.into(),
            state: state.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Checkpoint store failures.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    /// `put` was called with a non-contiguous stage index. This indicates an
    /// engine bug and is fatal, not recoverable by retry.
    #[error(
        "out-of-order checkpoint for run `{run_id}`: expected stage index {expected}, got {got}"
    )]
    #[diagnostic(
        code(castflow::checkpoint::out_of_order),
        help("Checkpoint indices must be contiguous from 0; this is an engine defect.")
    )]
    OutOfOrder {
        run_id: RunId,
        expected: u32,
        got: u32,
    },

    #[error(transparent)]
    #[diagnostic(code(castflow::checkpoint::persistence))]
    Persistence(#[from] PersistenceError),

    /// Backend-specific failure (connection, SQL, filesystem).
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(castflow::checkpoint::backend))]
    Backend { message: String },
}

/// Durable storage for run checkpoints.
///
/// Single-writer-per-run semantics are assumed: the engine serializes its
/// own writes with any resume operation through a per-run execution guard,
/// so implementations do not need cross-writer conflict handling.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist one checkpoint. Must be called with strictly increasing,
    /// contiguous `stage_index` per run.
    async fn put(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError>;

    /// The highest-index checkpoint for a run, if any exist.
    async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// All checkpoints for a run, ordered by stage index.
    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Ids of every run with at least one checkpoint.
    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError>;
}

/// Volatile store for tests and development.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    inner: Arc<Mutex<FxHashMap<RunId, Vec<Checkpoint>>>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock();
        let sequence = inner.entry(checkpoint.run_id.clone()).or_default();
        let expected = sequence.len() as u32;
        if checkpoint.stage_index != expected {
            return Err(CheckpointError::OutOfOrder {
                run_id: checkpoint.run_id,
                expected,
                got: checkpoint.stage_index,
            });
        }
        sequence.push(checkpoint);
        Ok(())
    }

    async fn latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .inner
            .lock()
            .get(run_id)
            .and_then(|seq| seq.last().cloned()))
    }

    async fn list(&self, run_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self.inner.lock().get(run_id).cloned().unwrap_or_default())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, CheckpointError> {
        Ok(self.inner.lock().keys().cloned().collect())
    }
}
