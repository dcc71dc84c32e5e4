//! # Castflow: Staged Content-Pipeline Orchestration
//!
//! Castflow sequences a fixed pipeline of transformation stages (research →
//! planning → script → voice → audio) over accumulating shared state, with
//! bounded retries, durable checkpoints, cooperative cancellation, and
//! scheduled runs. Stage content logic lives in external collaborators; this
//! crate owns only the orchestration.
//!
//! ## Core Concepts
//!
//! - **Stages**: Async units of work with declared input/output namespaces
//! - **SharedState**: Append-only, namespace-partitioned state per run
//! - **Plan**: A validated, linearized stage ordering compiled per run
//! - **Engine**: Drives plans, retries transient failures, checkpoints
//! - **Scheduler**: Fires deferred and recurring run requests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use castflow::config::{EpisodeKind, RunRequest};
//! use castflow::engine::ExecutionEngine;
//! use castflow::pipeline;
//! # use castflow::stage::{Stage, StageContext, StageDelta, StageError};
//! # use castflow::state::StateSnapshot;
//! # use async_trait::async_trait;
//! # struct Stub(&'static str);
//! # #[async_trait]
//! # impl Stage for Stub {
//! #     async fn run(&self, _: StateSnapshot, _: StageContext) -> Result<StageDelta, StageError> {
//! #         Ok(StageDelta::new().with_namespace(self.0, serde_json::json!({})))
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = pipeline::standard_registry(
//!     Stub(pipeline::namespaces::RESEARCH_DATA),
//!     Stub(pipeline::namespaces::CONTENT_OUTLINE),
//!     Stub(pipeline::namespaces::SCRIPT),
//!     Stub(pipeline::namespaces::AUDIO_METADATA),
//!     Stub(pipeline::namespaces::PRODUCTION_METADATA),
//! );
//!
//! let engine = ExecutionEngine::builder()
//!     .registry(registry)
//!     .plan(pipeline::standard_plan())
//!     .build();
//!
//! let request = RunRequest::new(EpisodeKind::RaceReview).with_event_id("gp-monza-2025");
//! let run_id = engine.submit(&request)?;
//! let final_view = engine.wait_for_terminal(&run_id).await?;
//! println!("run {} finished as {}", final_view.run_id, final_view.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Execution Guarantees
//!
//! - Run status moves strictly forward through
//!   `pending → running → {completed | failed | cancelled}`.
//! - Within one run, stage *i + 1* never starts before stage *i*'s delta is
//!   merged and checkpointed; across runs, progress is independent.
//! - A namespace written by one stage is never overwritten by a later one.
//! - Checkpoint indices per run are contiguous from 0, so resuming after a
//!   failure continues from the first uncompleted stage, never repeating a
//!   committed one.
//!
//! ## Module Guide
//!
//! - [`stage`] - Stage trait, execution context, error taxonomy
//! - [`state`] - Append-only shared state and snapshots
//! - [`config`] - Typed per-stage option records and request validation
//! - [`plan`] - Stage registry, ordering builder, per-run compilation
//! - [`engine`] - Run execution, retries, cancellation, resume
//! - [`checkpoint`] - Checkpoint store trait and in-memory binding
//! - [`scheduler`] - Deferred/recurring runs with explicit catch-up policy
//! - [`tracker`] - Event-fed read-only status projection
//! - [`event_bus`] - Run lifecycle event stream and sinks
//! - [`storage`] - Abstract artifact storage for stage outputs
//! - [`pipeline`] - The standard five-stage wiring

pub mod checkpoint;
#[cfg(feature = "sqlite")]
pub mod checkpoint_sqlite;
pub mod config;
pub mod engine;
pub mod event_bus;
pub mod ids;
pub mod persistence;
pub mod pipeline;
pub mod plan;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod stage;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod tracker;
