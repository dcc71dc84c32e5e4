//! Workflow plan definition and per-run compilation.
//!
//! A plan is assembled in two layers: a [`StageRegistry`] holding each
//! stage's declared contract and implementation, and a [`PlanBuilder`]
//! holding the ordering, entry points, conditional skip rules, and required
//! terminal outputs. [`PlanBuilder::compile`] validates the combination for
//! one run and yields the linearized [`WorkflowPlan`] the engine executes.

mod builder;
mod compile;
mod registry;

pub use builder::{PlanBuilder, SkipPredicate, SkipRule};
pub use compile::{PlanError, PlannedStage, WorkflowPlan};
pub use registry::{StageDescriptor, StageRegistry};
