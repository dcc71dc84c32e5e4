//! Fluent construction of the pipeline's ordering and routing rules.

use std::sync::Arc;

use crate::config::RunParams;

/// Predicate deciding, from the validated run parameters, whether a stage is
/// dropped from this run's plan.
///
/// Skip rules are the explicit form of conditional routing: they are
/// evaluated once per run while the plan compiles, never inferred from what
/// a stage happens to output at runtime.
pub type SkipPredicate = Arc<dyn Fn(&RunParams) -> bool + Send + Sync + 'static>;

/// A conditional stage skip with a human-readable reason for logs.
#[derive(Clone)]
pub struct SkipRule {
    pub(crate) stage: String,
    pub(crate) predicate: SkipPredicate,
    pub(crate) reason: &'static str,
}

impl SkipRule {
    pub fn new(stage: impl Into<String>, reason: &'static str, predicate: SkipPredicate) -> Self {
        Self {
            stage: stage.into(),
            predicate,
            reason,
        }
    }
}

/// Builder for the ordering/branching specification of a pipeline.
///
/// Entries mark the stages that may run first; edges order the rest. The
/// builder itself is cheap and reusable — [`compile`](PlanBuilder::compile)
/// is invoked once per run against that run's parameters.
///
/// # Examples
///
/// ```rust
/// use castflow::plan::PlanBuilder;
///
/// let builder = PlanBuilder::new()
///     .add_entry("research")
///     .add_edge("research", "content_planning")
///     .add_edge("content_planning", "script_generation")
///     .require_output("script");
/// ```
#[derive(Clone, Default)]
pub struct PlanBuilder {
    pub(crate) entries: Vec<String>,
    pub(crate) edges: Vec<(String, String)>,
    pub(crate) skip_rules: Vec<SkipRule>,
    /// Namespaces the finished run must have produced.
    pub(crate) required_outputs: Vec<String>,
}

impl PlanBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a stage as an entry point of the pipeline.
    #[must_use]
    pub fn add_entry(mut self, stage: impl Into<String>) -> Self {
        self.entries.push(stage.into());
        self
    }

    /// Orders `to` after `from`.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Adds a conditional skip evaluated against the run's parameters at
    /// compile time.
    #[must_use]
    pub fn add_skip_rule(
        mut self,
        stage: impl Into<String>,
        reason: &'static str,
        predicate: SkipPredicate,
    ) -> Self {
        self.skip_rules.push(SkipRule::new(stage, reason, predicate));
        self
    }

    /// Declares a terminal output namespace the compiled plan must reach.
    #[must_use]
    pub fn require_output(mut self, namespace: impl Into<String>) -> Self {
        self.required_outputs.push(namespace.into());
        self
    }
}
