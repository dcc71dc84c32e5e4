//! Per-run plan compilation and validation.
//!
//! Compilation turns the builder's ordering specification plus the registry
//! into an executable, linearized [`WorkflowPlan`] for one run. Everything
//! that can be checked before execution is checked here: unknown or
//! duplicate stages, cycles, unsatisfiable input namespaces, unreachable
//! terminal outputs. A compile failure is reported before any stage runs.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use super::builder::PlanBuilder;
use super::registry::{StageDescriptor, StageRegistry};
use crate::config::RunParams;
use crate::stage::Stage;

/// One executable slot of a compiled plan.
#[derive(Clone)]
pub struct PlannedStage {
    pub descriptor: StageDescriptor,
    pub stage: Arc<dyn Stage>,
}

impl PlannedStage {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// A validated, linearized plan for one run.
///
/// Skipped stages are absent entirely, so plan indices — and therefore
/// checkpoint indices — are contiguous regardless of routing decisions.
#[derive(Clone)]
pub struct WorkflowPlan {
    stages: Vec<PlannedStage>,
    skipped: Vec<(String, &'static str)>,
}

impl std::fmt::Debug for WorkflowPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowPlan")
            .field(
                "stages",
                &self.stages.iter().map(PlannedStage::name).collect::<Vec<_>>(),
            )
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl WorkflowPlan {
    #[must_use]
    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages dropped by skip rules for this run, with reasons.
    #[must_use]
    pub fn skipped(&self) -> &[(String, &'static str)] {
        &self.skipped
    }

    /// Plan index of a stage by name.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }
}

/// Plan validation failures.
#[derive(Debug, Error, Diagnostic)]
pub enum PlanError {
    #[error("plan has no entry stage")]
    #[diagnostic(
        code(castflow::plan::no_entry),
        help("Mark at least one stage with add_entry.")
    )]
    NoEntryStage,

    #[error("stage `{name}` is not registered")]
    #[diagnostic(code(castflow::plan::unknown_stage))]
    UnknownStage { name: String },

    #[error("stage `{name}` registered more than once")]
    #[diagnostic(code(castflow::plan::duplicate_stage))]
    DuplicateStage { name: String },

    #[error("stage ordering contains a cycle through: {stages:?}")]
    #[diagnostic(
        code(castflow::plan::cycle),
        help("Stage edges must form a directed acyclic ordering.")
    )]
    CycleDetected { stages: Vec<String> },

    #[error("stage `{stage}` requires namespace `{namespace}`, which no earlier stage produces")]
    #[diagnostic(
        code(castflow::plan::missing_input),
        help("Produce the namespace upstream, seed it in the request, or skip this stage too.")
    )]
    MissingInput { stage: String, namespace: String },

    #[error("required output namespace `{namespace}` is not produced by any planned stage")]
    #[diagnostic(code(castflow::plan::unreachable_output))]
    UnreachableOutput { namespace: String },
}

impl PlanBuilder {
    /// Compiles the plan for one run.
    ///
    /// `initial_namespaces` lists the namespaces seeded from the run request
    /// before the first stage executes. Skip rules are evaluated against
    /// `params` first; namespace validation runs on what remains, so a plan
    /// that skips the producer of a still-needed namespace is rejected here
    /// rather than failing mid-run.
    pub fn compile(
        &self,
        registry: &StageRegistry,
        params: &RunParams,
        initial_namespaces: &[&str],
    ) -> Result<WorkflowPlan, PlanError> {
        if let Some(name) = registry.duplicates.first() {
            return Err(PlanError::DuplicateStage { name: name.clone() });
        }
        if self.entries.is_empty() {
            return Err(PlanError::NoEntryStage);
        }
        for name in self
            .entries
            .iter()
            .chain(self.edges.iter().flat_map(|(a, b)| [a, b]))
        {
            if !registry.contains(name) {
                return Err(PlanError::UnknownStage { name: name.clone() });
            }
        }

        // Stages reachable from the entries; anything else is simply unused.
        let mut adjacency: FxHashMap<&str, Vec<&str>> = FxHashMap::default();
        for (from, to) in &self.edges {
            adjacency.entry(from.as_str()).or_default().push(to.as_str());
        }
        let mut reachable: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = self.entries.iter().map(String::as_str).collect();
        while let Some(name) = queue.pop_front() {
            if reachable.insert(name)
                && let Some(children) = adjacency.get(name)
            {
                queue.extend(children.iter().copied());
            }
        }

        let order = topological_order(&reachable, &adjacency, &self.entries)?;

        let skipped: Vec<(String, &'static str)> = self
            .skip_rules
            .iter()
            .filter(|rule| reachable.contains(rule.stage.as_str()) && (rule.predicate)(params))
            .map(|rule| (rule.stage.clone(), rule.reason))
            .collect();
        let skipped_names: FxHashSet<&str> =
            skipped.iter().map(|(name, _)| name.as_str()).collect();

        let mut stages = Vec::new();
        let mut available: FxHashSet<String> = initial_namespaces
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        for name in &order {
            if skipped_names.contains(name.as_str()) {
                continue;
            }
            let entry = registry
                .entries
                .get(name)
                .expect("reachable stages were checked against the registry");
            for namespace in &entry.descriptor.requires {
                if !available.contains(namespace) {
                    return Err(PlanError::MissingInput {
                        stage: name.clone(),
                        namespace: namespace.clone(),
                    });
                }
            }
            available.extend(entry.descriptor.produces.iter().cloned());
            stages.push(PlannedStage {
                descriptor: entry.descriptor.clone(),
                stage: Arc::clone(&entry.stage),
            });
        }

        for namespace in &self.required_outputs {
            // Outputs owed only by skipped stages are not required of this run.
            let owed = registry.entries.values().any(|entry| {
                entry.descriptor.produces.contains(namespace)
                    && skipped_names.contains(entry.descriptor.name.as_str())
            });
            if !available.contains(namespace) && !owed {
                return Err(PlanError::UnreachableOutput {
                    namespace: namespace.clone(),
                });
            }
        }

        for (name, reason) in &skipped {
            tracing::debug!(stage = %name, reason, "stage skipped by routing rule");
        }

        Ok(WorkflowPlan { stages, skipped })
    }
}

/// Kahn's algorithm over the reachable subgraph. Deterministic: ties break
/// in entry/edge insertion order.
fn topological_order(
    reachable: &FxHashSet<&str>,
    adjacency: &FxHashMap<&str, Vec<&str>>,
    entries: &[String],
) -> Result<Vec<String>, PlanError> {
    let mut indegree: FxHashMap<&str, usize> = reachable.iter().map(|n| (*n, 0)).collect();
    for (from, children) in adjacency {
        if !reachable.contains(from) {
            continue;
        }
        for &child in children {
            if let Some(count) = indegree.get_mut(child) {
                *count += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = entries
        .iter()
        .map(String::as_str)
        .filter(|n| indegree.get(n) == Some(&0))
        .collect();
    let mut seen_in_queue: FxHashSet<&str> = queue.iter().copied().collect();
    let mut order = Vec::with_capacity(reachable.len());

    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        if let Some(children) = adjacency.get(name) {
            for &child in children {
                let Some(count) = indegree.get_mut(child) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 && seen_in_queue.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    if order.len() != reachable.len() {
        let mut stuck: Vec<String> = reachable
            .iter()
            .filter(|n| !order.iter().any(|o| o == *n))
            .map(|n| (*n).to_string())
            .collect();
        stuck.sort();
        return Err(PlanError::CycleDetected { stages: stuck });
    }
    Ok(order)
}
