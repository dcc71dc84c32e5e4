//! The standard five-stage content pipeline.
//!
//! Wiring only: stage *implementations* are external collaborators supplied
//! by the embedding application (or test doubles). This module fixes their
//! names, namespace contracts, default retry/timeout budgets, ordering, and
//! the text-only routing rule, so every deployment of the pipeline agrees on
//! the plan shape.
//!
//! ```text
//! research → content_planning → script_generation → voice_synthesis → audio_production
//! ```
//!
//! A run with [`OutputStyle::TextOnly`](crate::config::OutputStyle) drops the
//! last two stages at plan compile time.

use std::sync::Arc;
use std::time::Duration;

use crate::config::OutputStyle;
use crate::plan::{PlanBuilder, StageDescriptor, StageRegistry};
use crate::retry::RetryPolicy;
use crate::stage::Stage;

/// Stage names, used as option-section keys and checkpoint labels.
pub mod names {
    pub const RESEARCH: &str = "research";
    pub const CONTENT_PLANNING: &str = "content_planning";
    pub const SCRIPT_GENERATION: &str = "script_generation";
    pub const VOICE_SYNTHESIS: &str = "voice_synthesis";
    pub const AUDIO_PRODUCTION: &str = "audio_production";
}

/// Namespace names owned by each stage (plus the request seed).
pub mod namespaces {
    /// Seeded from the validated run request before the first stage.
    pub const REQUEST: &str = "request";
    pub const RESEARCH_DATA: &str = "research_data";
    pub const CONTENT_OUTLINE: &str = "content_outline";
    pub const SCRIPT: &str = "script";
    pub const AUDIO_METADATA: &str = "audio_metadata";
    pub const PRODUCTION_METADATA: &str = "production_metadata";
}

/// Descriptors for the five standard stages.
///
/// Every stage gets three attempts with exponential backoff from two
/// seconds; synthesis and production get wider timeouts since they wait on
/// external audio services.
#[must_use]
pub fn standard_descriptors() -> Vec<StageDescriptor> {
    let retry = RetryPolicy::new(3, Duration::from_secs(2)).with_max_delay(Duration::from_secs(60));
    vec![
        StageDescriptor::new(names::RESEARCH)
            .requires(namespaces::REQUEST)
            .produces(namespaces::RESEARCH_DATA)
            .with_retry(retry)
            .with_timeout(Duration::from_secs(300)),
        StageDescriptor::new(names::CONTENT_PLANNING)
            .requires(namespaces::RESEARCH_DATA)
            .produces(namespaces::CONTENT_OUTLINE)
            .with_retry(retry)
            .with_timeout(Duration::from_secs(120)),
        StageDescriptor::new(names::SCRIPT_GENERATION)
            .requires(namespaces::CONTENT_OUTLINE)
            .produces(namespaces::SCRIPT)
            .with_retry(retry)
            .with_timeout(Duration::from_secs(300)),
        StageDescriptor::new(names::VOICE_SYNTHESIS)
            .requires(namespaces::SCRIPT)
            .produces(namespaces::AUDIO_METADATA)
            .with_retry(retry)
            .with_timeout(Duration::from_secs(900)),
        StageDescriptor::new(names::AUDIO_PRODUCTION)
            .requires(namespaces::AUDIO_METADATA)
            .requires(namespaces::SCRIPT)
            .produces(namespaces::PRODUCTION_METADATA)
            .with_retry(retry)
            .with_timeout(Duration::from_secs(900)),
    ]
}

/// Registry of the standard stages with caller-supplied implementations.
#[must_use]
pub fn standard_registry<R, P, S, V, A>(
    research: R,
    planning: P,
    script: S,
    voice: V,
    audio: A,
) -> StageRegistry
where
    R: Stage + 'static,
    P: Stage + 'static,
    S: Stage + 'static,
    V: Stage + 'static,
    A: Stage + 'static,
{
    let mut descriptors = standard_descriptors().into_iter();
    let mut registry = StageRegistry::new();
    registry.register(descriptors.next().expect("five descriptors"), research);
    registry.register(descriptors.next().expect("five descriptors"), planning);
    registry.register(descriptors.next().expect("five descriptors"), script);
    registry.register(descriptors.next().expect("five descriptors"), voice);
    registry.register(descriptors.next().expect("five descriptors"), audio);
    registry
}

/// The standard ordering, routing rules, and terminal outputs.
#[must_use]
pub fn standard_plan() -> PlanBuilder {
    let text_only: crate::plan::SkipPredicate =
        Arc::new(|params| params.output_style == OutputStyle::TextOnly);
    PlanBuilder::new()
        .add_entry(names::RESEARCH)
        .add_edge(names::RESEARCH, names::CONTENT_PLANNING)
        .add_edge(names::CONTENT_PLANNING, names::SCRIPT_GENERATION)
        .add_edge(names::SCRIPT_GENERATION, names::VOICE_SYNTHESIS)
        .add_edge(names::VOICE_SYNTHESIS, names::AUDIO_PRODUCTION)
        .add_skip_rule(
            names::VOICE_SYNTHESIS,
            "text-only run",
            Arc::clone(&text_only),
        )
        .add_skip_rule(names::AUDIO_PRODUCTION, "text-only run", text_only)
        .require_output(namespaces::SCRIPT)
        .require_output(namespaces::PRODUCTION_METADATA)
}
