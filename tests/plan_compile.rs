//! Plan compilation and validation.

mod common;

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

use castflow::config::{EpisodeKind, OutputStyle, RunParams, RunRequest};
use castflow::pipeline::{self, names, namespaces};
use castflow::plan::{PlanBuilder, PlanError, StageDescriptor, StageRegistry};

use common::{MockBehavior, MockStage, fast_retry, scripted_registry};

fn default_params() -> RunParams {
    RunParams::validate(&RunRequest::new(EpisodeKind::RaceReview)).unwrap()
}

fn standard_registry() -> StageRegistry {
    let (registry, _) = scripted_registry(
        &FxHashMap::default(),
        fast_retry(),
        Duration::from_secs(5),
    );
    registry
}

#[test]
fn standard_plan_linearizes_in_pipeline_order() {
    let registry = standard_registry();
    let plan = pipeline::standard_plan()
        .compile(&registry, &default_params(), &[namespaces::REQUEST])
        .unwrap();

    let order: Vec<&str> = plan.stages().iter().map(|s| s.name()).collect();
    assert_eq!(
        order,
        vec![
            names::RESEARCH,
            names::CONTENT_PLANNING,
            names::SCRIPT_GENERATION,
            names::VOICE_SYNTHESIS,
            names::AUDIO_PRODUCTION,
        ]
    );
    assert!(plan.skipped().is_empty());
}

#[test]
fn text_only_run_drops_audio_stages_at_compile_time() {
    let registry = standard_registry();
    let params = RunParams::validate(
        &RunRequest::new(EpisodeKind::RaceReview).with_output_style(OutputStyle::TextOnly),
    )
    .unwrap();
    let plan = pipeline::standard_plan()
        .compile(&registry, &params, &[namespaces::REQUEST])
        .unwrap();

    assert_eq!(plan.len(), 3);
    assert!(plan.position(names::VOICE_SYNTHESIS).is_none());
    assert!(plan.position(names::AUDIO_PRODUCTION).is_none());
    // Remaining indices are contiguous regardless of the skips.
    assert_eq!(plan.position(names::SCRIPT_GENERATION), Some(2));
    assert_eq!(plan.skipped().len(), 2);
}

#[test]
fn cycle_is_rejected() {
    let (a, _) = MockStage::new(&["out_a"], MockBehavior::Succeed);
    let (b, _) = MockStage::new(&["out_b"], MockBehavior::Succeed);
    let registry = StageRegistry::new()
        .with_stage(StageDescriptor::new("a").produces("out_a"), a)
        .with_stage(StageDescriptor::new("b").produces("out_b"), b);

    let result = PlanBuilder::new()
        .add_entry("a")
        .add_edge("a", "b")
        .add_edge("b", "a")
        .compile(&registry, &default_params(), &[]);
    assert!(matches!(result, Err(PlanError::CycleDetected { .. })));
}

#[test]
fn missing_input_namespace_is_rejected_before_execution() {
    let (stage, _) = MockStage::new(&["late"], MockBehavior::Succeed);
    let registry = StageRegistry::new().with_stage(
        StageDescriptor::new("needy").requires("never_produced").produces("late"),
        stage,
    );

    let result = PlanBuilder::new()
        .add_entry("needy")
        .compile(&registry, &default_params(), &["request"]);
    match result {
        Err(PlanError::MissingInput { stage, namespace }) => {
            assert_eq!(stage, "needy");
            assert_eq!(namespace, "never_produced");
        }
        other => panic!("expected MissingInput, got {other:?}"),
    }
}

#[test]
fn skipping_a_producer_invalidates_downstream_requirements() {
    let registry = standard_registry();
    // Skip only script_generation: voice_synthesis still requires `script`.
    let plan = pipeline::standard_plan().add_skip_rule(
        names::SCRIPT_GENERATION,
        "scripted skip",
        Arc::new(|_| true),
    );
    let result = plan.compile(&registry, &default_params(), &[namespaces::REQUEST]);
    assert!(matches!(
        result,
        Err(PlanError::MissingInput { ref stage, ref namespace })
            if stage == names::VOICE_SYNTHESIS && namespace == namespaces::SCRIPT
    ));
}

#[test]
fn unknown_stage_in_edges_is_rejected() {
    let registry = standard_registry();
    let result = PlanBuilder::new()
        .add_entry(names::RESEARCH)
        .add_edge(names::RESEARCH, "mastering")
        .compile(&registry, &default_params(), &[namespaces::REQUEST]);
    assert!(
        matches!(result, Err(PlanError::UnknownStage { ref name }) if name == "mastering")
    );
}

#[test]
fn duplicate_registration_is_reported_at_compile() {
    let (first, _) = MockStage::new(&["out"], MockBehavior::Succeed);
    let (second, _) = MockStage::new(&["out"], MockBehavior::Succeed);
    let registry = StageRegistry::new()
        .with_stage(StageDescriptor::new("dup").produces("out"), first)
        .with_stage(StageDescriptor::new("dup").produces("out"), second);

    let result = PlanBuilder::new()
        .add_entry("dup")
        .compile(&registry, &default_params(), &[]);
    assert!(matches!(result, Err(PlanError::DuplicateStage { ref name }) if name == "dup"));
}

#[test]
fn empty_builder_has_no_entry() {
    let registry = standard_registry();
    let result = PlanBuilder::new().compile(&registry, &default_params(), &[]);
    assert!(matches!(result, Err(PlanError::NoEntryStage)));
}

#[test]
fn unreachable_required_output_is_rejected() {
    let registry = standard_registry();
    let result = PlanBuilder::new()
        .add_entry(names::RESEARCH)
        .require_output("final_mix")
        .compile(&registry, &default_params(), &[namespaces::REQUEST]);
    assert!(matches!(
        result,
        Err(PlanError::UnreachableOutput { ref namespace }) if namespace == "final_mix"
    ));
}

#[test]
fn required_output_owed_by_a_skipped_stage_is_waived() {
    let registry = standard_registry();
    let params = RunParams::validate(
        &RunRequest::new(EpisodeKind::RaceReview).with_output_style(OutputStyle::TextOnly),
    )
    .unwrap();
    // standard_plan requires production_metadata, owed by the skipped
    // audio_production stage; text-only runs compile regardless.
    let plan = pipeline::standard_plan()
        .compile(&registry, &params, &[namespaces::REQUEST])
        .unwrap();
    assert_eq!(plan.len(), 3);
}
