//! Shared test harness: scripted mock stages and engine wiring.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::json;

use castflow::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use castflow::engine::ExecutionEngine;
use castflow::pipeline::{self, names, namespaces};
use castflow::plan::{StageDescriptor, StageRegistry};
use castflow::retry::RetryPolicy;
use castflow::stage::{Stage, StageContext, StageDelta, StageError};
use castflow::state::StateSnapshot;

/// Counts invocations of one mock stage across traversals.
#[derive(Clone, Default)]
pub struct StageProbe {
    invocations: Arc<AtomicU32>,
}

impl StageProbe {
    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// Scripted behavior for a mock stage.
#[derive(Clone)]
pub enum MockBehavior {
    /// Produce the declared namespaces immediately.
    Succeed,
    /// Succeed and also write one artifact through the storage interface.
    SucceedWithArtifact(String),
    /// Fail with a transient error on the first `n` attempts, then succeed.
    TransientTimes(u32),
    /// Fail with a transient error on every attempt.
    AlwaysTransient,
    /// Fail transiently on every attempt, but only for runs whose request
    /// names this event id; other runs succeed.
    TransientForEvent(String),
    /// Fail fatally with a validation error.
    FatalValidation,
    /// Return a namespace the descriptor does not declare.
    UndeclaredOutput,
    /// Fail with a validation error while the flag is set; succeed after.
    FatalWhile(Arc<AtomicBool>),
    /// Sleep before succeeding (for timeout and cancellation tests).
    Delay(Duration),
}

/// A stage whose outcome follows a [`MockBehavior`] script.
pub struct MockStage {
    produces: Vec<String>,
    behavior: MockBehavior,
    probe: StageProbe,
    artifact_key: Option<String>,
}

impl MockStage {
    pub fn new(produces: &[&str], behavior: MockBehavior) -> (Self, StageProbe) {
        let probe = StageProbe::default();
        (
            Self {
                produces: produces.iter().map(|s| (*s).to_string()).collect(),
                behavior,
                probe: probe.clone(),
                artifact_key: None,
            },
            probe,
        )
    }

    pub fn with_artifact(mut self, key: &str) -> Self {
        self.artifact_key = Some(key.to_string());
        self
    }

    fn success_delta(&self) -> StageDelta {
        let mut delta = StageDelta::new();
        for namespace in &self.produces {
            delta = delta.with_namespace(namespace, json!({ "produced_by": namespace }));
        }
        delta
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        ctx: StageContext,
    ) -> Result<StageDelta, StageError> {
        self.probe.invocations.fetch_add(1, Ordering::SeqCst);
        let mut artifact_key = self.artifact_key.clone();
        match &self.behavior {
            MockBehavior::Succeed => {}
            MockBehavior::SucceedWithArtifact(key) => {
                artifact_key = Some(key.clone());
            }
            MockBehavior::TransientTimes(n) => {
                if ctx.attempt <= *n {
                    return Err(StageError::Transient {
                        collaborator: "mock",
                        message: format!("scripted transient failure on attempt {}", ctx.attempt),
                    });
                }
            }
            MockBehavior::AlwaysTransient => {
                return Err(StageError::Transient {
                    collaborator: "mock",
                    message: "scripted permanent transient failure".to_string(),
                });
            }
            MockBehavior::TransientForEvent(event_id) => {
                if ctx.params.event_id.as_deref() == Some(event_id.as_str()) {
                    return Err(StageError::Transient {
                        collaborator: "mock",
                        message: format!("scripted transient failure for event {event_id}"),
                    });
                }
            }
            MockBehavior::FatalValidation => {
                return Err(StageError::Validation(
                    "scripted validation failure".to_string(),
                ));
            }
            MockBehavior::UndeclaredOutput => {
                return Ok(StageDelta::new().with_namespace("rogue", json!(true)));
            }
            MockBehavior::FatalWhile(flag) => {
                if flag.load(Ordering::SeqCst) {
                    return Err(StageError::Validation(
                        "scripted failure while flag set".to_string(),
                    ));
                }
            }
            MockBehavior::Delay(duration) => {
                tokio::time::sleep(*duration).await;
            }
        }

        let mut delta = self.success_delta();
        if let Some(key) = &artifact_key {
            let artifact = ctx.artifacts.put(key, b"mock artifact bytes").await?;
            delta = delta.with_artifact(artifact);
        }
        Ok(delta)
    }
}

/// `(stage name, produced namespace)` for the standard chain, in order.
pub const CHAIN: [(&str, &str); 5] = [
    (names::RESEARCH, namespaces::RESEARCH_DATA),
    (names::CONTENT_PLANNING, namespaces::CONTENT_OUTLINE),
    (names::SCRIPT_GENERATION, namespaces::SCRIPT),
    (names::VOICE_SYNTHESIS, namespaces::AUDIO_METADATA),
    (names::AUDIO_PRODUCTION, namespaces::PRODUCTION_METADATA),
];

/// Retry policy tuned for test speed: three attempts, 20ms base backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(20))
}

/// Registry for the standard chain with per-stage scripted behaviors.
///
/// Descriptors mirror the standard pipeline's contracts but use the fast
/// retry policy and a short timeout so tests never wait on real budgets.
pub fn scripted_registry(
    behaviors: &FxHashMap<&str, MockBehavior>,
    retry: RetryPolicy,
    timeout: Duration,
) -> (StageRegistry, FxHashMap<String, StageProbe>) {
    let mut registry = StageRegistry::new();
    let mut probes = FxHashMap::default();
    let mut previous = namespaces::REQUEST;
    for (stage_name, produced) in CHAIN {
        let behavior = behaviors
            .get(stage_name)
            .cloned()
            .unwrap_or(MockBehavior::Succeed);
        let (stage, probe) = MockStage::new(&[produced], behavior);
        probes.insert(stage_name.to_string(), probe);
        let mut descriptor = StageDescriptor::new(stage_name)
            .requires(previous)
            .produces(produced)
            .with_retry(retry)
            .with_timeout(timeout);
        // Audio production also reads the script, like the real pipeline.
        if stage_name == names::AUDIO_PRODUCTION {
            descriptor = descriptor.requires(namespaces::SCRIPT);
        }
        registry.register(descriptor, stage);
        previous = produced;
    }
    (registry, probes)
}

pub struct Harness {
    pub engine: ExecutionEngine,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub probes: FxHashMap<String, StageProbe>,
}

/// Engine over the standard chain with scripted behaviors and fast retries.
pub fn build_harness(behaviors: FxHashMap<&str, MockBehavior>) -> Harness {
    build_harness_with(behaviors, fast_retry(), Duration::from_secs(5))
}

pub fn build_harness_with(
    behaviors: FxHashMap<&str, MockBehavior>,
    retry: RetryPolicy,
    timeout: Duration,
) -> Harness {
    build_harness_full(
        behaviors,
        retry,
        timeout,
        Arc::new(MemoryCheckpointStore::new()),
    )
}

/// Harness over an existing checkpoint store (restart scenarios).
pub fn build_harness_with_store(
    behaviors: FxHashMap<&str, MockBehavior>,
    checkpoints: Arc<MemoryCheckpointStore>,
) -> Harness {
    build_harness_full(behaviors, fast_retry(), Duration::from_secs(5), checkpoints)
}

fn build_harness_full(
    behaviors: FxHashMap<&str, MockBehavior>,
    retry: RetryPolicy,
    timeout: Duration,
    checkpoints: Arc<MemoryCheckpointStore>,
) -> Harness {
    let (registry, probes) = scripted_registry(&behaviors, retry, timeout);
    let engine = ExecutionEngine::builder()
        .registry(registry)
        .plan(pipeline::standard_plan())
        .checkpoints(checkpoints.clone() as Arc<dyn CheckpointStore>)
        .max_concurrent_runs(8)
        .build();
    Harness {
        engine,
        checkpoints,
        probes,
    }
}
