//! Stage registry: descriptors plus their implementations.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::stage::Stage;

/// Declared contract of one stage: inputs, outputs, retry policy, timeout.
#[derive(Clone, Debug)]
pub struct StageDescriptor {
    pub name: String,
    /// Namespaces that must exist in shared state before this stage runs.
    pub requires: Vec<String>,
    /// Namespaces this stage's delta must cover exactly.
    pub produces: Vec<String>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl StageDescriptor {
    /// Descriptor with no declared namespaces, default retry, 5-minute timeout.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires: Vec::new(),
            produces: Vec::new(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn requires(mut self, namespace: impl Into<String>) -> Self {
        self.requires.push(namespace.into());
        self
    }

    #[must_use]
    pub fn produces(mut self, namespace: impl Into<String>) -> Self {
        self.produces.push(namespace.into());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub(crate) struct RegisteredStage {
    pub descriptor: StageDescriptor,
    pub stage: Arc<dyn Stage>,
}

/// Registry of available stages, keyed by name.
///
/// Duplicate registrations are recorded and reported when a plan compiles,
/// so a misconfigured registry fails loudly before any stage executes.
#[derive(Default)]
pub struct StageRegistry {
    pub(crate) entries: FxHashMap<String, RegisteredStage>,
    pub(crate) duplicates: Vec<String>,
}

impl StageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stage under its descriptor's name.
    #[must_use]
    pub fn with_stage(mut self, descriptor: StageDescriptor, stage: impl Stage + 'static) -> Self {
        self.register(descriptor, stage);
        self
    }

    /// Non-consuming registration for incremental setup.
    pub fn register(&mut self, descriptor: StageDescriptor, stage: impl Stage + 'static) {
        let name = descriptor.name.clone();
        let previous = self.entries.insert(
            name.clone(),
            RegisteredStage {
                descriptor,
                stage: Arc::new(stage),
            },
        );
        if previous.is_some() {
            self.duplicates.push(name);
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<&StageDescriptor> {
        self.entries.get(name).map(|entry| &entry.descriptor)
    }

    /// Registered stage names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
