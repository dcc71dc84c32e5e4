//! Shared state threaded through the stages of one run.
//!
//! State is partitioned into *namespaces*: each stage owns the namespaces it
//! declares as outputs and writes each of them exactly once. Later stages may
//! read earlier namespaces or add new ones, never replace them. This one-way
//! flow is what makes checkpoints safely replayable — restoring a snapshot
//! and re-running the remaining stages can never disagree with the original
//! execution about data that was already committed.
//!
//! # Core Types
//!
//! - [`SharedState`]: the mutable, version-counted container owned by the engine
//! - [`StateSnapshot`]: immutable point-in-time view handed to stages
//!
//! # Examples
//!
//! ```rust
//! use castflow::state::SharedState;
//! use serde_json::json;
//!
//! let mut state = SharedState::new();
//! state
//!     .put("research_data", "research", json!({"sources": 7}))
//!     .unwrap();
//!
//! // A second write to the same namespace is a defect, not a merge.
//! let err = state.put("research_data", "content_planning", json!({}));
//! assert!(err.is_err());
//!
//! let snapshot = state.snapshot();
//! assert_eq!(snapshot.namespace("research_data").unwrap()["sources"], 7);
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

/// The accumulating record threaded through all stages of one run.
///
/// Exactly one `SharedState` exists per run and it is owned by the execution
/// engine; stages only ever see [`StateSnapshot`]s. The version counter bumps
/// once per committed stage delta, which gives checkpoints a cheap ordering
/// check independent of namespace contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SharedState {
    records: FxHashMap<String, Value>,
    owners: FxHashMap<String, String>,
    version: u32,
}

/// Immutable snapshot of run state at a stage boundary.
///
/// Snapshots are independent of the originating [`SharedState`]: mutations
/// after the snapshot was taken are not visible through it.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    records: FxHashMap<String, Value>,
    version: u32,
}

/// Violations of the append-only state discipline.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    /// A stage attempted to write a namespace that an earlier stage already owns.
    #[error("namespace `{namespace}` already written by stage `{owner}`; stage `{stage}` may not overwrite it")]
    #[diagnostic(
        code(castflow::state::namespace_overwrite),
        help("Declare a new output namespace for this stage instead of reusing an upstream one.")
    )]
    NamespaceOverwrite {
        namespace: String,
        owner: String,
        stage: String,
    },
}

impl SharedState {
    /// Creates an empty state at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for seeding initial request namespaces.
    ///
    /// ```rust
    /// use castflow::state::SharedState;
    /// use serde_json::json;
    ///
    /// let state = SharedState::builder()
    ///     .with_namespace("request", json!({"event_id": "gp-monza-2025"}))
    ///     .build();
    /// assert!(state.contains("request"));
    /// ```
    #[must_use]
    pub fn builder() -> SharedStateBuilder {
        SharedStateBuilder::default()
    }

    /// Writes one namespace on behalf of `stage`.
    ///
    /// Fails with [`StateError::NamespaceOverwrite`] when the namespace is
    /// already present; the existing record is left untouched.
    pub fn put(
        &mut self,
        namespace: impl Into<String>,
        stage: impl Into<String>,
        value: Value,
    ) -> Result<(), StateError> {
        let namespace = namespace.into();
        let stage = stage.into();
        if let Some(owner) = self.owners.get(&namespace) {
            return Err(StateError::NamespaceOverwrite {
                namespace,
                owner: owner.clone(),
                stage,
            });
        }
        self.records.insert(namespace.clone(), value);
        self.owners.insert(namespace, stage);
        Ok(())
    }

    /// Merges a stage's output delta, bumping the version once on success.
    ///
    /// The merge is all-or-nothing: if any namespace in the delta would
    /// overwrite an existing record, nothing is written. Returns the
    /// namespaces committed, in sorted order so logs and checkpoints observe
    /// a stable sequence across runs.
    pub fn merge(
        &mut self,
        stage: &str,
        delta: &FxHashMap<String, Value>,
    ) -> Result<Vec<String>, StateError> {
        for namespace in delta.keys() {
            if let Some(owner) = self.owners.get(namespace) {
                return Err(StateError::NamespaceOverwrite {
                    namespace: namespace.clone(),
                    owner: owner.clone(),
                    stage: stage.to_string(),
                });
            }
        }

        let mut written: Vec<String> = delta.keys().cloned().collect();
        written.sort();
        for namespace in &written {
            self.records
                .insert(namespace.clone(), delta[namespace].clone());
            self.owners.insert(namespace.clone(), stage.to_string());
        }
        if !written.is_empty() {
            self.version = self.version.saturating_add(1);
        }
        Ok(written)
    }

    /// Returns the record stored under `namespace`, if any.
    #[must_use]
    pub fn namespace(&self, namespace: &str) -> Option<&Value> {
        self.records.get(namespace)
    }

    /// Returns `true` if `namespace` has been written.
    #[must_use]
    pub fn contains(&self, namespace: &str) -> bool {
        self.records.contains_key(namespace)
    }

    /// The stage that wrote `namespace`, if it has been written.
    #[must_use]
    pub fn owner(&self, namespace: &str) -> Option<&str> {
        self.owners.get(namespace).map(String::as_str)
    }

    /// Current merge-count version.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of namespaces written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no namespace has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Takes an immutable snapshot of the current records and version.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            records: self.records.clone(),
            version: self.version,
        }
    }

    pub(crate) fn records(&self) -> &FxHashMap<String, Value> {
        &self.records
    }

    pub(crate) fn owners(&self) -> &FxHashMap<String, String> {
        &self.owners
    }

    pub(crate) fn from_parts(
        records: FxHashMap<String, Value>,
        owners: FxHashMap<String, String>,
        version: u32,
    ) -> Self {
        Self {
            records,
            owners,
            version,
        }
    }
}

impl StateSnapshot {
    /// Returns the record stored under `namespace`, if any.
    #[must_use]
    pub fn namespace(&self, namespace: &str) -> Option<&Value> {
        self.records.get(namespace)
    }

    /// Returns `true` if `namespace` is present in the snapshot.
    #[must_use]
    pub fn contains(&self, namespace: &str) -> bool {
        self.records.contains_key(namespace)
    }

    /// All namespace names present, unordered.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Version of the originating state when the snapshot was taken.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }
}

/// Fluent constructor for seeding a run's initial namespaces.
///
/// Initial namespaces are attributed to the reserved [`REQUEST_OWNER`] so the
/// overwrite diagnostics can name the request itself as the prior writer.
#[derive(Debug, Default)]
pub struct SharedStateBuilder {
    records: FxHashMap<String, Value>,
}

/// Owner label recorded for namespaces seeded from the run request.
pub const REQUEST_OWNER: &str = "request";

impl SharedStateBuilder {
    /// Seeds one namespace from the run request.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>, value: Value) -> Self {
        self.records.insert(namespace.into(), value);
        self
    }

    /// Builds the state at version 0.
    #[must_use]
    pub fn build(self) -> SharedState {
        let owners = self
            .records
            .keys()
            .map(|k| (k.clone(), REQUEST_OWNER.to_string()))
            .collect();
        SharedState {
            records: self.records,
            owners,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_all_or_nothing() {
        let mut state = SharedState::new();
        state.put("a", "one", json!(1)).unwrap();

        let mut delta = FxHashMap::default();
        delta.insert("a".to_string(), json!(2));
        delta.insert("b".to_string(), json!(3));

        let err = state.merge("two", &delta).unwrap_err();
        assert!(matches!(err, StateError::NamespaceOverwrite { .. }));
        // The non-conflicting key must not have leaked in.
        assert!(!state.contains("b"));
        assert_eq!(state.namespace("a"), Some(&json!(1)));
    }

    #[test]
    fn version_bumps_once_per_merge() {
        let mut state = SharedState::new();
        let mut delta = FxHashMap::default();
        delta.insert("x".to_string(), json!(1));
        delta.insert("y".to_string(), json!(2));
        state.merge("s", &delta).unwrap();
        assert_eq!(state.version(), 1);

        let empty = FxHashMap::default();
        state.merge("s", &empty).unwrap();
        assert_eq!(state.version(), 1);
    }

    #[test]
    fn snapshot_is_independent() {
        let mut state = SharedState::new();
        state.put("k", "s", json!("before")).unwrap();
        let snapshot = state.snapshot();

        let mut delta = FxHashMap::default();
        delta.insert("other".to_string(), json!("after"));
        state.merge("s2", &delta).unwrap();

        assert!(!snapshot.contains("other"));
        assert_eq!(snapshot.namespace("k"), Some(&json!("before")));
    }
}
