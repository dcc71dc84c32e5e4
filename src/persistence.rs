/*!
Persistence primitives for serializing shared state and checkpoints (used
by the SQLite store and any future durable backends).

Design goals:
- Explicit serde-friendly structs decoupled from the in-memory types.
- Conversion logic localized in From impls so store code stays lean.

This module performs no I/O; it is pure data transformation glue.
*/

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::SharedState;

/// Persisted shape of the in-memory [`SharedState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PersistedState {
    #[serde(default)]
    pub records: FxHashMap<String, Value>,
    #[serde(default)]
    pub owners: FxHashMap<String, String>,
    #[serde(default)]
    pub version: u32,
}

/// Persisted shape of a checkpoint row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedCheckpoint {
    pub run_id: String,
    pub stage_index: u32,
    pub stage_name: String,
    pub state: PersistedState,
    /// RFC 3339 creation time (keeps chrono out of the serialized shape).
    pub created_at: String,
}

/// Serialization errors for persistence models.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(
        code(castflow::persistence::serde),
        help("Ensure the JSON structure matches the Persisted* types.")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

impl From<&SharedState> for PersistedState {
    fn from(state: &SharedState) -> Self {
        PersistedState {
            records: state.records().clone(),
            owners: state.owners().clone(),
            version: state.version(),
        }
    }
}

impl From<PersistedState> for SharedState {
    fn from(persisted: PersistedState) -> Self {
        SharedState::from_parts(persisted.records, persisted.owners, persisted.version)
    }
}

impl PersistedCheckpoint {
    pub fn to_json_string(&self) -> Result<String, PersistenceError> {
        serde_json::to_string(self).map_err(|source| PersistenceError::Serde { source })
    }

    pub fn from_json_str(s: &str) -> Result<Self, PersistenceError> {
        serde_json::from_str(s).map_err(|source| PersistenceError::Serde { source })
    }
}

impl PersistedState {
    pub fn to_json_string(&self) -> Result<String, PersistenceError> {
        serde_json::to_string(self).map_err(|source| PersistenceError::Serde { source })
    }

    pub fn from_json_str(s: &str) -> Result<Self, PersistenceError> {
        serde_json::from_str(s).map_err(|source| PersistenceError::Serde { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_round_trips_through_persisted_shape() {
        let mut state = SharedState::new();
        state.put("script", "script_generation", json!({"words": 1800}))
            .unwrap();

        let persisted = PersistedState::from(&state);
        let json = persisted.to_json_string().unwrap();
        let restored: SharedState = PersistedState::from_json_str(&json).unwrap().into();

        assert_eq!(restored, state);
        assert_eq!(restored.owner("script"), Some("script_generation"));
    }
}
