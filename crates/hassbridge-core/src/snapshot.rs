//! Entity state snapshots.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Entity id to state record, built once per connection cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    entities: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Flatten a `/api/states` list into a keyed mapping.
    ///
    /// Every record must carry a string `entity_id`. A repeated id keeps the
    /// last record seen.
    pub fn from_states(states: Vec<Value>) -> Result<Self, SnapshotError> {
        let mut entities = BTreeMap::new();
        for (index, state) in states.into_iter().enumerate() {
            let id = state
                .get("entity_id")
                .and_then(Value::as_str)
                .ok_or(SnapshotError::MissingEntityId(index))?
                .to_string();
            entities.insert(id, state);
        }
        Ok(Self { entities })
    }

    /// Flatten a decoded `/api/states` body, which must be a list.
    pub fn from_value(value: Value) -> Result<Self, SnapshotError> {
        match value {
            Value::Array(states) => Self::from_states(states),
            _ => Err(SnapshotError::NotAList),
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<&Value> {
        self.entities.get(entity_id)
    }

    pub fn insert(&mut self, entity_id: impl Into<String>, state: Value) -> Option<Value> {
        self.entities.insert(entity_id.into(), state)
    }

    pub fn remove(&mut self, entity_id: &str) -> Option<Value> {
        self.entities.remove(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("state list expected")]
    NotAList,
    #[error("state record {0} has no entity_id")]
    MissingEntityId(usize),
}
