use serde_json::{Map, Value};
use uuid::Uuid;

use crate::db::{EntityRecord, EntityState};
use crate::error::LedgerError;

/// Keys owned by the row itself. Attribute patches may not touch them.
pub const RESERVED_KEYS: [&str; 5] = ["id", "user_id", "superseded_by", "created_at", "updated_at"];

/// A change to one entity: attribute sets and removals plus lineage appends.
///
/// Applied to a freshly fetched row to produce the full state that is written
/// back, so a patch computed from a stale read overwrites concurrent changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    set: Map<String, Value>,
    unset: Vec<String>,
    supersede: Vec<Uuid>,
}

impl EntityPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    pub fn set_all(mut self, values: Map<String, Value>) -> Self {
        self.set.extend(values);
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.unset.push(key.into());
        self
    }

    /// Append successor ids to the entity's lineage.
    pub fn supersede(mut self, successors: impl IntoIterator<Item = Uuid>) -> Self {
        self.supersede.extend(successors);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.supersede.is_empty()
    }

    pub fn touched_keys(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .map(String::as_str)
            .chain(self.unset.iter().map(String::as_str))
    }

    pub fn supersedes(&self) -> &[Uuid] {
        &self.supersede
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if let Some(key) = self.touched_keys().find(|key| RESERVED_KEYS.contains(key)) {
            return Err(LedgerError::Validation(format!(
                "attribute patch may not modify reserved field '{}'",
                key
            )));
        }
        Ok(())
    }

    /// Compute the state to write. Lineage only grows: successors already
    /// present are skipped and existing order is kept.
    pub fn apply(&self, current: &EntityRecord) -> Result<EntityState, LedgerError> {
        self.validate()?;
        let mut state = current.state();
        for key in &self.unset {
            state.attributes.remove(key);
        }
        for (key, value) in &self.set {
            state.attributes.insert(key.clone(), value.clone());
        }
        for successor in &self.supersede {
            if !state.superseded_by.contains(successor) {
                state.superseded_by.push(*successor);
            }
        }
        Ok(state)
    }
}
