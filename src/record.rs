//! Records and their version-keyed diff chains.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::diff::{diff, patch, Diff};
use crate::errors::ValidationError;

/// A version is a UNIX epoch in milliseconds. It doubles as a record's stamp
/// and as a database's monotonic clock.
pub type Version = i64;

/// An incoming record: an identifier plus a data tree. The data tree must be
/// a map at the root; an empty map marks the record as deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub data: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Record {
            id: id.into(),
            data,
        }
    }

    /// A record whose data is the empty map, i.e. a logical deletion.
    pub fn deleted(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            data: Value::Object(Map::new()),
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(&self.data, Value::Object(map) if map.is_empty())
    }

    /// Rejects empty ids, non-map roots, and reserved field names. Keys
    /// starting with an underscore collide with the parsed sub-field
    /// namespace and are refused everywhere except a top-level `_id`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::EmptyRecordId);
        }
        let Value::Object(map) = &self.data else {
            return Err(ValidationError::RootNotAMap {
                id: self.id.clone(),
            });
        };
        for (key, value) in map {
            if key.starts_with('_') && key != "_id" {
                return Err(ValidationError::ReservedField {
                    id: self.id.clone(),
                    field: key.clone(),
                });
            }
            self.validate_value(value)?;
        }
        Ok(())
    }

    fn validate_value(&self, value: &Value) -> Result<(), ValidationError> {
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    if key.starts_with('_') {
                        return Err(ValidationError::ReservedField {
                            id: self.id.clone(),
                            field: key.clone(),
                        });
                    }
                    self.validate_value(value)?;
                }
            }
            Value::Array(values) => {
                for value in values {
                    self.validate_value(value)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// The shape a record takes in the document store.
///
/// `data` is the current committed state and `version` its stamp. `diffs` is
/// keyed by the older versions of the record and each diff transforms the
/// state at the adjacent newer version back into the state at its key, so
/// applying diffs in descending key order walks history backwards. `next`
/// holds uncommitted pending data until a commit folds it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,

    #[serde(default = "empty_map")]
    pub data: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub diffs: BTreeMap<Version, Diff>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_version: Option<Version>,
}

fn empty_map() -> Value {
    Value::Object(Map::new())
}

impl StoredRecord {
    /// A record seen for the first time: nothing committed yet, the incoming
    /// data staged for the next commit.
    pub fn staged(id: impl Into<String>, data: Value) -> Self {
        StoredRecord {
            id: id.into(),
            data: empty_map(),
            version: None,
            diffs: BTreeMap::new(),
            next: Some(data),
            next_version: None,
        }
    }

    pub fn has_uncommitted(&self) -> bool {
        self.next.is_some()
    }

    /// The data an incoming mutation should be compared against: pending
    /// data if any, otherwise the committed state.
    pub fn effective_data(&self) -> &Value {
        self.next.as_ref().unwrap_or(&self.data)
    }

    /// Every committed version of this record, ascending.
    pub fn versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self.diffs.keys().copied().collect();
        if let Some(version) = self.version {
            versions.push(version);
        }
        versions
    }

    /// Materializes the record's data as it was at `target`, or `None` if the
    /// record did not exist yet. Walks the diff chain backwards from the
    /// current committed state.
    pub fn data_at(&self, target: Version) -> Option<Value> {
        let mut current_version = self.version?;
        let mut state = self.data.clone();
        for (&version, ops) in self.diffs.iter().rev() {
            if current_version <= target {
                break;
            }
            // corrupt chains are a store-level invariant violation, surface
            // loudly rather than returning a wrong state
            state = patch(&state, ops).expect("diff chain does not match stored data");
            current_version = version;
        }
        (current_version <= target).then_some(state)
    }

    /// The full sequence of `(version, data)` states, ascending.
    pub fn history(&self) -> Vec<(Version, Value)> {
        let Some(version) = self.version else {
            return Vec::new();
        };
        let mut states = vec![(version, self.data.clone())];
        let mut state = self.data.clone();
        for (&older, ops) in self.diffs.iter().rev() {
            state = patch(&state, ops).expect("diff chain does not match stored data");
            states.push((older, state.clone()));
        }
        states.reverse();
        states
    }

    /// Folds pending data into the committed state under `version`,
    /// recording the backwards diff for the superseded state. Returns false
    /// if there was nothing to fold, including pending data that circled
    /// back to the committed state (no version is spent on a non-change).
    pub fn fold_staged(&mut self, version: Version) -> bool {
        let Some(next) = self.next.take() else {
            return false;
        };
        self.next_version = None;
        if let Some(previous) = self.version {
            if next == self.data {
                return false;
            }
            self.diffs.insert(previous, diff(&next, &self.data));
        }
        self.data = next;
        self.version = Some(version);
        true
    }

    /// Discards pending data. Returns true if there was anything to discard.
    pub fn rollback_staged(&mut self) -> bool {
        self.next_version = None;
        self.next.take().is_some()
    }
}

/// One record's share of the changes between two database versions: the
/// ordered versions in `(since, until]` at which it changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordVersions {
    pub id: String,
    pub versions: Vec<Version>,
}
