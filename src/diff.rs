//! Reversible diffs between two JSON-like trees.
//!
//! A diff is an ordered list of patch operations, each serialized as a
//! `[code, path, payload]` triple so that diffs are themselves plain data and
//! can live inside stored record documents. `patch(a, diff(a, b)) == b` holds
//! for every pair of trees.

use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PatchError;

/// One step of a path: a map key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSeg {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSeg::Key(key) => write!(f, "{key}"),
            PathSeg::Index(index) => write!(f, "{index}"),
        }
    }
}

pub type Path = Vec<PathSeg>;

fn display_path(path: &[PathSeg]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// A single patch operation.
///
/// `Set` covers scalar replacement, new map keys, and whole-container swaps
/// where both sides are containers of different shapes. The two dedicated
/// replace ops mark the transitions between scalar and container values so
/// that historical diffs stay self-describing.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    /// Set the value at `path`, creating the map key if absent.
    Set { path: Path, value: Value },
    /// Remove the map key addressed by `path`.
    Delete { path: Path },
    /// Insert `value` into a list so that it ends up at the index addressed
    /// by the final path segment.
    Insert { path: Path, value: Value },
    /// Remove the list element addressed by the final path segment.
    Remove { path: Path },
    /// Replace a scalar with a container value.
    ToContainer { path: Path, value: Value },
    /// Replace a container with a scalar value.
    ToScalar { path: Path, value: Value },
}

const CODE_SET: &str = "s";
const CODE_DELETE: &str = "d";
const CODE_INSERT: &str = "i";
const CODE_REMOVE: &str = "r";
const CODE_TO_CONTAINER: &str = "c";
const CODE_TO_SCALAR: &str = "f";

impl DiffOp {
    fn parts(&self) -> (&'static str, &Path, Option<&Value>) {
        match self {
            DiffOp::Set { path, value } => (CODE_SET, path, Some(value)),
            DiffOp::Delete { path } => (CODE_DELETE, path, None),
            DiffOp::Insert { path, value } => (CODE_INSERT, path, Some(value)),
            DiffOp::Remove { path } => (CODE_REMOVE, path, None),
            DiffOp::ToContainer { path, value } => (CODE_TO_CONTAINER, path, Some(value)),
            DiffOp::ToScalar { path, value } => (CODE_TO_SCALAR, path, Some(value)),
        }
    }

    pub fn path(&self) -> &[PathSeg] {
        self.parts().1
    }
}

impl Serialize for DiffOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (code, path, payload) = self.parts();
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(code)?;
        seq.serialize_element(path)?;
        seq.serialize_element(&payload.cloned().unwrap_or(Value::Null))?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for DiffOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OpVisitor;

        impl<'de> Visitor<'de> for OpVisitor {
            type Value = DiffOp;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [code, path, payload] triple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<DiffOp, A::Error> {
                let code: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let path: Path = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let payload: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                let op = match code.as_str() {
                    CODE_SET => DiffOp::Set {
                        path,
                        value: payload,
                    },
                    CODE_DELETE => DiffOp::Delete { path },
                    CODE_INSERT => DiffOp::Insert {
                        path,
                        value: payload,
                    },
                    CODE_REMOVE => DiffOp::Remove { path },
                    CODE_TO_CONTAINER => DiffOp::ToContainer {
                        path,
                        value: payload,
                    },
                    CODE_TO_SCALAR => DiffOp::ToScalar {
                        path,
                        value: payload,
                    },
                    other => {
                        return Err(de::Error::unknown_variant(
                            other,
                            &["s", "d", "i", "r", "c", "f"],
                        ))
                    }
                };
                Ok(op)
            }
        }

        deserializer.deserialize_seq(OpVisitor)
    }
}

/// An ordered list of patch operations.
pub type Diff = Vec<DiffOp>;

fn is_container(value: &Value) -> bool {
    value.is_object() || value.is_array()
}

/// Computes the minimal patch transforming `from` into `to`.
///
/// Map keys are visited in sorted order so the emitted ops are deterministic.
/// Lists are diffed index by index with tails handled by inserts/removes at
/// absolute indices; there is no subsequence matching, so a mid-list insert
/// rewrites the tail. Containers of different shapes are replaced wholesale.
pub fn diff(from: &Value, to: &Value) -> Diff {
    let mut ops = Vec::new();
    diff_at(&mut Vec::new(), from, to, &mut ops);
    ops
}

fn diff_at(path: &mut Path, from: &Value, to: &Value, ops: &mut Diff) {
    match (from, to) {
        (Value::Object(a), Value::Object(b)) => {
            // serde_json maps iterate in key order
            for (key, from_value) in a {
                match b.get(key) {
                    Some(to_value) => {
                        path.push(PathSeg::Key(key.clone()));
                        diff_at(path, from_value, to_value, ops);
                        path.pop();
                    }
                    None => {
                        let mut op_path = path.clone();
                        op_path.push(PathSeg::Key(key.clone()));
                        ops.push(DiffOp::Delete { path: op_path });
                    }
                }
            }
            for (key, to_value) in b {
                if !a.contains_key(key) {
                    let mut op_path = path.clone();
                    op_path.push(PathSeg::Key(key.clone()));
                    ops.push(DiffOp::Set {
                        path: op_path,
                        value: to_value.clone(),
                    });
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            for index in 0..common {
                path.push(PathSeg::Index(index));
                diff_at(path, &a[index], &b[index], ops);
                path.pop();
            }
            // grew: insert the new tail at absolute indices
            for (index, value) in b.iter().enumerate().skip(a.len()) {
                let mut op_path = path.clone();
                op_path.push(PathSeg::Index(index));
                ops.push(DiffOp::Insert {
                    path: op_path,
                    value: value.clone(),
                });
            }
            // shrank: remove the old tail back to front so indices stay valid
            for index in (b.len()..a.len()).rev() {
                let mut op_path = path.clone();
                op_path.push(PathSeg::Index(index));
                ops.push(DiffOp::Remove { path: op_path });
            }
        }
        _ if from == to => {}
        _ => {
            let value = to.clone();
            let op = match (is_container(from), is_container(to)) {
                (false, true) => DiffOp::ToContainer {
                    path: path.clone(),
                    value,
                },
                (true, false) => DiffOp::ToScalar {
                    path: path.clone(),
                    value,
                },
                // scalar to scalar, or list vs map swapped wholesale
                _ => DiffOp::Set {
                    path: path.clone(),
                    value,
                },
            };
            ops.push(op);
        }
    }
}

/// Applies `ops` to `data`, returning the patched tree.
pub fn patch(data: &Value, ops: &[DiffOp]) -> Result<Value, PatchError> {
    let mut out = data.clone();
    for op in ops {
        apply(&mut out, op)?;
    }
    Ok(out)
}

fn apply(root: &mut Value, op: &DiffOp) -> Result<(), PatchError> {
    match op {
        DiffOp::Set { path, value }
        | DiffOp::ToContainer { path, value }
        | DiffOp::ToScalar { path, value } => {
            if path.is_empty() {
                *root = value.clone();
                return Ok(());
            }
            let (parent, last) = split_target(root, path)?;
            match (parent, last) {
                (Value::Object(map), PathSeg::Key(key)) => {
                    map.insert(key.clone(), value.clone());
                }
                (Value::Array(list), PathSeg::Index(index)) => {
                    let slot = list.get_mut(*index).ok_or_else(|| PatchError::MissingPath {
                        path: display_path(path),
                    })?;
                    *slot = value.clone();
                }
                (found, _) => return Err(shape_error(path, "map or list", found)),
            }
        }
        DiffOp::Delete { path } => {
            let (parent, last) = split_target(root, path)?;
            match (parent, last) {
                (Value::Object(map), PathSeg::Key(key)) => {
                    map.remove(key).ok_or_else(|| PatchError::MissingPath {
                        path: display_path(path),
                    })?;
                }
                (found, _) => return Err(shape_error(path, "map", found)),
            }
        }
        DiffOp::Insert { path, value } => {
            let (parent, last) = split_target(root, path)?;
            match (parent, last) {
                (Value::Array(list), PathSeg::Index(index)) => {
                    if *index > list.len() {
                        return Err(PatchError::MissingPath {
                            path: display_path(path),
                        });
                    }
                    list.insert(*index, value.clone());
                }
                (found, _) => return Err(shape_error(path, "list", found)),
            }
        }
        DiffOp::Remove { path } => {
            let (parent, last) = split_target(root, path)?;
            match (parent, last) {
                (Value::Array(list), PathSeg::Index(index)) => {
                    if *index >= list.len() {
                        return Err(PatchError::MissingPath {
                            path: display_path(path),
                        });
                    }
                    list.remove(*index);
                }
                (found, _) => return Err(shape_error(path, "list", found)),
            }
        }
    }
    Ok(())
}

fn shape_error(path: &[PathSeg], expected: &'static str, found: &Value) -> PatchError {
    PatchError::WrongShape {
        path: display_path(path),
        expected,
        found: kind_name(found),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Navigates to the parent of the value addressed by `path` and returns it
/// together with the final segment. `path` must be non-empty.
fn split_target<'a>(
    root: &'a mut Value,
    path: &'a [PathSeg],
) -> Result<(&'a mut Value, &'a PathSeg), PatchError> {
    let (last, front) = path.split_last().ok_or_else(|| PatchError::MissingPath {
        path: String::new(),
    })?;
    let mut current = root;
    for (depth, seg) in front.iter().enumerate() {
        current = match (current, seg) {
            (Value::Object(map), PathSeg::Key(key)) => {
                map.get_mut(key).ok_or_else(|| PatchError::MissingPath {
                    path: display_path(&path[..=depth]),
                })?
            }
            (Value::Array(list), PathSeg::Index(index)) => {
                list.get_mut(*index).ok_or_else(|| PatchError::MissingPath {
                    path: display_path(&path[..=depth]),
                })?
            }
            (found, PathSeg::Key(_)) => return Err(shape_error(&path[..=depth], "map", found)),
            (found, PathSeg::Index(_)) => return Err(shape_error(&path[..=depth], "list", found)),
        };
    }
    Ok((current, last))
}
