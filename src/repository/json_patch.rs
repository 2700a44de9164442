//! JSON patch documents (RFC 6902) with conflict-detecting extensions.
//!
//! Besides the standard operations, three more are understood:
//!
//! - `safeReplace` replaces a value only if it still equals `oldValue`
//! - `removeIfExists` removes a value and succeeds if it is already gone
//! - `testAbsence` succeeds only if nothing exists at the path
//!
//! [`generate_patch`] only emits `add`, `remove` and `safeReplace`, so a
//! generated patch applied to a document that changed in between fails
//! instead of silently overwriting the change.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// why a patch could not be applied
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// a `test`, `safeReplace` or `testAbsence` check failed
    #[error("{0}")]
    Conflict(String),

    /// the document does not have the shape the operation needs
    #[error("{0}")]
    NotApplicable(String),

    /// malformed JSON pointer
    #[error("invalid JSON pointer: {0}")]
    InvalidPointer(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOperation {
    Add {
        path: String,
        value: Value,
    },
    Remove {
        path: String,
    },
    Replace {
        path: String,
        value: Value,
    },
    Move {
        from: String,
        path: String,
    },
    Copy {
        from: String,
        path: String,
    },
    Test {
        path: String,
        value: Value,
    },
    SafeReplace {
        path: String,
        #[serde(rename = "oldValue")]
        old_value: Value,
        value: Value,
    },
    RemoveIfExists {
        path: String,
    },
    TestAbsence {
        path: String,
    },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. }
            | PatchOperation::SafeReplace { path, .. }
            | PatchOperation::RemoveIfExists { path }
            | PatchOperation::TestAbsence { path } => path,
        }
    }

    fn apply(&self, doc: &mut Value) -> Result<(), PatchError> {
        match self {
            PatchOperation::Add { path, value } => add(doc, &parse_pointer(path)?, value.clone()),
            PatchOperation::Remove { path } => remove(doc, &parse_pointer(path)?).map(|_| ()),
            PatchOperation::Replace { path, value } => {
                let target = get_mut(doc, &parse_pointer(path)?)
                    .ok_or_else(|| PatchError::NotApplicable(format!("no value to replace at '{}'", path)))?;
                *target = value.clone();
                Ok(())
            }
            PatchOperation::Move { from, path } => {
                if path != from && path.starts_with(&format!("{}/", from)) {
                    return Err(PatchError::NotApplicable(format!(
                        "cannot move '{}' into its own child '{}'",
                        from, path
                    )));
                }
                let value = remove(doc, &parse_pointer(from)?)?;
                add(doc, &parse_pointer(path)?, value)
            }
            PatchOperation::Copy { from, path } => {
                let value = get(doc, &parse_pointer(from)?)
                    .cloned()
                    .ok_or_else(|| PatchError::NotApplicable(format!("no value to copy at '{}'", from)))?;
                add(doc, &parse_pointer(path)?, value)
            }
            PatchOperation::Test { path, value } => match get(doc, &parse_pointer(path)?) {
                Some(current) if current == value => Ok(()),
                Some(current) => Err(PatchError::Conflict(format!(
                    "test failed at '{}': expected {}, found {}",
                    path, value, current
                ))),
                None => Err(PatchError::Conflict(format!("test failed at '{}': no value", path))),
            },
            PatchOperation::SafeReplace { path, old_value, value } => {
                let target = get_mut(doc, &parse_pointer(path)?).ok_or_else(|| {
                    PatchError::Conflict(format!("safeReplace failed at '{}': no value", path))
                })?;
                if *target != *old_value {
                    return Err(PatchError::Conflict(format!(
                        "safeReplace failed at '{}': expected {}, found {}",
                        path, old_value, target
                    )));
                }
                *target = value.clone();
                Ok(())
            }
            PatchOperation::RemoveIfExists { path } => {
                let tokens = parse_pointer(path)?;
                if get(doc, &tokens).is_some() {
                    remove(doc, &tokens)?;
                }
                Ok(())
            }
            PatchOperation::TestAbsence { path } => match get(doc, &parse_pointer(path)?) {
                Some(current) => Err(PatchError::Conflict(format!(
                    "testAbsence failed at '{}': found {}",
                    path, current
                ))),
                None => Ok(()),
            },
        }
    }
}

/// an ordered list of patch operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonPatch(pub Vec<PatchOperation>);

impl JsonPatch {
    pub fn new(operations: Vec<PatchOperation>) -> Self {
        Self(operations)
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply every operation in order to a copy of `doc`.
    pub fn apply(&self, doc: &Value) -> Result<Value, PatchError> {
        let mut doc = doc.clone();
        for op in &self.0 {
            op.apply(&mut doc)?;
        }
        Ok(doc)
    }
}

/// Generate a patch that turns `old` into `new`.
pub fn generate_patch(old: &Value, new: &Value) -> JsonPatch {
    let mut ops = Vec::new();
    diff_values("", old, new, &mut ops);
    JsonPatch(ops)
}

fn diff_values(pointer: &str, old: &Value, new: &Value, ops: &mut Vec<PatchOperation>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => diff_objects(pointer, old, new, ops),
        (Value::Array(old), Value::Array(new)) if old.len() == new.len() => {
            for (i, (a, b)) in old.iter().zip(new).enumerate() {
                diff_values(&format!("{}/{}", pointer, i), a, b, ops);
            }
        }
        _ => ops.push(PatchOperation::SafeReplace {
            path: pointer.to_string(),
            old_value: old.clone(),
            value: new.clone(),
        }),
    }
}

fn diff_objects(pointer: &str, old: &Map<String, Value>, new: &Map<String, Value>, ops: &mut Vec<PatchOperation>) {
    for key in old.keys().filter(|key| !new.contains_key(*key)) {
        ops.push(PatchOperation::Remove {
            path: format!("{}/{}", pointer, escape_token(key)),
        });
    }
    for (key, value) in new {
        let path = format!("{}/{}", pointer, escape_token(key));
        match old.get(key) {
            Some(old_value) => diff_values(&path, old_value, value, ops),
            None => ops.push(PatchOperation::Add {
                path,
                value: value.clone(),
            }),
        }
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// split a JSON pointer into unescaped reference tokens
pub fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(PatchError::InvalidPointer(pointer.to_string()));
    };
    rest.split('/')
        .map(|token| {
            if token.contains('~') && !valid_escapes(token) {
                return Err(PatchError::InvalidPointer(pointer.to_string()));
            }
            Ok(token.replace("~1", "/").replace("~0", "~"))
        })
        .collect()
}

fn valid_escapes(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'~')
        .all(|(i, _)| matches!(bytes.get(i + 1), Some(b'0') | Some(b'1')))
}

fn array_index(token: &str, len: usize, allow_end: bool) -> Result<usize, PatchError> {
    if allow_end && token == "-" {
        return Ok(len);
    }
    let valid = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    let index: usize = if valid {
        token
            .parse()
            .map_err(|_| PatchError::NotApplicable(format!("invalid array index '{}'", token)))?
    } else {
        return Err(PatchError::NotApplicable(format!("invalid array index '{}'", token)));
    };
    let limit = if allow_end { len } else { len.saturating_sub(1) };
    if index > limit || (!allow_end && len == 0) {
        return Err(PatchError::NotApplicable(format!("array index {} out of bounds", index)));
    }
    Ok(index)
}

fn get<'a>(doc: &'a Value, tokens: &[String]) -> Option<&'a Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => array_index(token, items.len(), false)
            .ok()
            .and_then(|i| items.get(i)),
        _ => None,
    })
}

fn get_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Option<&'a mut Value> {
    tokens.iter().try_fold(doc, |current, token| match current {
        Value::Object(map) => map.get_mut(token),
        Value::Array(items) => {
            let index = array_index(token, items.len(), false).ok()?;
            items.get_mut(index)
        }
        _ => None,
    })
}

fn add(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), PatchError> {
    let Some((last, parent)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = get_mut(doc, parent)
        .ok_or_else(|| PatchError::NotApplicable(format!("no parent to add '{}' to", last)))?;
    match parent {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = array_index(last, items.len(), true)?;
            items.insert(index, value);
            Ok(())
        }
        _ => Err(PatchError::NotApplicable(format!(
            "cannot add '{}' to a non-container value",
            last
        ))),
    }
}

fn remove(doc: &mut Value, tokens: &[String]) -> Result<Value, PatchError> {
    let Some((last, parent)) = tokens.split_last() else {
        return Err(PatchError::NotApplicable("cannot remove the root".to_string()));
    };
    let parent = get_mut(doc, parent)
        .ok_or_else(|| PatchError::NotApplicable(format!("no value to remove at '{}'", last)))?;
    match parent {
        Value::Object(map) => map
            .remove(last)
            .ok_or_else(|| PatchError::NotApplicable(format!("no value to remove at '{}'", last))),
        Value::Array(items) => {
            let index = array_index(last, items.len(), false)?;
            Ok(items.remove(index))
        }
        _ => Err(PatchError::NotApplicable(format!("no value to remove at '{}'", last))),
    }
}
