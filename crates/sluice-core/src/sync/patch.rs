//! Patch application
//!
//! The structure of a diff is decided by the server. The client only needs a
//! function that turns the cached value plus a patch into the next value, or
//! reports that it cannot.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// Patch does not fit the value it was applied to
    #[error("patch does not apply: {0}")]
    Mismatch(String),
    /// Patcher produced no value
    #[error("patch produced no value")]
    Empty,
}

/// Applies a server diff to a cached value
pub trait Patcher: Send + 'static {
    fn apply(&self, value: Value, patch: &Value) -> Result<Value, PatchError>;
}

impl<F> Patcher for F
where
    F: Fn(Value, &Value) -> Result<Value, PatchError> + Send + 'static,
{
    fn apply(&self, value: Value, patch: &Value) -> Result<Value, PatchError> {
        self(value, patch)
    }
}

/// JSON merge patch (RFC 7386)
///
/// A patch whose top level is not an object replaces the value. A `null`
/// result is treated as corruption: a live subscription never has an absent
/// value.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergePatch;

impl Patcher for MergePatch {
    fn apply(&self, value: Value, patch: &Value) -> Result<Value, PatchError> {
        match merge(value, patch) {
            Value::Null => Err(PatchError::Empty),
            merged => Ok(merged),
        }
    }
}

fn merge(target: Value, patch: &Value) -> Value {
    let Value::Object(patch) = patch else {
        return patch.clone();
    };
    let mut target = match target {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (key, change) in patch {
        if change.is_null() {
            target.remove(key);
        } else {
            let current = target.remove(key).unwrap_or(Value::Null);
            target.insert(key.clone(), merge(current, change));
        }
    }
    Value::Object(target)
}
