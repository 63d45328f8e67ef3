//! Resource state snapshots
//!
//! A snapshot maps attribute names to a small closed set of values. Nested
//! attributes are addressed with dotted paths such as `tags.environment`;
//! numeric segments index into lists (`ingress.0.cidr_blocks`).

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute snapshot of one resource
pub type StateMap = BTreeMap<String, StateValue>;

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// Explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// Number, integer or float, kept exactly as parsed
    Number(Number),
    /// String
    String(String),
    /// Ordered list
    List(Vec<StateValue>),
    /// Nested attributes
    Object(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// String content, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content, if this is a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric content, if this is a number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Integer content, if this is an integer that fits `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Nested attributes, if this is an object
    pub fn as_object(&self) -> Option<&BTreeMap<String, StateValue>> {
        match self {
            StateValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// List items, if this is a list
    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convert to a JSON value
    pub fn to_json(&self) -> Value {
        match self {
            StateValue::Null => Value::Null,
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::Number(n) => Value::Number(n.clone()),
            StateValue::String(s) => Value::String(s.clone()),
            StateValue::List(items) => Value::Array(items.iter().map(StateValue::to_json).collect()),
            StateValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Number(n) => StateValue::Number(n),
            Value::String(s) => StateValue::String(s),
            Value::Array(items) => StateValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                StateValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<f64> for StateValue {
    /// Non-finite floats have no JSON form and become `Null`
    fn from(value: f64) -> Self {
        Number::from_f64(value)
            .map(StateValue::Number)
            .unwrap_or(StateValue::Null)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Number(value.into())
    }
}

impl From<u64> for StateValue {
    fn from(value: u64) -> Self {
        StateValue::Number(value.into())
    }
}

/// Look up a dotted path
pub fn get_path<'a>(state: &'a StateMap, path: &str) -> Option<&'a StateValue> {
    let mut parts = path.split('.');
    let mut current = state.get(parts.next()?)?;
    for part in parts {
        current = match current {
            StateValue::Object(map) => map.get(part)?,
            StateValue::List(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a dotted path, creating intermediate objects
///
/// Numeric segments under a list address its items; an index at or past the
/// end appends a new item. Any other non-object value sitting on an
/// intermediate segment is replaced.
pub fn set_path(state: &mut StateMap, path: &str, value: StateValue) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((first, rest)) = parts.split_first() else {
        return;
    };
    let entry = state.entry(first.to_string()).or_insert(StateValue::Null);
    set_in(entry, rest, value);
}

fn set_in(target: &mut StateValue, parts: &[&str], value: StateValue) {
    let Some((head, rest)) = parts.split_first() else {
        *target = value;
        return;
    };

    if let (StateValue::List(items), Ok(index)) = (&mut *target, head.parse::<usize>()) {
        let index = if index < items.len() {
            index
        } else {
            items.push(StateValue::Null);
            items.len() - 1
        };
        set_in(&mut items[index], rest, value);
        return;
    }

    if !matches!(target, StateValue::Object(_)) {
        *target = StateValue::Object(BTreeMap::new());
    }
    if let StateValue::Object(map) = target {
        let child = map.entry(head.to_string()).or_insert(StateValue::Null);
        set_in(child, rest, value);
    }
}

/// Remove a dotted path, returning the removed value
///
/// Removing a list item shifts the items after it.
pub fn remove_path(state: &mut StateMap, path: &str) -> Option<StateValue> {
    let parts: Vec<&str> = path.split('.').collect();
    let (first, rest) = parts.split_first()?;
    if rest.is_empty() {
        return state.remove(*first);
    }
    remove_in(state.get_mut(*first)?, rest)
}

fn remove_in(target: &mut StateValue, parts: &[&str]) -> Option<StateValue> {
    let (head, rest) = parts.split_first()?;
    match target {
        StateValue::Object(map) if rest.is_empty() => map.remove(*head),
        StateValue::Object(map) => remove_in(map.get_mut(*head)?, rest),
        StateValue::List(items) => {
            let index = head.parse::<usize>().ok().filter(|i| *i < items.len())?;
            if rest.is_empty() {
                Some(items.remove(index))
            } else {
                remove_in(&mut items[index], rest)
            }
        }
        _ => None,
    }
}

/// Convert a JSON object into a snapshot; non-objects yield an empty map
pub fn from_json(value: Value) -> StateMap {
    match StateValue::from(value) {
        StateValue::Object(map) => map,
        _ => StateMap::new(),
    }
}

/// Convert a snapshot into a JSON object
pub fn to_json(state: &StateMap) -> Value {
    Value::Object(state.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}
