//! Query keys and their canonical hashes.
//!
//! A key is an ordered sequence of JSON values. Two keys that are structurally
//! equal produce the same hash no matter in which order object fields were
//! inserted, while the order of array elements stays significant.

use serde::Serialize;
use serde_json::{Number, Value};
use std::fmt;

use crate::error::QueryError;

/// Canonical, ordered form of a caller-supplied key.
///
/// Arrays become the key parts; any other value becomes a single-part key, so
/// `"todos"` and `["todos"]` address the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    /// Build a key from any serializable value.
    pub fn new<K>(key: &K) -> Result<Self, QueryError>
    where
        K: Serialize + ?Sized,
    {
        let value = serde_json::to_value(key).map_err(|e| QueryError::InvalidKey(e.to_string()))?;
        Ok(QueryKey::from(value))
    }

    /// The ordered key parts.
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Deterministic hash used to address the entry in a cache directory.
    pub fn hash(&self) -> String {
        let mut out = String::new();
        write_canonical(&Value::Array(self.0.clone()), &mut out);
        out
    }

    /// Check whether this key is addressed by `target`.
    ///
    /// In exact mode both hashes must be equal. Otherwise every part of `target`
    /// must be deep-included in the corresponding part of this key, which makes
    /// `["todos"]` match `["todos", {"page": 1}]`.
    pub fn matches(&self, target: &QueryKey, exact: bool) -> bool {
        if exact {
            return self.hash() == target.hash();
        }
        deep_includes_parts(&self.0, &target.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash())
    }
}

impl From<Value> for QueryKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(parts) => QueryKey(parts),
            other => QueryKey(vec![other]),
        }
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        QueryKey(parts)
    }
}

impl From<&str> for QueryKey {
    fn from(key: &str) -> Self {
        QueryKey(vec![Value::String(key.to_string())])
    }
}

impl From<String> for QueryKey {
    fn from(key: String) -> Self {
        QueryKey(vec![Value::String(key)])
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Serialize a value as compact JSON with object fields sorted by name.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, item)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Number(number) => write_number(number, out),
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Largest float below which every integer is exactly representable.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Integral floats are written like integers, so `1.0` and `1` hash alike.
fn write_number(number: &Number, out: &mut String) {
    match number.as_f64() {
        Some(x) if number.is_f64() && x.fract() == 0.0 && x.abs() < MAX_SAFE_INTEGER => {
            out.push_str(&(x as i64).to_string())
        }
        _ => out.push_str(&number.to_string()),
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    if a.is_f64() || b.is_f64() {
        a.as_f64() == b.as_f64()
    } else {
        a == b
    }
}

fn deep_includes_parts(candidate: &[Value], target: &[Value]) -> bool {
    target.len() <= candidate.len()
        && target
            .iter()
            .zip(candidate)
            .all(|(t, c)| deep_includes(c, t))
}

/// `a` deep-includes `b` when every field (or leading element) of `b` is
/// present in `a` and deep-includes as well. Scalars compare by equality, with
/// numbers compared by value.
fn deep_includes(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a), Value::Object(b)) => b
            .iter()
            .all(|(name, b_item)| a.get(name).is_some_and(|a_item| deep_includes(a_item, b_item))),
        (Value::Array(a), Value::Array(b)) => deep_includes_parts(a, b),
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (a, b) => a == b,
    }
}
