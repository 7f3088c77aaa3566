//! Record values and typed keys.
//!
//! A [`Value`] is the unit of storage: a JSON-like record with typed dates.
//! A [`Key`] is the subset of values usable as a primary or index key, with
//! the total order the whole layer agrees on: numbers sort before dates,
//! dates before strings, strings before tuples, and tuples compare
//! lexicographically with element-wise type-respecting comparison.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::schema::KeyType;
use crate::{DbError, Result};

// Value

/// A stored record or field value.
///
/// Variants:
/// - Primitive types: Null, Bool, Number, Text
/// - Date/Time: Date (UTC, millisecond precision in practice)
/// - Collection types: Array, Object (insertion-ordered)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Date(_) => "date",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Build an empty object.
    pub fn object() -> Self {
        Value::Object(IndexMap::new())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a field by dotted path (`"a.b.c"`).
    ///
    /// Returns `None` when any segment is missing or a non-object is
    /// traversed.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Write a value at a dotted path, creating intermediate objects.
    ///
    /// Fails when a non-object is in the way.
    pub fn set_path(&mut self, path: &str, value: Value) -> Result<()> {
        let mut current = self;
        let segments: Vec<&str> = path.split('.').collect();
        for (i, segment) in segments.iter().enumerate() {
            let map = match current {
                Value::Object(map) => map,
                other => {
                    return Err(DbError::Argument(format!(
                        "cannot set key path '{path}' through a {}",
                        other.type_name()
                    )));
                }
            };
            if i == segments.len() - 1 {
                map.insert((*segment).to_string(), value);
                return Ok(());
            }
            current = map
                .entry((*segment).to_string())
                .or_insert_with(Value::object);
        }
        Ok(())
    }

    /// Convert to a plain JSON value. Dates become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    serde_json::Value::from(*n as i64)
                } else {
                    serde_json::Value::from(*n)
                }
            }
            Value::Date(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from a plain JSON value.
    ///
    /// JSON has no date type, so dates arrive as `Text`; typed dates only
    /// exist for values constructed in-process.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                Value::Number(n.as_f64().unwrap_or(0.0))
            }
            serde_json::Value::String(s) => Value::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Number(n) => Value::Number(n),
            Key::Date(dt) => Value::Date(dt),
            Key::Text(s) => Value::Text(s),
            Key::Tuple(parts) => Value::Array(parts.into_iter().map(Value::from).collect()),
        }
    }
}

// Key

/// A primary or index key.
///
/// The cross-type order is fixed: `Number < Date < Text < Tuple`. `Number`
/// is always finite; NaN and infinities are rejected at construction, which
/// is what makes [`Ord`] total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
    Tuple(Vec<Key>),
}

impl Key {
    /// Build a number key, rejecting non-finite values.
    pub fn number(n: f64) -> Result<Key> {
        if n.is_finite() {
            Ok(Key::Number(n))
        } else {
            Err(DbError::Argument(format!("non-finite number key: {n}")))
        }
    }

    pub fn text(s: impl Into<String>) -> Key {
        Key::Text(s.into())
    }

    /// Extract a key from a field value.
    ///
    /// Arrays become `Tuple` element-wise; non-keyable values (null,
    /// bool, object) are rejected.
    pub fn from_value(value: &Value) -> Result<Key> {
        match value {
            Value::Number(n) => Key::number(*n),
            Value::Date(dt) => Ok(Key::Date(*dt)),
            Value::Text(s) => Ok(Key::Text(s.clone())),
            Value::Array(items) => Ok(Key::Tuple(
                items.iter().map(Key::from_value).collect::<Result<_>>()?,
            )),
            other => Err(DbError::Argument(format!(
                "{} is not a valid key",
                other.type_name()
            ))),
        }
    }

    /// Ordering rank of the key's type. Lower ranks sort first.
    fn type_rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::Date(_) => 1,
            Key::Text(_) => 2,
            Key::Tuple(_) => 3,
        }
    }

    /// Check the key against a declared key type.
    pub fn conforms_to(&self, key_type: &KeyType) -> bool {
        match (self, key_type) {
            (Key::Number(_), KeyType::Number) => true,
            (Key::Date(_), KeyType::Date) => true,
            (Key::Text(_), KeyType::Text) => true,
            (Key::Tuple(parts), KeyType::Tuple(types)) => {
                parts.len() == types.len()
                    && parts.iter().zip(types).all(|(p, t)| p.conforms_to(t))
            }
            _ => false,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => {
                // Keys are finite by construction, so partial_cmp is total.
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Key::Date(a), Key::Date(b)) => a.cmp(b),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (Key::Tuple(a), Key::Tuple(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{n}"),
            Key::Date(dt) => write!(f, "{}", dt.to_rfc3339()),
            Key::Text(s) => write!(f, "{s:?}"),
            Key::Tuple(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

/// A convenience for building object values in tests and examples.
#[macro_export]
macro_rules! record {
    ($($field:expr => $value:expr),* $(,)?) => {{
        let mut map = indexmap::IndexMap::new();
        $(map.insert($field.to_string(), $crate::Value::from($value));)*
        $crate::Value::Object(map)
    }};
}
