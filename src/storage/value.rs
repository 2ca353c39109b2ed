//! Value type for KVSQL
//!
//! A `Value` is what a record field, a literal, or an evaluated expression
//! holds. Records are stored as JSON, so every value has a JSON form.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

/// A value in the database
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// NULL value
    Null,
    /// Boolean value
    Boolean(bool),
    /// Integer value (64-bit)
    Integer(i64),
    /// Float value (64-bit)
    Float(f64),
    /// String value
    String(String),
    /// Ordered list of values
    List(Vec<Value>),
    /// String-keyed map, insertion ordered
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Check if this value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integers and floats are numeric. Booleans are not.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }

    /// Truthiness used by predicates: only `true` passes.
    pub fn is_true(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// One-character type code used in expression signatures.
    pub fn type_char(&self) -> char {
        match self {
            Value::Null => 'n',
            Value::Boolean(true) => '1',
            Value::Boolean(false) => '0',
            Value::Integer(_) => 'i',
            Value::Float(_) => 'f',
            Value::String(_) => 's',
            Value::List(_) => 'l',
            Value::Map(_) => 'd',
        }
    }

    /// Equality as seen by SQL comparisons. Integers and floats compare by
    /// numeric value; otherwise kinds must match.
    pub fn sql_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.sql_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map_or(false, |other| v.sql_eq(other)))
            }
            _ => self == other,
        }
    }

    /// Compare two scalar values of compatible kinds
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            _ => None,
        }
    }

    /// Add two values
    pub fn add(&self, other: &Value) -> Result<Value> {
        self.arithmetic(other, "+", i64::checked_add, |a, b| a + b)
    }

    /// Subtract two values
    pub fn sub(&self, other: &Value) -> Result<Value> {
        self.arithmetic(other, "-", i64::checked_sub, |a, b| a - b)
    }

    /// Multiply two values
    pub fn mul(&self, other: &Value) -> Result<Value> {
        self.arithmetic(other, "*", i64::checked_mul, |a, b| a * b)
    }

    /// Divide two values. Integer division stays integral only when exact.
    pub fn div(&self, other: &Value) -> Result<Value> {
        match other.as_f64() {
            Some(d) if d == 0.0 => return Err(Error::DivisionByZero),
            _ => {}
        }
        if let (Value::Integer(a), Value::Integer(b)) = (self, other) {
            if a.checked_rem(*b) == Some(0) {
                if let Some(q) = a.checked_div(*b) {
                    return Ok(Value::Integer(q));
                }
            }
            return Ok(Value::Float(*a as f64 / *b as f64));
        }
        self.arithmetic(other, "/", |_, _| None, |a, b| a / b)
    }

    /// Remainder of two values
    pub fn rem(&self, other: &Value) -> Result<Value> {
        match other.as_f64() {
            Some(d) if d == 0.0 => return Err(Error::DivisionByZero),
            _ => {}
        }
        self.arithmetic(other, "%", i64::checked_rem, |a, b| a % b)
    }

    /// Raise to a power
    pub fn pow(&self, other: &Value) -> Result<Value> {
        if let (Value::Integer(base), Value::Integer(exp)) = (self, other) {
            if let Ok(exp) = u32::try_from(*exp) {
                if let Some(v) = base.checked_pow(exp) {
                    return Ok(Value::Integer(v));
                }
            }
        }
        self.arithmetic(other, "^", |_, _| None, f64::powf)
    }

    fn arithmetic(
        &self,
        other: &Value,
        op: &str,
        int_op: impl Fn(i64, i64) -> Option<i64>,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> Result<Value> {
        if self.is_null() || other.is_null() {
            return Ok(Value::Null);
        }
        if let (Value::Integer(a), Value::Integer(b)) = (self, other) {
            if let Some(v) = int_op(*a, *b) {
                return Ok(Value::Integer(v));
            }
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(float_op(a, b))),
            _ => Err(Error::TypeMismatch(format!(
                "cannot apply '{}' to {} and {}",
                op,
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// String concatenation. Non-string operands contribute their canonical
    /// text.
    pub fn concat(&self, other: &Value) -> Value {
        if self.is_null() || other.is_null() {
            return Value::Null;
        }
        Value::String(format!("{}{}", self.to_plain_string(), other.to_plain_string()))
    }

    /// The value as text without string quoting
    pub fn to_plain_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Coerce to a number: numbers pass through, numeric strings are parsed,
    /// anything else becomes null.
    pub fn coerce_number(&self) -> Value {
        match self {
            Value::Integer(_) | Value::Float(_) => self.clone(),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Value::Integer(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            _ => Value::Null,
        }
    }

    /// Convert into a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Build from a JSON value. JSON integers become `Integer`, every other
    /// number becomes `Float`.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Deterministic JSON text, used as a grouping key
    pub fn json_key(&self) -> String {
        self.to_json().to_string()
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\"\"")),
            other => write!(f, "{}", other),
        }
    }
}

fn format_float(n: f64) -> String {
    let text = n.to_string();
    if n.is_finite() && !text.contains(['.', 'e', 'E']) {
        format!("{}.0", text)
    } else {
        text
    }
}

/// Canonical text: lowercase keywords, single-quoted strings, containers in
/// JSON layout with double-quoted nested strings.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", format_float(*n)),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_nested(f)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": ", key.replace('"', "\"\""))?;
                    value.fmt_nested(f)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}
