//! Canonical cache keys for logical read operations.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Largest integer an `f64` holds without rounding (2^53 - 1).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A primitive query parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
  Str(String),
  Int(i64),
  Float(f64),
  Bool(bool),
  Null,
}

impl ParamValue {
  /// Parse a command-line style literal.
  ///
  /// `true`/`false` become booleans, `null` becomes null, integers and
  /// finite floats become numbers, anything else stays a string.
  pub fn parse_literal(raw: &str) -> Self {
    match raw {
      "true" => return ParamValue::Bool(true),
      "false" => return ParamValue::Bool(false),
      "null" => return ParamValue::Null,
      _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
      return ParamValue::Int(i);
    }
    match raw.parse::<f64>() {
      Ok(f) if f.is_finite() => ParamValue::Float(f),
      _ => ParamValue::Str(raw.to_string()),
    }
  }

  /// Text used on the wire. Nulls are not sent.
  pub fn to_query_value(&self) -> Option<String> {
    match self {
      ParamValue::Str(s) => Some(s.clone()),
      ParamValue::Int(i) => Some(i.to_string()),
      ParamValue::Float(f) => Some(f.to_string()),
      ParamValue::Bool(b) => Some(b.to_string()),
      ParamValue::Null => None,
    }
  }

  /// Whole floats in the exactly representable integer range encode as
  /// integers, so `Float(2.0)` and `Int(2)` share a key.
  fn to_json(&self) -> Value {
    match self {
      ParamValue::Str(s) => Value::String(s.clone()),
      ParamValue::Int(i) => Value::Number((*i).into()),
      ParamValue::Float(f) if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => {
        Value::Number((*f as i64).into())
      }
      ParamValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
      ParamValue::Bool(b) => Value::Bool(*b),
      ParamValue::Null => Value::Null,
    }
  }
}

impl From<&str> for ParamValue {
  fn from(v: &str) -> Self {
    ParamValue::Str(v.to_string())
  }
}

impl From<String> for ParamValue {
  fn from(v: String) -> Self {
    ParamValue::Str(v)
  }
}

impl From<i64> for ParamValue {
  fn from(v: i64) -> Self {
    ParamValue::Int(v)
  }
}

impl From<i32> for ParamValue {
  fn from(v: i32) -> Self {
    ParamValue::Int(v.into())
  }
}

impl From<u32> for ParamValue {
  fn from(v: u32) -> Self {
    ParamValue::Int(v.into())
  }
}

impl From<f64> for ParamValue {
  fn from(v: f64) -> Self {
    ParamValue::Float(v)
  }
}

impl From<bool> for ParamValue {
  fn from(v: bool) -> Self {
    ParamValue::Bool(v)
  }
}

/// Query parameters for a read.
///
/// Stored sorted by name, so insertion order never reaches the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
  values: BTreeMap<String, ParamValue>,
}

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a parameter, replacing any previous value with the same name.
  pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
    self.insert(name, value);
    self
  }

  /// Add a parameter only when a value is present.
  ///
  /// `None` leaves the parameter out entirely, so `{page: None}` and `{}`
  /// produce the same key.
  pub fn with_opt<V: Into<ParamValue>>(self, name: impl Into<String>, value: Option<V>) -> Self {
    match value {
      Some(v) => self.with(name, v),
      None => self,
    }
  }

  pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
    self.values.insert(name.into(), value.into());
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v))
  }

  /// Name/value pairs to send as a query string, in key order.
  pub fn query_pairs(&self) -> Vec<(String, String)> {
    self
      .values
      .iter()
      .filter_map(|(k, v)| v.to_query_value().map(|v| (k.clone(), v)))
      .collect()
  }

  /// Canonical JSON object text: sorted keys, no whitespace.
  fn canonical(&self) -> String {
    let map: Map<String, Value> = self
      .values
      .iter()
      .map(|(k, v)| (k.clone(), v.to_json()))
      .collect();
    Value::Object(map).to_string()
  }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    let mut params = Params::new();
    for (k, v) in iter {
      params.insert(k, v);
    }
    params
  }
}

/// Opaque identifier of one logical read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl AsRef<str> for CacheKey {
  fn as_ref(&self) -> &str {
    &self.0
  }
}

/// Build the cache key for `path` with optional `params`.
///
/// The key is `<path>:<json>`, where `<json>` is the parameters as a JSON
/// object with sorted keys. Missing params are encoded as `{}`. Values
/// keep their type (`"1"` and `1` differ) except that whole floats encode
/// as integers.
pub fn build_key(path: &str, params: Option<&Params>) -> CacheKey {
  let params = match params {
    Some(p) => p.canonical(),
    None => "{}".to_string(),
  };
  CacheKey(format!("{}:{}", path, params))
}
