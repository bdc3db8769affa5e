//! Query keys: ordered sequences of primitive values identifying a request.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use super::error::{QueryError, QueryResult};

/// A finite float stored by bit pattern so keys can be hashed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiniteF64(u64);

impl FiniteF64 {
  /// Returns `None` for NaN and infinities. `-0.0` is folded into `0.0`.
  pub fn new(value: f64) -> Option<Self> {
    if !value.is_finite() {
      return None;
    }
    let value = if value == 0.0 { 0.0 } else { value };
    Some(Self(value.to_bits()))
  }

  pub fn get(self) -> f64 {
    f64::from_bits(self.0)
  }
}

/// One element of a query key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyPart {
  Text(String),
  Int(i64),
  /// Only used for values above `i64::MAX`; smaller unsigned values become `Int`.
  UInt(u64),
  Float(FiniteF64),
  Bool(bool),
}

impl KeyPart {
  fn to_json(&self) -> Value {
    match self {
      KeyPart::Text(s) => Value::from(s.as_str()),
      KeyPart::Int(i) => Value::from(*i),
      KeyPart::UInt(u) => Value::from(*u),
      KeyPart::Float(f) => Value::from(f.get()),
      KeyPart::Bool(b) => Value::from(*b),
    }
  }

  /// Build a part from a float, rejecting non-finite values.
  pub fn float(value: f64) -> QueryResult<Self> {
    FiniteF64::new(value)
      .map(KeyPart::Float)
      .ok_or_else(|| QueryError::InvalidKey(format!("non-finite number {}", value)))
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Text(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Text(s)
  }
}

impl From<&String> for KeyPart {
  fn from(s: &String) -> Self {
    KeyPart::Text(s.clone())
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl From<i32> for KeyPart {
  fn from(i: i32) -> Self {
    KeyPart::Int(i64::from(i))
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    KeyPart::Int(i)
  }
}

impl From<u32> for KeyPart {
  fn from(u: u32) -> Self {
    KeyPart::Int(i64::from(u))
  }
}

impl From<u64> for KeyPart {
  fn from(u: u64) -> Self {
    match i64::try_from(u) {
      Ok(i) => KeyPart::Int(i),
      Err(_) => KeyPart::UInt(u),
    }
  }
}

impl From<usize> for KeyPart {
  fn from(u: usize) -> Self {
    KeyPart::from(u as u64)
  }
}

impl TryFrom<f64> for KeyPart {
  type Error = QueryError;

  fn try_from(value: f64) -> QueryResult<Self> {
    KeyPart::float(value)
  }
}

impl TryFrom<&Value> for KeyPart {
  type Error = QueryError;

  fn try_from(value: &Value) -> QueryResult<Self> {
    match value {
      Value::String(s) => Ok(KeyPart::Text(s.clone())),
      Value::Bool(b) => Ok(KeyPart::Bool(*b)),
      Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Ok(KeyPart::Int(i))
        } else if let Some(u) = n.as_u64() {
          Ok(KeyPart::from(u))
        } else {
          n.as_f64()
            .ok_or_else(|| QueryError::InvalidKey(format!("unrepresentable number {}", n)))
            .and_then(KeyPart::float)
        }
      }
      other => Err(QueryError::InvalidKey(format!(
        "key parts must be strings, numbers or booleans, got {}",
        other
      ))),
    }
  }
}

/// Identifier of a logical data request, e.g. `["leads-list", 0, 20]`.
///
/// Two keys are equal iff their serialized forms are equal element by element.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  parts: Vec<KeyPart>,
}

impl QueryKey {
  /// Start a key with its first part. Use [`QueryKey::with`] to append more.
  pub fn of(first: impl Into<KeyPart>) -> Self {
    Self {
      parts: vec![first.into()],
    }
  }

  /// Build a key from already-validated parts. Empty keys are rejected.
  pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> QueryResult<Self> {
    let parts: Vec<KeyPart> = parts.into_iter().collect();
    if parts.is_empty() {
      return Err(QueryError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(Self { parts })
  }

  /// Build a key from a JSON array of primitives.
  pub fn from_json(value: &Value) -> QueryResult<Self> {
    let items = value.as_array().ok_or_else(|| {
      QueryError::InvalidKey(format!("expected a JSON array, got {}", value))
    })?;
    let parts = items
      .iter()
      .map(KeyPart::try_from)
      .collect::<QueryResult<Vec<_>>>()?;
    Self::new(parts)
  }

  /// Append a part.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.parts.push(part.into());
    self
  }

  /// Append an optional part; `None` leaves the key unchanged.
  pub fn with_opt<P: Into<KeyPart>>(self, part: Option<P>) -> Self {
    match part {
      Some(p) => self.with(p),
      None => self,
    }
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.parts
  }

  pub fn len(&self) -> usize {
    self.parts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.parts.is_empty()
  }

  /// True when the first `prefix.len()` parts of this key equal `prefix`.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.parts.starts_with(&prefix.parts)
  }

  /// Canonical serialized form (a JSON array).
  pub fn serialized(&self) -> String {
    Value::Array(self.parts.iter().map(KeyPart::to_json).collect()).to_string()
  }

  /// SHA-256 of the serialized form, stable across runs.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.serialized().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.serialized())
  }
}

impl fmt::Debug for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "QueryKey({})", self.serialized())
  }
}

/// Build a [`QueryKey`] from a list of primitive expressions.
///
/// ```ignore
/// let key = query_key!["leads-list", page, per_page];
/// ```
#[macro_export]
macro_rules! query_key {
  ($first:expr $(, $rest:expr)* $(,)?) => {
    $crate::cache::QueryKey::of($first)$(.with($rest))*
  };
}
