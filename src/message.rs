//! Decoded message payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Lookup failure on a [`Payload`] field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("field '{key}' is missing")]
    Missing { key: String },

    #[error("field '{key}' is not {expected}: {found}")]
    Mismatch {
        key: String,
        expected: &'static str,
        found: String,
    },
}

/// A JSON object received from a queue, with typed accessors.
///
/// Bodies that are not JSON objects (arrays, scalars, invalid JSON) do not
/// decode into a `Payload`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Builds a payload from any value that serializes to a JSON object.
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(value)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.0)
    }

    /// Deserializes the whole payload into a schema type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(Value::Object(self.0.clone()))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    fn field(&self, key: &str) -> Result<&Value, FieldError> {
        self.0.get(key).ok_or_else(|| FieldError::Missing { key: key.to_string() })
    }

    pub fn get_str(&self, key: &str) -> Result<&str, FieldError> {
        let value = self.field(key)?;
        value.as_str().ok_or_else(|| mismatch(key, "a string", value))
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, FieldError> {
        let value = self.field(key)?;
        value.as_i64().ok_or_else(|| mismatch(key, "a signed integer", value))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, FieldError> {
        let value = self.field(key)?;
        value.as_u64().ok_or_else(|| mismatch(key, "an unsigned integer", value))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, FieldError> {
        let value = self.field(key)?;
        value.as_f64().ok_or_else(|| mismatch(key, "a number", value))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, FieldError> {
        let value = self.field(key)?;
        value.as_bool().ok_or_else(|| mismatch(key, "a boolean", value))
    }

    /// Nested object field as a `Payload`.
    pub fn get_object(&self, key: &str) -> Result<Payload, FieldError> {
        match self.field(key)? {
            Value::Object(map) => Ok(Payload(map.clone())),
            other => Err(mismatch(key, "an object", other)),
        }
    }

    /// Deserializes one field into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, FieldError> {
        let value = self.field(key)?;
        T::deserialize(value).map_err(|e| FieldError::Mismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>(),
            found: e.to_string(),
        })
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        Value::Object(payload.0)
    }
}

fn mismatch(key: &str, expected: &'static str, found: &Value) -> FieldError {
    FieldError::Mismatch {
        key: key.to_string(),
        expected,
        found: found.to_string(),
    }
}
