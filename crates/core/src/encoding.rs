//! Structural encoding: lossless conversion to and from a map of scalars,
//! nested maps and lists.
//!
//! This is the representation used for persisted rows and bus messages.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{DomainError, DomainResult};

/// A structural map (string keys, JSON-like values).
pub type StructMap = serde_json::Map<String, Value>;

/// Encode any serializable value into a [`StructMap`].
///
/// Fails if the value does not serialize to a map (e.g. a bare scalar).
pub fn encode<T: Serialize + ?Sized>(value: &T) -> DomainResult<StructMap> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DomainError::validation(format!(
            "expected a structural map, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(DomainError::validation(format!("encode failed: {e}"))),
    }
}

/// Decode a value from a [`StructMap`], running the type's validation.
pub fn decode<T: DeserializeOwned>(map: &StructMap) -> DomainResult<T> {
    serde_json::from_value(Value::Object(map.clone()))
        .map_err(|e| DomainError::validation(format!("decode failed: {e}")))
}

/// Encode/decode capability, available to every serde type.
pub trait StructuralEncoding: Sized {
    fn to_map(&self) -> DomainResult<StructMap>;
    fn from_map(map: &StructMap) -> DomainResult<Self>;
}

impl<T: Serialize + DeserializeOwned> StructuralEncoding for T {
    fn to_map(&self) -> DomainResult<StructMap> {
        encode(self)
    }

    fn from_map(map: &StructMap) -> DomainResult<Self> {
        decode(map)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
