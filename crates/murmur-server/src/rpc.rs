//! Field extraction for request `data` payloads.

use serde::Serialize;
use serde_json::Value;

use crate::error::HubError;

/// Extract a required, non-null value.
pub fn require_value<'a>(data: &'a Value, key: &str) -> Result<&'a Value, HubError> {
    data.get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| HubError::missing_field(key))
}

pub fn require_str<'a>(data: &'a Value, key: &str) -> Result<&'a str, HubError> {
    data.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::missing_field(key))
}

pub fn require_u64(data: &Value, key: &str) -> Result<u64, HubError> {
    data.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| HubError::missing_field(key))
}

/// Serialize a handler result into response `data`.
pub fn to_data<T: Serialize>(value: &T) -> Result<Value, HubError> {
    serde_json::to_value(value).map_err(|e| HubError::Internal(e.to_string()))
}
