//! Event payload construction with safe substitution.
//!
//! A single malformed payload must never abort a session, so anything that
//! cannot survive a JSON round-trip is replaced by a string representation
//! instead of producing an error:
//!
//! - serialization failures (non-string map keys, failing `Serialize` impls)
//!   become the value's `Debug` rendering
//! - non-finite floats become `"NaN"`, `"Infinity"`, `"-Infinity"`, both in
//!   typed values passed to [`to_payload`] and when inserted through
//!   [`safe_number`]
//! - nesting deeper than [`MAX_DEPTH`] is cut off with a marker string, which
//!   keeps decoded messages under the parser's recursion limit

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use self::finite::{Finite, non_finite_name};

mod finite;

/// An event payload: always a JSON object.
pub type Payload = Map<String, Value>;

/// Deepest nesting kept inside an event payload.
pub const MAX_DEPTH: usize = 64;

/// Marker substituted for subtrees below [`MAX_DEPTH`].
pub const TRUNCATED_MARKER: &str = "[truncated: nesting too deep]";

/// JSON value for a float, with a string stand-in for non-finite values.
pub fn safe_number(value: f64) -> Value {
    match serde_json::Number::from_f64(value) {
        Some(n) => Value::Number(n),
        None => Value::String(non_finite_name(value).into()),
    }
}

/// Convert any serializable value into a payload object.
///
/// Non-object values are wrapped as `{"value": ...}`. Non-finite floats
/// anywhere in `value` are written as strings. Serialization failures are
/// logged and replaced with the value's `Debug` rendering plus a
/// `serializationError` description.
pub fn to_payload<T>(value: &T) -> Payload
where
    T: Serialize + fmt::Debug + ?Sized,
{
    match serde_json::to_value(Finite(value)) {
        Ok(Value::Object(map)) => sanitize_map(map),
        Ok(other) => {
            let mut map = Map::new();
            let _ = map.insert("value".into(), sanitize(other));
            map
        }
        Err(e) => {
            warn!(error = %e, "payload not serializable, substituting string representation");
            let mut map = Map::new();
            let _ = map.insert("value".into(), Value::String(format!("{value:?}")));
            let _ = map.insert("serializationError".into(), Value::String(e.to_string()));
            map
        }
    }
}

/// Sanitize every value of a payload object.
pub fn sanitize_map(map: Payload) -> Payload {
    map.into_iter()
        .map(|(k, v)| (k, sanitize_at(v, 1)))
        .collect()
}

/// Cut off subtrees nested deeper than [`MAX_DEPTH`].
pub fn sanitize(value: Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH && matches!(value, Value::Array(_) | Value::Object(_)) {
        return Value::String(TRUNCATED_MARKER.into());
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| sanitize_at(v, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_at(v, depth + 1)))
                .collect(),
        ),
        scalar => scalar,
    }
}
