//! Conversions between JSON values and CRDT values.

use std::collections::HashMap;

use loro::LoroValue;
use serde_json::{Map, Number, Value};

/// Convert a JSON value into a CRDT value.
///
/// Integers that fit in `i64` stay integral; everything else numeric
/// becomes a double.
pub fn to_loro(value: &Value) -> LoroValue {
    match value {
        Value::Null => LoroValue::Null,
        Value::Bool(b) => LoroValue::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => LoroValue::from(i),
            None => LoroValue::from(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => LoroValue::from(s.as_str()),
        Value::Array(items) => LoroValue::from(items.iter().map(to_loro).collect::<Vec<_>>()),
        Value::Object(fields) => LoroValue::from(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), to_loro(v)))
                .collect::<HashMap<String, LoroValue>>(),
        ),
    }
}

/// Convert a CRDT value into JSON.
///
/// Binary payloads become arrays of bytes; nested container references,
/// which only appear in shallow values, become `null`.
pub fn to_json(value: &LoroValue) -> Value {
    match value {
        LoroValue::Null => Value::Null,
        LoroValue::Bool(b) => Value::Bool(*b),
        LoroValue::I64(i) => Value::Number((*i).into()),
        LoroValue::Double(d) => Number::from_f64(*d).map(Value::Number).unwrap_or(Value::Null),
        LoroValue::String(s) => Value::String(s.to_string()),
        LoroValue::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        LoroValue::List(items) => Value::Array(items.iter().map(to_json).collect()),
        LoroValue::Map(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        LoroValue::Container(_) => Value::Null,
    }
}
