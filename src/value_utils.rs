use polars::prelude::AnyValue;
use serde_json::Value;

/// Text form of a cell; `None` for nulls and blank strings.
pub fn anyvalue_to_text(value: &AnyValue) -> Option<String> {
    let text = match value {
        AnyValue::Null => return None,
        AnyValue::Boolean(v) => v.to_string(),
        AnyValue::Int8(v) => v.to_string(),
        AnyValue::Int16(v) => v.to_string(),
        AnyValue::Int32(v) => v.to_string(),
        AnyValue::Int64(v) => v.to_string(),
        AnyValue::UInt8(v) => v.to_string(),
        AnyValue::UInt16(v) => v.to_string(),
        AnyValue::UInt32(v) => v.to_string(),
        AnyValue::UInt64(v) => v.to_string(),
        AnyValue::Float32(v) => f64::from(*v).to_string(),
        AnyValue::Float64(v) => v.to_string(),
        AnyValue::String(v) => v.to_string(),
        AnyValue::StringOwned(v) => v.to_string(),
        AnyValue::Datetime(_, _, _) | AnyValue::Date(_) | AnyValue::Time(_) => value.to_string(),
        other => other.to_string(),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Integer form of an id-like cell. Floats must be whole; strings must parse.
pub fn anyvalue_to_i64(value: &AnyValue) -> Option<i64> {
    match value {
        AnyValue::Int8(v) => Some(i64::from(*v)),
        AnyValue::Int16(v) => Some(i64::from(*v)),
        AnyValue::Int32(v) => Some(i64::from(*v)),
        AnyValue::Int64(v) => Some(*v),
        AnyValue::UInt8(v) => Some(i64::from(*v)),
        AnyValue::UInt16(v) => Some(i64::from(*v)),
        AnyValue::UInt32(v) => Some(i64::from(*v)),
        AnyValue::UInt64(v) => i64::try_from(*v).ok(),
        AnyValue::Float32(v) => float_to_i64(f64::from(*v)),
        AnyValue::Float64(v) => float_to_i64(*v),
        AnyValue::String(v) => parse_id(v),
        AnyValue::StringOwned(v) => parse_id(v.as_str()),
        _ => None,
    }
}

pub fn anyvalue_to_f64(value: &AnyValue) -> Option<f64> {
    match value {
        AnyValue::Float32(v) => Some(f64::from(*v)),
        AnyValue::Float64(v) => Some(*v),
        AnyValue::String(v) => v.trim().parse().ok(),
        AnyValue::StringOwned(v) => v.trim().parse().ok(),
        other => anyvalue_to_i64(other).map(|v| v as f64),
    }
}

/// Whole, in-range floats only; anything else would truncate or saturate.
pub(crate) fn float_to_i64(v: f64) -> Option<i64> {
    if v.is_finite() && v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn parse_id(text: &str) -> Option<i64> {
    let text = text.trim();
    text.parse::<i64>()
        .ok()
        .or_else(|| text.parse::<f64>().ok().and_then(float_to_i64))
}

/// Coerces a keyword cell into a list of strings. Native list cells keep
/// their string elements; text cells are decoded as JSON arrays. Anything
/// else, including malformed text, becomes an empty list.
pub fn anyvalue_to_string_list(value: &AnyValue) -> Vec<String> {
    match value {
        AnyValue::List(series) => series
            .iter()
            .filter_map(|inner| match inner {
                AnyValue::String(v) => Some(v.to_string()),
                AnyValue::StringOwned(v) => Some(v.to_string()),
                _ => None,
            })
            .collect(),
        AnyValue::String(v) => json_text_to_list(v),
        AnyValue::StringOwned(v) => json_text_to_list(v.as_str()),
        _ => Vec::new(),
    }
}

/// Decodes a JSON-encoded array cell, keeping string elements only.
pub fn json_text_to_list(text: &str) -> Vec<String> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Encodes a list as a JSON array string; non-ASCII text is written as-is.
pub fn to_json_list<S: AsRef<str>>(items: &[S]) -> String {
    let values: Vec<Value> = items
        .iter()
        .map(|item| Value::String(item.as_ref().to_string()))
        .collect();
    Value::Array(values).to_string()
}
