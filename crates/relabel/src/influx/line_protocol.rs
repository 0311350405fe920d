//! Line protocol encoding for replacement points.
//!
//! Points carry no tags and a single float field, written with nanosecond
//! precision: `<measurement> value=<float> <unix nanos>`.

use crate::error::StoreError;
use crate::models::{ReplacementPoint, VALUE_FIELD};

/// Escape a measurement name: commas, spaces and backslashes
pub fn escape_measurement(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' | ' ' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Encode one point as a line (without trailing newline)
pub fn encode_point(point: &ReplacementPoint) -> Result<String, StoreError> {
    if point.measurement.is_empty() {
        return Err(StoreError::InvalidPoint("measurement name is empty".to_string()));
    }
    if !point.value.is_finite() {
        return Err(StoreError::InvalidPoint(format!(
            "value {} is not a finite float",
            point.value
        )));
    }
    let nanos = point.timestamp.timestamp_nanos_opt().ok_or_else(|| {
        StoreError::InvalidPoint(format!(
            "timestamp {} is outside the nanosecond range",
            point.timestamp
        ))
    })?;

    Ok(format!(
        "{} {}={:?} {}",
        escape_measurement(&point.measurement),
        VALUE_FIELD,
        point.value,
        nanos
    ))
}

/// Encode a batch as a newline-separated request body
pub fn encode_batch(points: &[ReplacementPoint]) -> Result<String, StoreError> {
    let lines = points
        .iter()
        .map(encode_point)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(lines.join("\n"))
}
