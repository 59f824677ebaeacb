use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::DecodeError;
use crate::types::FieldValue;

use super::field::{FieldDescriptor, FieldKind};

/// The remote store's representation of a single field value.
pub type WireValue = Value;

/// Sentinel written in place of a deleted field. Readers treat it as "field
/// absent".
pub const TOMBSTONE: WireValue = Value::Null;

pub fn is_tombstone(wire: &WireValue) -> bool {
    *wire == TOMBSTONE
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a field value for the wire. Total over every variant.
///
/// Text-like values, timestamps (RFC 3339) and numbers travel as strings;
/// multiple-choice values travel as an ordered array of option ids.
pub fn encode(value: &FieldValue) -> WireValue {
    match value {
        FieldValue::Text(s) | FieldValue::Single(s) => Value::String(s.clone()),
        FieldValue::MultipleChoice(ids) => {
            Value::Array(ids.iter().cloned().map(Value::String).collect())
        }
        FieldValue::DateTime(at) => {
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
        }
        FieldValue::Number(n) => Value::String(n.to_string()),
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode one wire value, dispatching on its shape.
///
/// A string decodes to text unless the descriptor declares another
/// string-shaped kind; an array of strings decodes to multiple-choice.
/// Every other shape is an explicit [`DecodeError::UnrecognizedShape`]:
/// nothing is coerced. Callers check [`is_tombstone`] first.
pub fn decode(descriptor: &FieldDescriptor, wire: &WireValue) -> Result<FieldValue, DecodeError> {
    match wire {
        Value::String(s) => decode_string(descriptor, s),
        Value::Array(items) => decode_array(descriptor, items),
        other => Err(DecodeError::UnrecognizedShape {
            field: descriptor.id.clone(),
            shape: shape_name(other).to_string(),
        }),
    }
}

fn decode_string(descriptor: &FieldDescriptor, s: &str) -> Result<FieldValue, DecodeError> {
    match descriptor.kind {
        None | Some(FieldKind::Text) => Ok(FieldValue::Text(s.to_string())),
        Some(FieldKind::Single) => Ok(FieldValue::Single(s.to_string())),
        Some(FieldKind::DateTime) => DateTime::parse_from_rfc3339(s)
            .map(|at| FieldValue::DateTime(at.with_timezone(&Utc)))
            .map_err(|_| invalid(descriptor, FieldKind::DateTime, s)),
        Some(FieldKind::Number) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(FieldValue::Number)
            .ok_or_else(|| invalid(descriptor, FieldKind::Number, s)),
        Some(FieldKind::MultipleChoice) => Err(DecodeError::KindMismatch {
            field: descriptor.id.clone(),
            expected: FieldKind::MultipleChoice.name().to_string(),
            received: "string".to_string(),
        }),
    }
}

fn decode_array(descriptor: &FieldDescriptor, items: &[Value]) -> Result<FieldValue, DecodeError> {
    if let Some(kind) = descriptor.kind {
        if kind.is_string_shaped() {
            return Err(DecodeError::KindMismatch {
                field: descriptor.id.clone(),
                expected: kind.name().to_string(),
                received: "array".to_string(),
            });
        }
    }

    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(id) => ids.push(id.clone()),
            other => {
                return Err(DecodeError::UnrecognizedShape {
                    field: descriptor.id.clone(),
                    shape: format!("array containing {}", shape_name(other)),
                })
            }
        }
    }
    Ok(FieldValue::multiple_choice(ids))
}

fn invalid(descriptor: &FieldDescriptor, kind: FieldKind, value: &str) -> DecodeError {
    DecodeError::InvalidValue {
        field: descriptor.id.clone(),
        expected: kind.name().to_string(),
        value: value.to_string(),
    }
}

/// JSON type name for diagnostics.
pub fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
