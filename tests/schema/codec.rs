//! Field value codec: shape dispatch, declared kinds and failure reporting.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use field_sync::error::DecodeError;
use field_sync::schema::{decode, encode, is_tombstone, FieldDescriptor, FieldKind, TOMBSTONE};
use field_sync::types::FieldValue;

fn untyped(id: &str) -> FieldDescriptor {
    FieldDescriptor::untyped(id)
}

// ============================================================================
// Shape dispatch
// ============================================================================

#[test]
fn string_decodes_as_text_by_default() {
    let value = decode(&untyped("notes"), &json!("hello")).unwrap();
    assert_eq!(value, FieldValue::text("hello"));
}

#[test]
fn string_array_decodes_as_multiple_choice() {
    let value = decode(&untyped("tags"), &json!(["a", "b"])).unwrap();
    assert_eq!(value, FieldValue::multiple_choice(["a", "b"]));
}

#[test]
fn empty_array_is_an_empty_selection() {
    let value = decode(&untyped("tags"), &json!([])).unwrap();
    assert_eq!(value, FieldValue::MultipleChoice(vec![]));
}

#[test]
fn duplicate_choices_collapse_on_decode() {
    let value = decode(&untyped("tags"), &json!(["a", "b", "a"])).unwrap();
    assert_eq!(value, FieldValue::MultipleChoice(vec!["a".into(), "b".into()]));
}

#[test]
fn raw_number_is_unrecognized() {
    let err = decode(&untyped("choice"), &json!(12345)).unwrap_err();
    assert!(
        matches!(err, DecodeError::UnrecognizedShape { ref field, .. } if field == "choice"),
        "unexpected error: {err:?}"
    );
    assert_eq!(err.field(), "choice");
}

#[test]
fn objects_and_booleans_are_unrecognized() {
    for wire in [json!({"x": 1}), json!(true)] {
        let err = decode(&untyped("f"), &wire).unwrap_err();
        assert!(matches!(err, DecodeError::UnrecognizedShape { .. }), "{wire}: {err:?}");
    }
}

#[test]
fn array_with_non_string_element_is_unrecognized() {
    let err = decode(&untyped("tags"), &json!(["a", 2])).unwrap_err();
    match err {
        DecodeError::UnrecognizedShape { field, shape } => {
            assert_eq!(field, "tags");
            assert!(shape.contains("array"), "shape was {shape}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn tombstone_is_recognized() {
    assert!(is_tombstone(&TOMBSTONE));
    assert!(is_tombstone(&json!(null)));
    assert!(!is_tombstone(&json!("")));
}

// ============================================================================
// Declared kinds
// ============================================================================

#[test]
fn single_select_keeps_its_kind() {
    let d = FieldDescriptor::typed("color", FieldKind::Single);
    let value = decode(&d, &json!("red")).unwrap();
    assert_eq!(value, FieldValue::Single("red".into()));
    assert_eq!(encode(&value), json!("red"));
}

#[test]
fn date_time_round_trips_at_millisecond_precision() {
    let d = FieldDescriptor::typed("seen_at", FieldKind::DateTime);
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
    let wire = encode(&FieldValue::DateTime(at));
    assert_eq!(wire, json!("2024-05-01T10:30:00.000Z"));
    assert_eq!(decode(&d, &wire).unwrap(), FieldValue::DateTime(at));
}

#[test]
fn number_travels_as_decimal_string() {
    let d = FieldDescriptor::typed("count", FieldKind::Number);
    let wire = encode(&FieldValue::Number(12.5));
    assert_eq!(wire, json!("12.5"));
    assert_eq!(decode(&d, &wire).unwrap(), FieldValue::Number(12.5));
}

#[test]
fn unparseable_number_is_invalid_value() {
    let d = FieldDescriptor::typed("count", FieldKind::Number);
    let err = decode(&d, &json!("twelve")).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidValue { .. }), "{err:?}");
}

#[test]
fn non_finite_number_is_invalid_value() {
    let d = FieldDescriptor::typed("depth", FieldKind::Number);
    for raw in ["NaN", "inf", "-inf", "infinity", " Infinity "] {
        let err = decode(&d, &json!(raw)).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { .. }), "{raw}: {err:?}");
    }
}

#[test]
fn unparseable_date_is_invalid_value() {
    let d = FieldDescriptor::typed("seen_at", FieldKind::DateTime);
    let err = decode(&d, &json!("yesterday")).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidValue { .. }), "{err:?}");
}

#[test]
fn multiple_choice_field_rejects_a_string() {
    let d = FieldDescriptor::typed("tags", FieldKind::MultipleChoice);
    let err = decode(&d, &json!("a")).unwrap_err();
    assert!(matches!(err, DecodeError::KindMismatch { .. }), "{err:?}");
}

#[test]
fn text_field_rejects_an_array() {
    let d = FieldDescriptor::typed("notes", FieldKind::Text);
    let err = decode(&d, &json!(["a"])).unwrap_err();
    assert!(matches!(err, DecodeError::KindMismatch { .. }), "{err:?}");
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn multiple_choice_survives_the_wire(ids in prop::collection::vec("[a-z0-9]{1,6}", 0..12)) {
        let value = FieldValue::multiple_choice(ids.clone());
        let decoded = decode(&untyped("tags"), &encode(&value)).unwrap();
        prop_assert_eq!(&decoded, &value);

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        match decoded {
            FieldValue::MultipleChoice(got) => prop_assert_eq!(got.len(), unique.len()),
            other => prop_assert!(false, "decoded as {:?}", other),
        }
    }

    #[test]
    fn text_survives_the_wire(s in ".*") {
        let value = FieldValue::text(s);
        prop_assert_eq!(decode(&untyped("notes"), &encode(&value)).unwrap(), value);
    }
}
