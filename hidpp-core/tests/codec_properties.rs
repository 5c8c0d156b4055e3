//! Property-based tests for the message codec and the feature models.

use hidpp_core::{
    feature::registry,
    field::Check,
    protocol::{v10, v20},
    report::{HEADER_LENGTH, ReportKind},
    schema::{Message, Schema, TypedMessage},
};
use proptest::prelude::*;

/// Every schema known to the crate, error replies included.
fn all_schemas() -> Vec<&'static Schema> {
    registry::models()
        .flat_map(|model| model.schemas())
        .chain([v10::ErrorMessage::schema(), v20::ErrorMessage::schema()])
        .collect()
}

/// Maps an arbitrary number onto a value the field accepts.
fn fit(raw: u128, max_value: u128, checks: &[Check]) -> u128 {
    let mut value = raw & max_value;
    for check in checks {
        value = match *check {
            Check::Range { min, max } => min + value % (max - min + 1),
            Check::ByteLength(len) if len < 16 => value & ((1u128 << (len * 8)) - 1),
            Check::ByteLength(_) => value,
            Check::OneOf(values) => values[(value % values.len() as u128) as usize],
        };
    }
    value
}

#[test]
fn schemas_fill_their_report() {
    for schema in all_schemas() {
        let bits = schema
            .placed_fields()
            .iter()
            .map(|placed| usize::from(placed.field.width))
            .sum::<usize>();

        assert_eq!(bits, schema.report.bits(), "{} does not fill its report", schema.name);
        assert!(schema.verify().is_ok(), "{} is malformed", schema.name);
    }
}

#[test]
fn models_resolve_the_same_schemas_every_time() {
    for model in registry::models() {
        assert!(model.validate().is_ok(), "{} is inconsistent", model.name);

        for api in model.versions {
            for function in api.functions {
                let first = model.get_request_schema(api.version, function.index).unwrap();
                let second = model.get_request_schema(api.version, function.index).unwrap();
                assert!(std::ptr::eq(first, second));
                assert!(std::ptr::eq(first, function.request));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every explicitly set field reads back unchanged, and reserved fields
    /// keep their defaults.
    #[test]
    fn prop_fields_round_trip(
        schema_index in 0usize..64,
        header in any::<[u8; 3]>(),
        raw in proptest::collection::vec(any::<u128>(), 16),
    ) {
        let schemas = all_schemas();
        let schema = schemas[schema_index % schemas.len()];

        let mut msg = Message::new(schema);
        let mut expected = Vec::new();
        for (placed, raw) in schema.placed_fields().iter().zip(raw.iter().cycle()) {
            if placed.offset < HEADER_LENGTH * 8 || placed.field.is_reserved() {
                continue;
            }
            let value = fit(*raw, placed.field.max_value(), placed.field.checks);
            msg.set(placed.field.name, value).unwrap();
            expected.push((placed.field.name, value));
        }

        let mut frame = msg.as_bytes().to_vec();
        frame[1] = header[0];
        if schema.kind != hidpp_core::schema::MessageKind::Error {
            frame[2] = header[1];
        }
        frame[3] = header[2];

        let decoded = schema.decode(&frame).unwrap();
        for (name, value) in expected {
            prop_assert_eq!(decoded.get(name).unwrap(), value, "field {}", name);
        }
        for placed in schema.placed_fields() {
            if let Some(default) = placed.field.default {
                prop_assert_eq!(decoded.get(placed.field.name).unwrap(), default);
            }
        }
        prop_assert_eq!(decoded.header().device_index, header[0]);
        prop_assert_eq!(decoded.as_bytes().len(), schema.report.size());
    }

    /// Frames shorter than the report are refused instead of read past.
    #[test]
    fn prop_short_frames_are_refused(len in 0usize..20) {
        for schema in all_schemas() {
            let frame = vec![0u8; len];
            let decoded = schema.decode(&frame);
            prop_assert_eq!(decoded.is_ok(), len >= schema.report.size());
        }
    }

    /// Values wider than a field never make it into the buffer.
    #[test]
    fn prop_oversized_values_are_refused(extra in 1u128..1024) {
        for schema in all_schemas() {
            for placed in schema.placed_fields() {
                if placed.field.width >= 128 || placed.offset < HEADER_LENGTH * 8 {
                    continue;
                }
                let mut msg = Message::new(schema);
                let value = placed.field.max_value() + extra;
                prop_assert!(msg.set(placed.field.name, value).is_err());
            }
        }
    }
}

#[test]
fn report_kinds_match_their_ids() {
    assert_eq!(ReportKind::from_id(0x10), Some(ReportKind::Short));
    assert_eq!(ReportKind::from_id(0x11), Some(ReportKind::Long));
    assert_eq!(ReportKind::Short.bits(), 56);
    assert_eq!(ReportKind::Long.bits(), 160);
}
