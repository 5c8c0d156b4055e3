//! Declarative message schemas and the codec built on top of them.
//!
//! A [`FieldSet`] is an ordered list of [`BitField`]s that may extend another
//! field set, which is how every message inherits the fixed HID++ header.
//! A [`Schema`] binds a field set to a report size and to the feature,
//! function and versions the message belongs to. Offsets are computed once,
//! the first time a schema is used, by sorting all fields by descending field
//! ID and packing them from the first bit of the report.
//!
//! Typed messages are generated with [`hidpp_message!`], producing a plain
//! struct whose members are the schema fields, so misspelled field names are
//! compile-time errors.

use std::{collections::HashMap, fmt, sync::OnceLock};

use thiserror::Error;

use crate::{
    field::{self, BitField, FieldValue, RangeViolation},
    nibble::{self, U4},
    report::{LONG_REPORT_LENGTH, MessageHeader, ReportKind},
};

/// Field IDs of the fixed header. Payload fields start at
/// [`fid::FIRST_PAYLOAD`] and count down.
pub mod fid {
    pub const REPORT_ID: u8 = 0xff;
    pub const DEVICE_INDEX: u8 = 0xfe;
    pub const FEATURE_INDEX: u8 = 0xfd;
    pub const FUNCTION_INDEX: u8 = 0xfc;
    pub const SOFTWARE_ID: u8 = 0xfb;
    pub const FIRST_PAYLOAD: u8 = SOFTWARE_ID - 1;
}

const HEADER_FIELDS: &[BitField] = &[
    BitField::new(fid::REPORT_ID, "report_id", 8),
    BitField::new(fid::DEVICE_INDEX, "device_index", 8),
    BitField::new(fid::FEATURE_INDEX, "feature_index", 8),
    BitField::new(fid::FUNCTION_INDEX, "function_index", 4),
    BitField::new(fid::SOFTWARE_ID, "software_id", 4),
];

/// The header every HID++ message schema extends.
pub static HIDPP_HEADER: FieldSet = FieldSet::new("HidppHeader", None, HEADER_FIELDS);

/// Represents an error that occurred when encoding or decoding a message.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum CodecError {
    /// A value does not fit into its field or was rejected by one of its
    /// checks.
    #[error("value {value:#x} is invalid for field `{field}`: {violation}")]
    FieldRange {
        field: &'static str,
        value: u128,
        violation: RangeViolation,
    },

    /// The frame is shorter than the report size of the schema.
    #[error("`{schema}` needs {expected} bytes, but the frame only has {actual}")]
    FrameTooShort {
        schema: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The schema has no field with the given name.
    #[error("`{schema}` has no field named `{field}`")]
    UnknownField { schema: &'static str, field: String },

    /// A field of the schema lies outside of its report.
    #[error("field `{field}` of `{schema}` lies outside of the report")]
    LayoutOverflow {
        schema: &'static str,
        field: &'static str,
    },

    /// The fields of the schema do not add up to the size of its report.
    #[error("the fields of `{schema}` span {bits} bits instead of {expected}")]
    LayoutMismatch {
        schema: &'static str,
        bits: usize,
        expected: usize,
    },

    /// Two fields of the schema share a field ID or a name.
    #[error("`{schema}` declares field `{field}` twice")]
    DuplicateField {
        schema: &'static str,
        field: &'static str,
    },
}

/// The kind of a HID++ message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub enum MessageKind {
    /// Sent by the host. Carries a software ID to match the response.
    Request,

    /// Sent by the device in reply to a request, echoing its software ID.
    Response,

    /// Sent by the device on its own, with a software ID of `0`.
    Event,

    /// A negative acknowledgement. The feature ID of error schemas is the
    /// error marker placed in the feature index byte.
    Error,
}

/// An ordered list of fields, optionally extending another field set.
#[derive(Debug)]
pub struct FieldSet {
    /// The name of the message format.
    pub name: &'static str,

    /// The field set this one extends.
    pub base: Option<&'static FieldSet>,

    /// The fields added on top of the base.
    pub fields: &'static [BitField],
}

impl FieldSet {
    pub const fn new(
        name: &'static str,
        base: Option<&'static FieldSet>,
        fields: &'static [BitField],
    ) -> Self {
        Self { name, base, fields }
    }

    /// Collects the fields of all bases followed by the own fields.
    pub fn all_fields(&self) -> Vec<&'static BitField> {
        let mut fields = self.base.map(FieldSet::all_fields).unwrap_or_default();
        fields.extend(self.fields.iter());
        fields
    }
}

/// A field placed at its bit offset inside the report.
#[derive(Clone, Copy, Debug)]
pub struct PlacedField {
    /// The field declaration.
    pub field: &'static BitField,

    /// The offset of the first bit, counted from the report ID.
    pub offset: usize,
}

impl PlacedField {
    fn end(&self) -> usize {
        self.offset + self.field.width as usize
    }
}

#[derive(Debug)]
struct Layout {
    fields: Vec<PlacedField>,
    by_name: HashMap<&'static str, usize>,
    bits: usize,
}

impl Layout {
    fn build(set: &FieldSet) -> Self {
        let mut declared = set.all_fields();
        declared.sort_by(|a, b| b.fid.cmp(&a.fid));

        let mut offset = 0;
        let mut fields = Vec::with_capacity(declared.len());
        let mut by_name = HashMap::with_capacity(declared.len());
        for field in declared {
            by_name.entry(field.name).or_insert(fields.len());
            fields.push(PlacedField { field, offset });
            offset += field.width as usize;
        }

        Self {
            fields,
            by_name,
            bits: offset,
        }
    }
}

/// Describes one concrete HID++ message: its fields, report size, kind and
/// the feature function or event it belongs to.
#[derive(Debug)]
pub struct Schema {
    /// The name of the message.
    pub name: &'static str,

    /// The fields of the message, including the inherited header.
    pub fields: &'static FieldSet,

    /// The report the message is sent in.
    pub report: ReportKind,

    /// The kind of the message.
    pub kind: MessageKind,

    /// The ID of the feature the message belongs to.
    pub feature_id: u16,

    /// The function index (requests and responses) or event index (events).
    pub index: u8,

    /// The feature versions the message is valid for.
    pub versions: &'static [u8],

    layout: OnceLock<Layout>,
}

impl Schema {
    pub const fn new(
        name: &'static str,
        fields: &'static FieldSet,
        report: ReportKind,
        kind: MessageKind,
        feature_id: u16,
        index: u8,
        versions: &'static [u8],
    ) -> Self {
        Self {
            name,
            fields,
            report,
            kind,
            feature_id,
            index,
            versions,
            layout: OnceLock::new(),
        }
    }

    fn layout(&self) -> &Layout {
        self.layout.get_or_init(|| Layout::build(self.fields))
    }

    /// All fields in wire order with their bit offsets.
    pub fn placed_fields(&self) -> &[PlacedField] {
        &self.layout().fields
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&PlacedField> {
        let layout = self.layout();
        layout.by_name.get(name).map(|&i| &layout.fields[i])
    }

    /// Whether the schema is valid for the given feature version.
    pub fn supports_version(&self, version: u8) -> bool {
        self.versions.contains(&version)
    }

    /// Verifies that the fields exactly fill the report and that no field is
    /// declared twice.
    pub fn verify(&self) -> Result<(), CodecError> {
        let layout = self.layout();

        for (i, placed) in layout.fields.iter().enumerate() {
            let duplicate = layout.fields[..i].iter().any(|other| {
                other.field.fid == placed.field.fid || other.field.name == placed.field.name
            });
            if duplicate {
                return Err(CodecError::DuplicateField {
                    schema: self.name,
                    field: placed.field.name,
                });
            }
        }

        if layout.bits != self.report.bits() {
            return Err(CodecError::LayoutMismatch {
                schema: self.name,
                bits: layout.bits,
                expected: self.report.bits(),
            });
        }

        Ok(())
    }

    /// Encodes a message from a list of named values.
    ///
    /// Fields that are not listed keep their default (or zero).
    pub fn encode(&'static self, values: &[(&str, u128)]) -> Result<Vec<u8>, CodecError> {
        let mut msg = Message::new(self);
        for (name, value) in values {
            msg.set(name, *value)?;
        }
        Ok(msg.as_bytes().to_vec())
    }

    /// Decodes a raw frame into a message of this schema.
    ///
    /// Bytes beyond the report size are ignored. Reserved fields are not
    /// validated.
    pub fn decode(&'static self, data: &[u8]) -> Result<Message, CodecError> {
        let size = self.report.size();
        if data.len() < size {
            return Err(CodecError::FrameTooShort {
                schema: self.name,
                expected: size,
                actual: data.len(),
            });
        }

        let mut buf = [0u8; LONG_REPORT_LENGTH];
        buf[..size].copy_from_slice(&data[..size]);
        Ok(Message { schema: self, data: buf })
    }

    /// Decodes a raw frame into a list of named values in wire order.
    pub fn decode_fields(
        &'static self,
        data: &[u8],
    ) -> Result<Vec<(&'static str, u128)>, CodecError> {
        self.decode(data).map(|msg| msg.fields())
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Schema {}

/// A HID++ report buffer interpreted through a [`Schema`].
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    schema: &'static Schema,
    data: [u8; LONG_REPORT_LENGTH],
}

impl Message {
    /// Creates a message with every field set to its default.
    ///
    /// The report ID follows the report size of the schema. Requests,
    /// responses and events get the function or event index of the schema,
    /// error messages get the error marker as feature index.
    pub fn new(schema: &'static Schema) -> Self {
        let mut data = [0u8; LONG_REPORT_LENGTH];
        let bits = schema.report.bits();

        for placed in schema.placed_fields() {
            if let Some(default) = placed.field.default {
                if placed.end() <= bits {
                    field::write_bits(&mut data, placed.offset, placed.field.width as usize, default);
                }
            }
        }

        data[0] = schema.report.id();
        match schema.kind {
            MessageKind::Error => data[2] = schema.feature_id as u8,
            _ => data[3] = nibble::combine(U4::from_lo(schema.index), U4::from_lo(0)),
        }

        Self { schema, data }
    }

    /// The schema the message is interpreted with.
    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    /// The raw report, sized according to the schema.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.schema.report.size()]
    }

    fn placed(&self, name: &str) -> Result<&'static PlacedField, CodecError> {
        let placed = self
            .schema
            .field(name)
            .ok_or_else(|| CodecError::UnknownField {
                schema: self.schema.name,
                field: name.to_string(),
            })?;

        if placed.end() > self.schema.report.bits() {
            return Err(CodecError::LayoutOverflow {
                schema: self.schema.name,
                field: placed.field.name,
            });
        }

        Ok(placed)
    }

    /// Reads a field by name.
    pub fn get(&self, name: &str) -> Result<u128, CodecError> {
        let placed = self.placed(name)?;
        Ok(field::read_bits(
            &self.data,
            placed.offset,
            placed.field.width as usize,
        ))
    }

    /// Reads a field by name and converts it into a typed value.
    pub fn get_as<T: FieldValue>(&self, name: &str) -> Result<T, CodecError> {
        self.get(name).map(T::from_raw)
    }

    /// Validates and writes a field by name.
    pub fn set(&mut self, name: &str, value: u128) -> Result<(), CodecError> {
        let placed = self.placed(name)?;
        placed.field.validate(value)?;
        field::write_bits(
            &mut self.data,
            placed.offset,
            placed.field.width as usize,
            value,
        );
        Ok(())
    }

    /// Reads the fixed header.
    pub fn header(&self) -> MessageHeader {
        let (function_index, software_id) = nibble::split(self.data[3]);
        MessageHeader {
            device_index: self.data[1],
            feature_index: self.data[2],
            function_index,
            software_id,
        }
    }

    /// Overwrites the fixed header.
    pub fn set_header(&mut self, header: &MessageHeader) {
        self.data[1] = header.device_index;
        self.data[2] = header.feature_index;
        self.data[3] = header.function_and_sw_id();
    }

    /// Overwrites the software ID in the header.
    pub fn set_software_id(&mut self, software_id: U4) {
        let (function_index, _) = nibble::split(self.data[3]);
        self.data[3] = nibble::combine(function_index, software_id);
    }

    /// Overwrites the feature index in the header.
    pub fn set_feature_index(&mut self, feature_index: u8) {
        self.data[2] = feature_index;
    }

    /// All fields in wire order together with their current values.
    pub fn fields(&self) -> Vec<(&'static str, u128)> {
        let bits = self.schema.report.bits();
        self.schema
            .placed_fields()
            .iter()
            .filter(|placed| placed.end() <= bits)
            .map(|placed| {
                (
                    placed.field.name,
                    field::read_bits(&self.data, placed.offset, placed.field.width as usize),
                )
            })
            .collect()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:02x?}]", self.schema.name, self.as_bytes())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.schema.name)?;
        for (i, (name, value)) in self.fields().into_iter().enumerate() {
            if i != 0 {
                write!(f, ",")?;
            }
            write!(f, " {name}: {value:#x}")?;
        }
        write!(f, " }}")
    }
}

/// A message type generated from a [`Schema`] with one member per field.
pub trait TypedMessage: Sized {
    /// The schema backing the message type.
    fn schema() -> &'static Schema;

    /// The fixed header of the message.
    fn header(&self) -> &MessageHeader;

    /// The fixed header of the message, mutably.
    fn header_mut(&mut self) -> &mut MessageHeader;

    /// Converts the typed message into its buffer form, validating every
    /// member.
    fn to_message(&self) -> Result<Message, CodecError>;

    /// Reads the typed members out of a message buffer.
    fn from_message(msg: &Message) -> Result<Self, CodecError>;

    /// Encodes the message into a raw report.
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.to_message().map(|msg| msg.as_bytes().to_vec())
    }

    /// Decodes a raw report into the typed message.
    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        Self::from_message(&Self::schema().decode(data)?)
    }
}

/// A request message that is answered with a known response type.
pub trait Request: TypedMessage {
    /// The response the device answers the request with.
    type Response: TypedMessage;
}

/// Generates a schema static and the typed message struct belonging to it.
///
/// ```ignore
/// hidpp_message! {
///     /// Reads a register of one of the sensors.
///     pub struct ReadSensorRegister = READ_SENSOR_REGISTER {
///         fields: READ_SENSOR_REGISTER_FORMAT,
///         report: Short,
///         kind: Request,
///         feature: FEATURE_ID,
///         index: 0,
///         versions: [0],
///     } {
///         sensor_id: u8,
///         reg_addr: u8,
///     }
/// }
/// ```
macro_rules! hidpp_message {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident = $schema:ident {
            fields: $fields:path,
            report: $report:ident,
            kind: $kind:ident,
            feature: $feature:expr,
            index: $index:expr,
            versions: [$($version:expr),* $(,)?] $(,)?
        } {
            $(
                $(#[$fmeta:meta])*
                $field:ident: $ty:ty
            ),* $(,)?
        }
    ) => {
        #[doc = concat!("The schema of [`", stringify!($name), "`].")]
        $vis static $schema: $crate::schema::Schema = $crate::schema::Schema::new(
            stringify!($name),
            &$fields,
            $crate::report::ReportKind::$report,
            $crate::schema::MessageKind::$kind,
            $feature,
            $index,
            &[$($version),*],
        );

        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
        #[cfg_attr(feature = "serialize", derive(serde::Serialize))]
        $vis struct $name {
            /// The fixed HID++ header.
            pub header: $crate::report::MessageHeader,
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl $name {
            /// Creates the message with the function or event index of its
            /// schema and a software ID of `0`.
            #[allow(clippy::too_many_arguments)]
            pub fn new(device_index: u8, feature_index: u8 $(, $field: $ty)*) -> Self {
                Self {
                    header: $crate::report::MessageHeader {
                        device_index,
                        feature_index,
                        function_index: $crate::nibble::U4::from_lo($index),
                        software_id: $crate::nibble::U4::from_lo(0),
                    },
                    $($field,)*
                }
            }
        }

        impl $crate::schema::TypedMessage for $name {
            fn schema() -> &'static $crate::schema::Schema {
                &$schema
            }

            fn header(&self) -> &$crate::report::MessageHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut $crate::report::MessageHeader {
                &mut self.header
            }

            fn to_message(
                &self,
            ) -> Result<$crate::schema::Message, $crate::schema::CodecError> {
                #[allow(unused_mut)]
                let mut msg = $crate::schema::Message::new(&$schema);
                msg.set_header(&self.header);
                $(
                    msg.set(
                        stringify!($field),
                        $crate::field::FieldValue::to_raw(&self.$field),
                    )?;
                )*
                Ok(msg)
            }

            fn from_message(
                msg: &$crate::schema::Message,
            ) -> Result<Self, $crate::schema::CodecError> {
                Ok(Self {
                    header: msg.header(),
                    $($field: msg.get_as(stringify!($field))?,)*
                })
            }
        }
    };
}

pub(crate) use hidpp_message;

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FIELDS: &[BitField] = &[
        BitField::new(fid::FIRST_PAYLOAD, "value", 16),
        BitField::new(fid::FIRST_PAYLOAD - 1, "padding", 8).with_default(0xaa),
    ];

    static SAMPLE_FORMAT: FieldSet = FieldSet::new("Sample", Some(&HIDPP_HEADER), SAMPLE_FIELDS);

    hidpp_message! {
        /// A short request used to exercise the codec.
        pub struct Sample = SAMPLE {
            fields: SAMPLE_FORMAT,
            report: Short,
            kind: Request,
            feature: 0x1234,
            index: 2,
            versions: [0, 1],
        } {
            value: u16,
        }
    }

    const BROKEN_FIELDS: &[BitField] = &[BitField::new(fid::FIRST_PAYLOAD, "value", 16)];

    static BROKEN_FORMAT: FieldSet = FieldSet::new("Broken", Some(&HIDPP_HEADER), BROKEN_FIELDS);

    static BROKEN: Schema = Schema::new(
        "Broken",
        &BROKEN_FORMAT,
        ReportKind::Short,
        MessageKind::Request,
        0x1234,
        0,
        &[0],
    );

    #[test]
    fn header_comes_first_in_wire_order() {
        let names = SAMPLE
            .placed_fields()
            .iter()
            .map(|placed| (placed.field.name, placed.offset))
            .collect::<Vec<_>>();

        assert_eq!(
            names,
            [
                ("report_id", 0),
                ("device_index", 8),
                ("feature_index", 16),
                ("function_index", 24),
                ("software_id", 28),
                ("value", 32),
                ("padding", 48),
            ]
        );
        assert!(SAMPLE.verify().is_ok());
    }

    #[test]
    fn new_message_carries_defaults() {
        let msg = Message::new(&SAMPLE);

        assert_eq!(msg.as_bytes(), [0x10, 0x00, 0x00, 0x20, 0x00, 0x00, 0xaa]);
    }

    #[test]
    fn typed_message_encodes_big_endian() {
        let mut sample = Sample::new(0x01, 0x05, 0x1234);
        sample.header.software_id = U4::from_lo(0x7);

        assert_eq!(
            sample.encode().unwrap(),
            [0x10, 0x01, 0x05, 0x27, 0x12, 0x34, 0xaa]
        );
        assert_eq!(Sample::decode(&sample.encode().unwrap()).unwrap(), sample);
    }

    #[test]
    fn encode_by_name() {
        let bytes = SAMPLE
            .encode(&[("device_index", 0xff), ("value", 0xbeef)])
            .unwrap();

        assert_eq!(bytes, [0x10, 0xff, 0x00, 0x20, 0xbe, 0xef, 0xaa]);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut msg = Message::new(&SAMPLE);

        assert_eq!(
            msg.set("nope", 1),
            Err(CodecError::UnknownField {
                schema: "Sample",
                field: "nope".to_string(),
            })
        );
    }

    #[test]
    fn decode_needs_full_report() {
        assert_eq!(
            SAMPLE.decode(&[0x10, 0x01, 0x05]),
            Err(CodecError::FrameTooShort {
                schema: "Sample",
                expected: 7,
                actual: 3,
            })
        );
    }

    #[test]
    fn decode_surfaces_reserved_bits() {
        let msg = SAMPLE
            .decode(&[0x10, 0x01, 0x05, 0x20, 0x00, 0x01, 0x55])
            .unwrap();

        assert_eq!(msg.get("padding"), Ok(0x55));
        assert_eq!(msg.get("value"), Ok(0x0001));
    }

    #[test]
    fn verify_reports_width_mismatch() {
        assert_eq!(
            BROKEN.verify(),
            Err(CodecError::LayoutMismatch {
                schema: "Broken",
                bits: 48,
                expected: 56,
            })
        );
    }
}
