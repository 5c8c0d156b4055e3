//! Bit-level field primitives HID++ messages are described with.
//!
//! A [`BitField`] only knows its identifier, width, default and checks. Its
//! position inside a report is assigned by the [`crate::schema::Schema`] it
//! is declared in.

use std::fmt;

use crate::{nibble::U4, schema::CodecError};

/// A predicate a field value has to satisfy before it is written.
///
/// Checks only run when encoding. Decoding surfaces whatever the device sent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Check {
    /// The value must lie inside `min..=max`.
    Range { min: u128, max: u128 },

    /// The value must fit into the given amount of bytes.
    ByteLength(usize),

    /// The value must be one of the listed values.
    OneOf(&'static [u128]),
}

impl Check {
    /// Checks a raw value against the predicate.
    pub fn accepts(&self, value: u128) -> bool {
        match *self {
            Self::Range { min, max } => (min..=max).contains(&value),
            Self::ByteLength(len) => len >= 16 || value >> (len * 8) == 0,
            Self::OneOf(values) => values.contains(&value),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range { min, max } => write!(f, "range {min:#x}..={max:#x}"),
            Self::ByteLength(len) => write!(f, "length of {len} bytes"),
            Self::OneOf(values) => write!(f, "one of {values:x?}"),
        }
    }
}

/// Describes why a value was refused by a field.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RangeViolation {
    /// The value needs more bits than the field is wide.
    Width(u16),

    /// A check of the field rejected the value.
    Check(Check),
}

impl fmt::Display for RangeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Width(width) => write!(f, "it does not fit into {width} bits"),
            Self::Check(check) => write!(f, "it violates the {check}"),
        }
    }
}

/// A named, fixed-width slot of a HID++ message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BitField {
    /// The field identifier. Fields are laid out by descending identifier, so
    /// the highest one occupies the first bits of the report.
    pub fid: u8,

    /// The name the field is accessed by.
    pub name: &'static str,

    /// The width of the field in bits. At most 128.
    pub width: u16,

    /// The value written when the field is not set explicitly. Padding and
    /// reserved fields always carry one.
    pub default: Option<u128>,

    /// The checks a value has to pass on encode.
    pub checks: &'static [Check],
}

impl BitField {
    /// Creates a field without default and checks.
    pub const fn new(fid: u8, name: &'static str, width: u16) -> Self {
        Self {
            fid,
            name,
            width,
            default: None,
            checks: &[],
        }
    }

    /// Sets the value written when the field is left alone.
    pub const fn with_default(mut self, default: u128) -> Self {
        self.default = Some(default);
        self
    }

    /// Sets the checks a value has to pass on encode.
    pub const fn with_checks(mut self, checks: &'static [Check]) -> Self {
        self.checks = checks;
        self
    }

    /// Whether the field is padding or reserved, i.e. carries a default.
    pub const fn is_reserved(&self) -> bool {
        self.default.is_some()
    }

    /// The largest value the field can hold.
    pub const fn max_value(&self) -> u128 {
        if self.width >= 128 {
            u128::MAX
        } else {
            (1u128 << self.width) - 1
        }
    }

    /// Validates a value against the field width and every check.
    pub fn validate(&self, value: u128) -> Result<(), CodecError> {
        if value > self.max_value() {
            return Err(CodecError::FieldRange {
                field: self.name,
                value,
                violation: RangeViolation::Width(self.width),
            });
        }

        if let Some(check) = self.checks.iter().find(|check| !check.accepts(value)) {
            return Err(CodecError::FieldRange {
                field: self.name,
                value,
                violation: RangeViolation::Check(*check),
            });
        }

        Ok(())
    }
}

/// Writes `width` bits of `value` into `buf`, starting `offset` bits after the
/// most significant bit of the first byte.
pub(crate) fn write_bits(buf: &mut [u8], offset: usize, width: usize, value: u128) {
    for i in 0..width {
        let bit = (value >> (width - 1 - i)) & 1;
        let pos = offset + i;
        let mask = 0x80u8 >> (pos % 8);

        if bit == 1 {
            buf[pos / 8] |= mask;
        } else {
            buf[pos / 8] &= !mask;
        }
    }
}

/// Reads `width` bits from `buf`, starting `offset` bits after the most
/// significant bit of the first byte.
pub(crate) fn read_bits(buf: &[u8], offset: usize, width: usize) -> u128 {
    (0..width).fold(0u128, |acc, i| {
        let pos = offset + i;
        let bit = (buf[pos / 8] >> (7 - pos % 8)) & 1;
        (acc << 1) | bit as u128
    })
}

/// Converts typed message members from and to the raw value stored in a
/// field.
///
/// Multi-byte values are big-endian on the wire, which falls out of
/// [`write_bits`] writing the most significant bit first.
pub trait FieldValue: Sized {
    /// Converts the value into its raw field representation.
    fn to_raw(&self) -> u128;

    /// Converts a raw field value back. Bits beyond the type are dropped.
    fn from_raw(raw: u128) -> Self;
}

macro_rules! impl_field_value_int {
    ($($ty:ty),*) => {
        $(
            impl FieldValue for $ty {
                fn to_raw(&self) -> u128 {
                    *self as u128
                }

                fn from_raw(raw: u128) -> Self {
                    raw as $ty
                }
            }
        )*
    };
}

impl_field_value_int!(u8, u16, u32, u64, u128);

impl FieldValue for bool {
    fn to_raw(&self) -> u128 {
        *self as u128
    }

    fn from_raw(raw: u128) -> Self {
        raw != 0
    }
}

impl FieldValue for U4 {
    fn to_raw(&self) -> u128 {
        self.to_lo() as u128
    }

    fn from_raw(raw: u128) -> Self {
        U4::from_lo(raw as u8)
    }
}

impl<const N: usize> FieldValue for [u8; N] {
    fn to_raw(&self) -> u128 {
        self.iter()
            .fold(0u128, |acc, byte| acc.checked_shl(8).unwrap_or(0) | *byte as u128)
    }

    fn from_raw(raw: u128) -> Self {
        let mut bytes = [0u8; N];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let shift = 8 * (N - 1 - i) as u32;
            *byte = raw.checked_shr(shift).unwrap_or(0) as u8;
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_written_msb_first() {
        let mut buf = [0u8; 3];
        write_bits(&mut buf, 4, 12, 0xabc);

        assert_eq!(buf, [0x0a, 0xbc, 0x00]);
        assert_eq!(read_bits(&buf, 4, 12), 0xabc);
        assert_eq!(read_bits(&buf, 0, 4), 0);
    }

    #[test]
    fn write_clears_previous_bits() {
        let mut buf = [0xffu8; 2];
        write_bits(&mut buf, 3, 6, 0);

        assert_eq!(buf, [0xe0, 0x7f]);
    }

    #[test]
    fn width_is_enforced() {
        let field = BitField::new(0xfa, "sensor_id", 8);

        assert!(field.validate(0xff).is_ok());
        assert_eq!(
            field.validate(0x100),
            Err(CodecError::FieldRange {
                field: "sensor_id",
                value: 0x100,
                violation: RangeViolation::Width(8),
            })
        );
    }

    #[test]
    fn checks_run_after_width() {
        const CHECKS: &[Check] = &[Check::Range { min: 1, max: 3 }];
        let field = BitField::new(0xfa, "command", 4).with_checks(CHECKS);

        assert!(field.validate(2).is_ok());
        assert!(matches!(
            field.validate(7),
            Err(CodecError::FieldRange {
                violation: RangeViolation::Check(Check::Range { .. }),
                ..
            })
        ));
    }

    #[test]
    fn full_width_field_accepts_everything() {
        let field = BitField::new(0xf9, "padding", 128).with_default(0);

        assert_eq!(field.max_value(), u128::MAX);
        assert!(field.validate(u128::MAX).is_ok());
        assert!(field.is_reserved());
    }

    #[test]
    fn byte_arrays_are_big_endian() {
        assert_eq!([0x12u8, 0x34].to_raw(), 0x1234);
        assert_eq!(<[u8; 4]>::from_raw(0x0102_0304), [1, 2, 3, 4]);
    }
}
