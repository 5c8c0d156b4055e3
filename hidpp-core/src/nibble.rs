//! A very simple u4/nibble implementation.
//!
//! HID++2.0 packs the function index and the software ID into the two halves
//! of the third header byte, so both are represented as [`U4`].

use std::fmt;

/// Represents an unsigned 4-bit value (nibble) encoded as a byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct U4(u8);

impl U4 {
    /// Constructs a nibble from the 4 low/rightmost bits of a byte.
    pub const fn from_lo(raw: u8) -> Self {
        Self(raw & 0x0f)
    }

    /// Constructs a nibble from the 4 high/leftmost bits of a byte.
    pub const fn from_hi(raw: u8) -> Self {
        Self(raw >> 4)
    }

    /// Constructs a byte with the nibble set as the 4 low/rightmost bits.
    pub const fn to_lo(self) -> u8 {
        self.0
    }

    /// Constructs a byte with the nibble set as the 4 high/leftmost bits.
    pub const fn to_hi(self) -> u8 {
        self.0 << 4
    }
}

impl TryFrom<u8> for U4 {
    type Error = u8;

    /// Fails with the raw value if it does not fit into 4 bits.
    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        if raw > 0x0f { Err(raw) } else { Ok(Self(raw)) }
    }
}

impl From<U4> for u8 {
    fn from(value: U4) -> Self {
        value.0
    }
}

impl fmt::Display for U4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Combines two nibbles to a byte, with `a` being set to the 4 leftmost and
/// `b` being set to the 4 rightmost bits.
pub const fn combine(a: U4, b: U4) -> u8 {
    a.to_hi() | b.to_lo()
}

/// Splits a byte into its high and low nibbles.
pub const fn split(raw: u8) -> (U4, U4) {
    (U4::from_hi(raw), U4::from_lo(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_puts_function_in_high_nibble() {
        assert_eq!(combine(U4::from_lo(0x9), U4::from_lo(0x3)), 0x93);
        assert_eq!(split(0x93), (U4::from_lo(0x9), U4::from_lo(0x3)));
    }

    #[test]
    fn try_from_rejects_wide_values() {
        assert_eq!(U4::try_from(0x0f), Ok(U4::from_lo(0x0f)));
        assert_eq!(U4::try_from(0x10), Err(0x10));
    }
}
