//! Implements functionality specific to HID++2.0.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    field::BitField,
    nibble::U4,
    schema::{FieldSet, HIDPP_HEADER, fid, hidpp_message},
};

/// The feature index marking a HID++2.0 error reply.
pub const ERROR_MARKER: u8 = 0xff;

/// The error codes of a HID++2.0 error reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    NoError = 0x00,

    /// An error without a more specific code.
    Unknown = 0x01,

    /// An argument of the request is invalid.
    InvalidArgument = 0x02,

    /// An argument of the request is out of range.
    OutOfRange = 0x03,

    /// The hardware failed.
    HwError = 0x04,

    LogitechInternal = 0x05,

    /// The request addressed a feature index the device does not have.
    InvalidFeatureIndex = 0x06,

    /// The request addressed a function the feature does not have.
    InvalidFunctionId = 0x07,

    /// The device is busy and cannot answer right now.
    Busy = 0x08,

    /// The request is not supported by the device.
    Unsupported = 0x09,
}

const ERROR_FIELDS: &[BitField] = &[
    BitField::new(fid::FIRST_PAYLOAD, "failed_function_index", 4),
    BitField::new(fid::FIRST_PAYLOAD - 1, "failed_software_id", 4),
    BitField::new(fid::FIRST_PAYLOAD - 2, "error_code", 8),
    BitField::new(fid::FIRST_PAYLOAD - 3, "padding", 112).with_default(0),
];

static ERROR_FORMAT: FieldSet = FieldSet::new("HidppError20Format", Some(&HIDPP_HEADER), ERROR_FIELDS);

hidpp_message! {
    /// A HID++2.0 error reply:
    /// `11 <device> FF <feature index> <function|sw ID> <error> 00...`.
    ///
    /// The feature index of the failed request sits where regular messages
    /// keep the function and software IDs, see [`Self::failed_feature_index`].
    pub struct ErrorMessage = ERROR {
        fields: ERROR_FORMAT,
        report: Long,
        kind: Error,
        feature: ERROR_MARKER as u16,
        index: 0,
        versions: [],
    } {
        /// The function index of the failed request.
        failed_function_index: U4,
        /// The software ID of the failed request.
        failed_software_id: U4,
        /// The raw error code, see [`ErrorType`].
        error_code: u8,
    }
}

impl ErrorMessage {
    /// The feature index of the failed request.
    pub fn failed_feature_index(&self) -> u8 {
        self.header.function_and_sw_id()
    }

    /// The error code, if it is a known one.
    pub fn error(&self) -> Option<ErrorType> {
        ErrorType::try_from(self.error_code).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypedMessage;

    #[test]
    fn error_reply_is_decoded() {
        let mut frame = [0u8; 20];
        frame[..6].copy_from_slice(&[0x11, 0x01, 0xff, 0x07, 0x13, 0x02]);

        let msg = ErrorMessage::decode(&frame).unwrap();

        assert_eq!(msg.failed_feature_index(), 0x07);
        assert_eq!(msg.failed_function_index, U4::from_lo(0x1));
        assert_eq!(msg.failed_software_id, U4::from_lo(0x3));
        assert_eq!(msg.error(), Some(ErrorType::InvalidArgument));
        assert!(ERROR.verify().is_ok());
    }

    #[test]
    fn unknown_error_codes_stay_raw() {
        let mut frame = [0u8; 20];
        frame[..6].copy_from_slice(&[0x11, 0x01, 0xff, 0x07, 0x13, 0x42]);

        let msg = ErrorMessage::decode(&frame).unwrap();

        assert_eq!(msg.error_code, 0x42);
        assert_eq!(msg.error(), None);
    }
}
