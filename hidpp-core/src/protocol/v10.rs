//! HID++1.0 framing used by receivers and by the error replies of devices
//! that do not speak HID++2.0.
//!
//! HID++1.0 has no feature index. The byte after the device index is a sub
//! ID, followed by a register address.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    field::BitField,
    schema::{FieldSet, HIDPP_HEADER, fid, hidpp_message},
};

/// The sub ID marking a HID++1.0 error reply.
pub const ERROR_MARKER: u8 = 0x8f;

/// Sub IDs defined for every HID++1.0 device.
///
/// Receivers define many more sub IDs specific to their functionality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum MessageType {
    /// Sets a 3 bytes register value.
    SetRegister = 0x80,

    /// Reads a 3 bytes register value.
    GetRegister = 0x81,

    /// Sets a 16 bytes register value.
    SetLongRegister = 0x82,

    /// Reads a 16 bytes register value.
    GetLongRegister = 0x83,

    /// A negative acknowledgement. The error code can be mapped using
    /// [`ErrorType::try_from`].
    Error = ERROR_MARKER,
}

impl MessageType {
    /// Whether a sub ID answers a register access, i.e. is a receiver
    /// response rather than a notification.
    pub fn is_register_access(sub_id: u8) -> bool {
        (Self::SetRegister as u8..=Self::GetLongRegister as u8).contains(&sub_id)
    }
}

/// The error codes of a HID++1.0 error reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    /// No error.
    Success = 0x00,

    /// The sub ID of the request is invalid.
    InvalidSubId = 0x01,

    /// The register address of the request is invalid.
    InvalidAddress = 0x02,

    /// The value of the request is invalid.
    InvalidValue = 0x03,

    /// The receiver failed to connect.
    ConnectFail = 0x04,

    /// Too many devices are connected to the receiver.
    TooManyDevices = 0x05,

    /// Something already exists.
    AlreadyExists = 0x06,

    /// The receiver is still busy with another downstream message.
    Busy = 0x07,

    /// No device is paired at the given device index.
    UnknownDevice = 0x08,

    /// The device is in disconnected mode and cannot take requests until the
    /// user interacts with it.
    ResourceError = 0x09,

    /// The request is not available in the current context.
    RequestUnavailable = 0x0a,

    /// A request parameter has an unsupported value.
    InvalidParamValue = 0x0b,

    /// The PIN code was wrong.
    WrongPinCode = 0x0c,
}

const ERROR_FIELDS: &[BitField] = &[
    BitField::new(fid::FIRST_PAYLOAD, "address", 8),
    BitField::new(fid::FIRST_PAYLOAD - 1, "error_code", 8),
    BitField::new(fid::FIRST_PAYLOAD - 2, "padding", 8).with_default(0),
];

static ERROR_FORMAT: FieldSet = FieldSet::new("HidppError10Format", Some(&HIDPP_HEADER), ERROR_FIELDS);

hidpp_message! {
    /// A HID++1.0 error reply: `10 <device> 8F <sub ID> <address> <error> 00`.
    ///
    /// The sub ID of the failed request sits where HID++2.0 keeps the
    /// function and software IDs, see [`Self::sub_id`].
    pub struct ErrorMessage = ERROR {
        fields: ERROR_FORMAT,
        report: Short,
        kind: Error,
        feature: ERROR_MARKER as u16,
        index: 0,
        versions: [],
    } {
        /// The register address of the failed request.
        address: u8,
        /// The raw error code, see [`ErrorType`].
        error_code: u8,
    }
}

impl ErrorMessage {
    /// The sub ID of the failed request.
    pub fn sub_id(&self) -> u8 {
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
        let msg = ErrorMessage::decode(&[0x10, 0x01, 0x8f, 0x81, 0xf1, 0x02, 0x00]).unwrap();

        assert_eq!(msg.header.device_index, 0x01);
        assert_eq!(msg.header.feature_index, ERROR_MARKER);
        assert_eq!(msg.sub_id(), 0x81);
        assert_eq!(msg.address, 0xf1);
        assert_eq!(msg.error(), Some(ErrorType::InvalidAddress));
        assert!(ERROR.verify().is_ok());
    }

    #[test]
    fn register_access_sub_ids() {
        assert!(MessageType::is_register_access(0x80));
        assert!(MessageType::is_register_access(0x83));
        assert!(!MessageType::is_register_access(0x41));
        assert!(!MessageType::is_register_access(ERROR_MARKER));
    }
}
