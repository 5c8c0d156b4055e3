//! Implements the protocol-specific parts of HID++.

use std::fmt;

use crate::{
    nibble::{self, U4},
    report::MessageHeader,
    schema::TypedMessage,
};

pub mod v10;
pub mod v20;

/// Represents the protocol version a device supports.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub enum ProtocolVersion {
    /// The older HID++1.0 protocol. Mostly used for receivers.
    V10,

    /// All newer protocols starting from HID++2.0.
    ///
    /// The major and minor version were later redefined to hint at the host
    /// software a device targets.
    V20 {
        /// `2` targets SetPoint, `3` and `4` the software named in
        /// `target_sw`.
        protocol_num: u8,

        /// The targeted software when `protocol_num >= 3`, otherwise zero.
        target_sw: u8,
    },
}

/// The HID++ generation an error reply was sent with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub enum ErrorProtocol {
    V10,
    V20,
}

/// A negative acknowledgement sent by a device.
///
/// For HID++2.0 replies `sub_id` is the feature index and `address` the
/// function and software IDs of the failed request. For HID++1.0 replies they
/// are the sub ID and register address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct HidppError {
    pub protocol: ErrorProtocol,
    pub device_index: u8,
    pub sub_id: u8,
    pub address: u8,
    pub code: u8,
}

impl HidppError {
    /// Reads an error reply from a raw frame.
    ///
    /// Returns [`None`] if the frame is no error reply or too short.
    pub fn from_frame(data: &[u8]) -> Option<Self> {
        let header = MessageHeader::read(data)?;

        match header.feature_index {
            v20::ERROR_MARKER => {
                let msg = v20::ErrorMessage::decode(data).ok()?;
                Some(Self {
                    protocol: ErrorProtocol::V20,
                    device_index: msg.header.device_index,
                    sub_id: msg.failed_feature_index(),
                    address: nibble::combine(msg.failed_function_index, msg.failed_software_id),
                    code: msg.error_code,
                })
            },
            v10::ERROR_MARKER => {
                let msg = v10::ErrorMessage::decode(data).ok()?;
                Some(Self {
                    protocol: ErrorProtocol::V10,
                    device_index: msg.header.device_index,
                    sub_id: msg.sub_id(),
                    address: msg.address,
                    code: msg.error_code,
                })
            },
            _ => None,
        }
    }

    /// Whether the error answers a request with the given header.
    pub fn answers(&self, request: &MessageHeader) -> bool {
        self.device_index == request.device_index
            && self.sub_id == request.feature_index
            && self.address == request.function_and_sw_id()
    }

    /// The software ID of the failed request.
    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.address)
    }

    /// The HID++2.0 error code, if the reply is a known HID++2.0 one.
    pub fn v20_error(&self) -> Option<v20::ErrorType> {
        match self.protocol {
            ErrorProtocol::V20 => v20::ErrorType::try_from(self.code).ok(),
            ErrorProtocol::V10 => None,
        }
    }

    /// The HID++1.0 error code, if the reply is a known HID++1.0 one.
    pub fn v10_error(&self) -> Option<v10::ErrorType> {
        match self.protocol {
            ErrorProtocol::V10 => v10::ErrorType::try_from(self.code).ok(),
            ErrorProtocol::V20 => None,
        }
    }
}

impl fmt::Display for HidppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.protocol {
            ErrorProtocol::V20 => self.v20_error().map(|err| format!("{err:?}")),
            ErrorProtocol::V10 => self.v10_error().map(|err| format!("{err:?}")),
        };

        write!(
            f,
            "device {:#04x} answered sub ID {:#04x}, address {:#04x} with error {:#04x}",
            self.device_index, self.sub_id, self.address, self.code
        )?;
        if let Some(name) = name {
            write!(f, " ({name})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v20_error_matches_request() {
        let mut frame = [0u8; 20];
        frame[..6].copy_from_slice(&[0x11, 0x01, 0xff, 0x07, 0x13, 0x09]);
        let err = HidppError::from_frame(&frame).unwrap();

        let request = MessageHeader {
            device_index: 0x01,
            feature_index: 0x07,
            function_index: U4::from_lo(0x1),
            software_id: U4::from_lo(0x3),
        };

        assert!(err.answers(&request));
        assert_eq!(err.software_id(), U4::from_lo(0x3));
        assert_eq!(err.v20_error(), Some(v20::ErrorType::Unsupported));
        assert_eq!(err.v10_error(), None);
    }

    #[test]
    fn v10_error_is_short() {
        let err = HidppError::from_frame(&[0x10, 0xff, 0x8f, 0x83, 0xb5, 0x03, 0x00]).unwrap();

        assert_eq!(err.protocol, ErrorProtocol::V10);
        assert_eq!(err.sub_id, 0x83);
        assert_eq!(err.address, 0xb5);
        assert_eq!(err.v10_error(), Some(v10::ErrorType::InvalidValue));
    }

    #[test]
    fn regular_frames_are_no_errors() {
        assert_eq!(
            HidppError::from_frame(&[0x10, 0x01, 0x07, 0x93, 0x02, 0x0a, 0x00]),
            None
        );
    }
}
