//! HID++ report framing shared by the codec, the dispatcher and the channel.
//!
//! Every HID++ report starts with a report ID selecting its fixed length,
//! followed by the three header bytes every HID++2.0 message carries.

use hidreport::{Field, Report, ReportDescriptor, Usage, UsageId, UsagePage};

use crate::nibble::{self, U4};

/// hidapi defines this as the maximum EXPECTED size of report descriptors.
pub const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

pub const SHORT_REPORT_ID: u8 = 0x10;
const SHORT_REPORT_USAGE_PAGE: u16 = 0xff00;
const SHORT_REPORT_USAGE: u16 = 0x0001;
pub const SHORT_REPORT_LENGTH: usize = 7;

pub const LONG_REPORT_ID: u8 = 0x11;
const LONG_REPORT_USAGE_PAGE: u16 = 0xff00;
const LONG_REPORT_USAGE: u16 = 0x0002;
pub const LONG_REPORT_LENGTH: usize = 20;

/// Very long reports have a device-specific length and are only passed
/// through, never decoded.
pub const VERY_LONG_REPORT_ID: u8 = 0x12;

/// The length of the fixed header, including the report ID.
pub const HEADER_LENGTH: usize = 4;

/// The two fixed report sizes HID++ messages are exchanged with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub enum ReportKind {
    /// A 7 bytes report with the ID `0x10`.
    Short,

    /// A 20 bytes report with the ID `0x11`.
    Long,
}

impl ReportKind {
    /// The report ID prefixing reports of this kind.
    pub const fn id(self) -> u8 {
        match self {
            Self::Short => SHORT_REPORT_ID,
            Self::Long => LONG_REPORT_ID,
        }
    }

    /// The total length of reports of this kind, including the report ID.
    pub const fn size(self) -> usize {
        match self {
            Self::Short => SHORT_REPORT_LENGTH,
            Self::Long => LONG_REPORT_LENGTH,
        }
    }

    /// The total length of reports of this kind in bits.
    pub const fn bits(self) -> usize {
        self.size() * 8
    }

    /// Looks up the report kind belonging to a report ID.
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            SHORT_REPORT_ID => Some(Self::Short),
            LONG_REPORT_ID => Some(Self::Long),
            _ => None,
        }
    }

    /// Looks up the report kind of a raw frame by its total length.
    pub const fn from_len(len: usize) -> Option<Self> {
        match len {
            SHORT_REPORT_LENGTH => Some(Self::Short),
            LONG_REPORT_LENGTH => Some(Self::Long),
            _ => None,
        }
    }
}

/// Checks whether a raw frame starts with one of the HID++ report IDs.
///
/// Anything else is a plain HID report of another top-level collection
/// (mouse, keyboard, digitizer...).
pub fn is_hidpp_report(data: &[u8]) -> bool {
    matches!(
        data.first(),
        Some(&(SHORT_REPORT_ID | LONG_REPORT_ID | VERY_LONG_REPORT_ID))
    )
}

/// Returns the length a report with the given ID must have, if it is fixed.
pub fn expected_len(report_id: u8) -> Option<usize> {
    ReportKind::from_id(report_id).map(ReportKind::size)
}

/// Represents the header that every HID++2.0 message starts with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct MessageHeader {
    /// The index of the device involved in the communication.
    pub device_index: u8,

    /// The index of the feature the message belongs to.
    ///
    /// This is not the same as the feature ID, but the index returned from a
    /// feature lookup request.
    pub feature_index: u8,

    /// The index of the function (or event) involved in the communication.
    pub function_index: U4,

    /// The ID of the software communicating with the device. `0` marks an
    /// event.
    pub software_id: U4,
}

impl MessageHeader {
    /// Reads the header of a raw report, including its report ID byte.
    ///
    /// Returns [`None`] if the frame is too short to contain a header.
    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LENGTH {
            return None;
        }

        let (function_index, software_id) = nibble::split(data[3]);
        Some(Self {
            device_index: data[1],
            feature_index: data[2],
            function_index,
            software_id,
        })
    }

    /// The function and software IDs packed into a single byte.
    pub fn function_and_sw_id(&self) -> u8 {
        nibble::combine(self.function_index, self.software_id)
    }
}

/// Checks whether a HID report descriptor declares short or long HID++
/// reports.
///
/// Returns `(supports_short, supports_long)`.
pub fn supports_short_long_hidpp(
    raw_descriptor: &[u8],
) -> Result<(bool, bool), hidreport::ParserError> {
    let descriptor = ReportDescriptor::try_from(raw_descriptor)?;

    let declares = |report_id: u8, page: u16, usage: u16| {
        descriptor
            .find_input_report(&[report_id])
            .and_then(|report| report.fields().first())
            .and_then(|field| match field {
                Field::Array(arr) => Some(arr.usage_range()),
                _ => None,
            })
            .is_some_and(|range| {
                range
                    .lookup_usage(&Usage::from_page_and_id(
                        UsagePage::from(page),
                        UsageId::from(usage),
                    ))
                    .is_some()
            })
    };

    Ok((
        declares(SHORT_REPORT_ID, SHORT_REPORT_USAGE_PAGE, SHORT_REPORT_USAGE),
        declares(LONG_REPORT_ID, LONG_REPORT_USAGE_PAGE, LONG_REPORT_USAGE),
    ))
}
