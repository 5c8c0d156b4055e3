//! Implements the Root feature (ID `0x0000`) that every device supports by
//! default.

use std::sync::Arc;

use super::{CreatableFeature, Feature, FeatureModel, FeatureType, FunctionApi, VersionApi};
use crate::{
    channel::{ChannelError, UsbChannel},
    field::BitField,
    protocol::ProtocolVersion,
    schema::{FieldSet, HIDPP_HEADER, Message, TypedMessage, fid, hidpp_message},
};

/// The protocol ID of the feature.
pub const FEATURE_ID: u16 = 0x0000;

/// The Root feature always lives at this index.
pub const FEATURE_INDEX: u8 = 0x00;

/// The newest version of the feature this crate knows.
pub const LATEST_VERSION: u8 = 2;

const P: u8 = fid::FIRST_PAYLOAD;

const GET_FEATURE_FIELDS: &[BitField] = &[
    BitField::new(P, "feature_id", 16),
    BitField::new(P - 1, "padding", 8).with_default(0),
];

const GET_FEATURE_RESPONSE_V0_FIELDS: &[BitField] = &[
    BitField::new(P, "index", 8),
    BitField::new(P - 1, "obsolete", 1),
    BitField::new(P - 2, "hidden", 1),
    BitField::new(P - 3, "engineering", 1),
    BitField::new(P - 4, "reserved", 5).with_default(0),
    BitField::new(P - 5, "padding", 112).with_default(0),
];

const GET_FEATURE_RESPONSE_V1_FIELDS: &[BitField] = &[
    BitField::new(P, "index", 8),
    BitField::new(P - 1, "obsolete", 1),
    BitField::new(P - 2, "hidden", 1),
    BitField::new(P - 3, "engineering", 1),
    BitField::new(P - 4, "reserved", 5).with_default(0),
    BitField::new(P - 5, "feature_version", 8),
    BitField::new(P - 6, "padding", 104).with_default(0),
];

const GET_FEATURE_RESPONSE_V2_FIELDS: &[BitField] = &[
    BitField::new(P, "index", 8),
    BitField::new(P - 1, "obsolete", 1),
    BitField::new(P - 2, "hidden", 1),
    BitField::new(P - 3, "engineering", 1),
    BitField::new(P - 4, "manufacturing_deactivatable", 1),
    BitField::new(P - 5, "compliance_deactivatable", 1),
    BitField::new(P - 6, "reserved", 3).with_default(0),
    BitField::new(P - 7, "feature_version", 8),
    BitField::new(P - 8, "padding", 104).with_default(0),
];

const GET_PROTOCOL_VERSION_FIELDS: &[BitField] = &[
    BitField::new(P, "padding", 16).with_default(0),
    BitField::new(P - 1, "ping_data", 8),
];

const GET_PROTOCOL_VERSION_RESPONSE_FIELDS: &[BitField] = &[
    BitField::new(P, "protocol_num", 8),
    BitField::new(P - 1, "target_sw", 8),
    BitField::new(P - 2, "ping_data", 8),
    BitField::new(P - 3, "padding", 104).with_default(0),
];

static GET_FEATURE_FORMAT: FieldSet = FieldSet::new("GetFeatureFormat", Some(&HIDPP_HEADER), GET_FEATURE_FIELDS);
static GET_FEATURE_RESPONSE_V0_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureResponseV0Format",
    Some(&HIDPP_HEADER),
    GET_FEATURE_RESPONSE_V0_FIELDS,
);
static GET_FEATURE_RESPONSE_V1_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureResponseV1Format",
    Some(&HIDPP_HEADER),
    GET_FEATURE_RESPONSE_V1_FIELDS,
);
static GET_FEATURE_RESPONSE_V2_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureResponseV2Format",
    Some(&HIDPP_HEADER),
    GET_FEATURE_RESPONSE_V2_FIELDS,
);
static GET_PROTOCOL_VERSION_FORMAT: FieldSet = FieldSet::new(
    "GetProtocolVersionFormat",
    Some(&HIDPP_HEADER),
    GET_PROTOCOL_VERSION_FIELDS,
);
static GET_PROTOCOL_VERSION_RESPONSE_FORMAT: FieldSet = FieldSet::new(
    "GetProtocolVersionResponseFormat",
    Some(&HIDPP_HEADER),
    GET_PROTOCOL_VERSION_RESPONSE_FIELDS,
);

hidpp_message! {
    /// Looks up the index of a feature by its ID.
    pub struct GetFeature = GET_FEATURE {
        fields: GET_FEATURE_FORMAT,
        report: Short,
        kind: Request,
        feature: FEATURE_ID,
        index: 0,
        versions: [0, 1, 2],
    } {
        feature_id: u16,
    }
}

hidpp_message! {
    pub struct GetFeatureResponseV0 = GET_FEATURE_RESPONSE_V0 {
        fields: GET_FEATURE_RESPONSE_V0_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 0,
        versions: [0],
    } {
        index: u8,
        obsolete: bool,
        hidden: bool,
        engineering: bool,
    }
}

hidpp_message! {
    pub struct GetFeatureResponseV1 = GET_FEATURE_RESPONSE_V1 {
        fields: GET_FEATURE_RESPONSE_V1_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 0,
        versions: [1],
    } {
        index: u8,
        obsolete: bool,
        hidden: bool,
        engineering: bool,
        feature_version: u8,
    }
}

hidpp_message! {
    pub struct GetFeatureResponseV2 = GET_FEATURE_RESPONSE_V2 {
        fields: GET_FEATURE_RESPONSE_V2_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 0,
        versions: [2],
    } {
        index: u8,
        obsolete: bool,
        hidden: bool,
        engineering: bool,
        manufacturing_deactivatable: bool,
        compliance_deactivatable: bool,
        feature_version: u8,
    }
}

hidpp_message! {
    /// Pings the device and asks for its protocol version.
    pub struct GetProtocolVersion = GET_PROTOCOL_VERSION {
        fields: GET_PROTOCOL_VERSION_FORMAT,
        report: Short,
        kind: Request,
        feature: FEATURE_ID,
        index: 1,
        versions: [0, 1, 2],
    } {
        ping_data: u8,
    }
}

hidpp_message! {
    pub struct GetProtocolVersionResponse = GET_PROTOCOL_VERSION_RESPONSE {
        fields: GET_PROTOCOL_VERSION_RESPONSE_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 1,
        versions: [0, 1, 2],
    } {
        protocol_num: u8,
        target_sw: u8,
        ping_data: u8,
    }
}

impl crate::schema::Request for GetProtocolVersion {
    type Response = GetProtocolVersionResponse;
}

/// The versions of the Root feature.
pub static MODEL: FeatureModel = FeatureModel {
    feature_id: FEATURE_ID,
    name: "Root",
    versions: &[
        VersionApi {
            version: 0,
            functions: &[
                FunctionApi {
                    index: 0,
                    name: "getFeature",
                    request: &GET_FEATURE,
                    response: &GET_FEATURE_RESPONSE_V0,
                },
                FunctionApi {
                    index: 1,
                    name: "getProtocolVersion",
                    request: &GET_PROTOCOL_VERSION,
                    response: &GET_PROTOCOL_VERSION_RESPONSE,
                },
            ],
            events: &[],
        },
        VersionApi {
            version: 1,
            functions: &[
                FunctionApi {
                    index: 0,
                    name: "getFeature",
                    request: &GET_FEATURE,
                    response: &GET_FEATURE_RESPONSE_V1,
                },
                FunctionApi {
                    index: 1,
                    name: "getProtocolVersion",
                    request: &GET_PROTOCOL_VERSION,
                    response: &GET_PROTOCOL_VERSION_RESPONSE,
                },
            ],
            events: &[],
        },
        VersionApi {
            version: 2,
            functions: &[
                FunctionApi {
                    index: 0,
                    name: "getFeature",
                    request: &GET_FEATURE,
                    response: &GET_FEATURE_RESPONSE_V2,
                },
                FunctionApi {
                    index: 1,
                    name: "getProtocolVersion",
                    request: &GET_PROTOCOL_VERSION,
                    response: &GET_PROTOCOL_VERSION_RESPONSE,
                },
            ],
            events: &[],
        },
    ],
};

/// Represents information about a specific feature as returned by
/// [`RootFeature::get_feature`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct FeatureInformation {
    /// The index of the feature in the feature table. `0` means the feature
    /// is not supported.
    pub index: u8,

    /// The type of the feature.
    pub typ: FeatureType,

    /// The latest supported version of the feature. Always `0` for devices
    /// implementing Root v0.
    pub version: u8,
}

impl FeatureInformation {
    /// Reads the information out of a getFeature response of any version.
    pub fn from_response(msg: &Message) -> Self {
        let flag = |name: &str| msg.get_as::<bool>(name).unwrap_or(false);

        Self {
            index: msg.get_as("index").unwrap_or(0),
            typ: FeatureType {
                obsolete: flag("obsolete"),
                hidden: flag("hidden"),
                engineering: flag("engineering"),
                manufacturing_deactivatable: flag("manufacturing_deactivatable"),
                compliance_deactivatable: flag("compliance_deactivatable"),
            },
            version: msg.get_as("feature_version").unwrap_or(0),
        }
    }
}

/// Implements the `Root` / `0x0000` feature that every HID++2.0 device
/// supports by default.
#[derive(Clone)]
pub struct RootFeature {
    /// The underlying HID++ channel.
    chan: Arc<UsbChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The version of the feature responses are decoded with.
    version: u8,
}

impl CreatableFeature for RootFeature {
    const ID: u16 = FEATURE_ID;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<UsbChannel>, device_index: u8, _: u8) -> Self {
        Self {
            chan,
            device_index,
            version: LATEST_VERSION,
        }
    }
}

impl Feature for RootFeature {
    fn id(&self) -> u16 {
        FEATURE_ID
    }
}

impl RootFeature {
    /// Decodes responses with the layout of an older version of the feature.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Retrieves the index, type and version of a feature.
    ///
    /// If the feature is not supported by the device, [`None`] is returned.
    pub fn get_feature(&self, id: u16) -> Result<Option<FeatureInformation>, ChannelError> {
        let response_schema = MODEL.get_response_schema(self.version, 0)?;
        let request = GetFeature::new(self.device_index, FEATURE_INDEX, id);

        let response = self
            .chan
            .send_message(request.to_message()?, response_schema, None)?;

        let info = FeatureInformation::from_response(&response);
        Ok((info.index != 0).then_some(info))
    }

    /// Retrieves the protocol version of the device.
    pub fn get_protocol_version(&self) -> Result<ProtocolVersion, ChannelError> {
        let response = self.chan.send(GetProtocolVersion::new(
            self.device_index,
            FEATURE_INDEX,
            0x00,
        ))?;

        Ok(ProtocolVersion::V20 {
            protocol_num: response.protocol_num,
            target_sw: response.target_sw,
        })
    }

    /// Pings the device with an arbitrary data byte. The device will respond
    /// with the same data if communication succeeds.
    pub fn ping(&self, data: u8) -> Result<u8, ChannelError> {
        let response = self
            .chan
            .send(GetProtocolVersion::new(self.device_index, FEATURE_INDEX, data))?;

        Ok(response.ping_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nibble::U4;

    #[test]
    fn get_feature_request() {
        let mut request = GetFeature::new(0x01, FEATURE_INDEX, 0x9209);
        request.header.software_id = U4::from_lo(0x5);

        assert_eq!(
            request.encode().unwrap(),
            [0x10, 0x01, 0x00, 0x05, 0x92, 0x09, 0x00]
        );
    }

    #[test]
    fn responses_differ_per_version() {
        let mut frame = [0u8; 20];
        frame[..7].copy_from_slice(&[0x11, 0x01, 0x00, 0x05, 0x07, 0b0101_1000, 0x03]);

        let v0 = FeatureInformation::from_response(&GET_FEATURE_RESPONSE_V0.decode(&frame).unwrap());
        let v1 = FeatureInformation::from_response(&GET_FEATURE_RESPONSE_V1.decode(&frame).unwrap());
        let v2 = FeatureInformation::from_response(&GET_FEATURE_RESPONSE_V2.decode(&frame).unwrap());

        assert_eq!((v0.index, v0.version), (0x07, 0));
        assert!(v0.typ.hidden && !v0.typ.manufacturing_deactivatable);
        assert_eq!(v1.version, 0x03);
        assert!(!v1.typ.compliance_deactivatable);
        assert!(v2.typ.manufacturing_deactivatable && v2.typ.compliance_deactivatable);
        assert_eq!(v2.version, 0x03);
    }

    #[test]
    fn ping_is_last_byte() {
        let request = GetProtocolVersion::new(0xff, FEATURE_INDEX, 0xaa);

        assert_eq!(
            request.encode().unwrap(),
            [0x10, 0xff, 0x00, 0x10, 0x00, 0x00, 0xaa]
        );
    }
}
