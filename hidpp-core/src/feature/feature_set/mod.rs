//! Implements the FeatureSet feature (ID `0x0001`) that allows enumerating all
//! the features supported by a device.

use std::sync::Arc;

use crate::{
    channel::{ChannelError, UsbChannel},
    feature::{CreatableFeature, Feature, FeatureModel, FeatureType, FunctionApi, VersionApi},
    field::BitField,
    schema::{FieldSet, HIDPP_HEADER, Message, TypedMessage, fid, hidpp_message},
};

/// The protocol ID of the feature.
pub const FEATURE_ID: u16 = 0x0001;

/// The newest version of the feature this crate knows.
pub const LATEST_VERSION: u8 = 2;

const P: u8 = fid::FIRST_PAYLOAD;

const GET_COUNT_FIELDS: &[BitField] = &[BitField::new(P, "padding", 24).with_default(0)];

const GET_COUNT_RESPONSE_FIELDS: &[BitField] = &[
    BitField::new(P, "count", 8),
    BitField::new(P - 1, "padding", 120).with_default(0),
];

const GET_FEATURE_ID_FIELDS: &[BitField] = &[
    BitField::new(P, "index", 8),
    BitField::new(P - 1, "padding", 16).with_default(0),
];

const GET_FEATURE_ID_RESPONSE_V0_FIELDS: &[BitField] = &[
    BitField::new(P, "feature_id", 16),
    BitField::new(P - 1, "obsolete", 1),
    BitField::new(P - 2, "hidden", 1),
    BitField::new(P - 3, "engineering", 1),
    BitField::new(P - 4, "reserved", 5).with_default(0),
    BitField::new(P - 5, "padding", 104).with_default(0),
];

const GET_FEATURE_ID_RESPONSE_V1_FIELDS: &[BitField] = &[
    BitField::new(P, "feature_id", 16),
    BitField::new(P - 1, "obsolete", 1),
    BitField::new(P - 2, "hidden", 1),
    BitField::new(P - 3, "engineering", 1),
    BitField::new(P - 4, "reserved", 5).with_default(0),
    BitField::new(P - 5, "feature_version", 8),
    BitField::new(P - 6, "padding", 96).with_default(0),
];

const GET_FEATURE_ID_RESPONSE_V2_FIELDS: &[BitField] = &[
    BitField::new(P, "feature_id", 16),
    BitField::new(P - 1, "obsolete", 1),
    BitField::new(P - 2, "hidden", 1),
    BitField::new(P - 3, "engineering", 1),
    BitField::new(P - 4, "manufacturing_deactivatable", 1),
    BitField::new(P - 5, "compliance_deactivatable", 1),
    BitField::new(P - 6, "reserved", 3).with_default(0),
    BitField::new(P - 7, "feature_version", 8),
    BitField::new(P - 8, "padding", 96).with_default(0),
];

static GET_COUNT_FORMAT: FieldSet = FieldSet::new("GetCountFormat", Some(&HIDPP_HEADER), GET_COUNT_FIELDS);
static GET_COUNT_RESPONSE_FORMAT: FieldSet = FieldSet::new(
    "GetCountResponseFormat",
    Some(&HIDPP_HEADER),
    GET_COUNT_RESPONSE_FIELDS,
);
static GET_FEATURE_ID_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureIdFormat",
    Some(&HIDPP_HEADER),
    GET_FEATURE_ID_FIELDS,
);
static GET_FEATURE_ID_RESPONSE_V0_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureIdResponseV0Format",
    Some(&HIDPP_HEADER),
    GET_FEATURE_ID_RESPONSE_V0_FIELDS,
);
static GET_FEATURE_ID_RESPONSE_V1_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureIdResponseV1Format",
    Some(&HIDPP_HEADER),
    GET_FEATURE_ID_RESPONSE_V1_FIELDS,
);
static GET_FEATURE_ID_RESPONSE_V2_FORMAT: FieldSet = FieldSet::new(
    "GetFeatureIdResponseV2Format",
    Some(&HIDPP_HEADER),
    GET_FEATURE_ID_RESPONSE_V2_FIELDS,
);

hidpp_message! {
    /// Asks for the amount of features, not counting Root.
    pub struct GetCount = GET_COUNT {
        fields: GET_COUNT_FORMAT,
        report: Short,
        kind: Request,
        feature: FEATURE_ID,
        index: 0,
        versions: [0, 1, 2],
    } {}
}

hidpp_message! {
    pub struct GetCountResponse = GET_COUNT_RESPONSE {
        fields: GET_COUNT_RESPONSE_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 0,
        versions: [0, 1, 2],
    } {
        count: u8,
    }
}

impl crate::schema::Request for GetCount {
    type Response = GetCountResponse;
}

hidpp_message! {
    /// Asks for the ID of the feature at an index of the feature table.
    pub struct GetFeatureId = GET_FEATURE_ID {
        fields: GET_FEATURE_ID_FORMAT,
        report: Short,
        kind: Request,
        feature: FEATURE_ID,
        index: 1,
        versions: [0, 1, 2],
    } {
        index: u8,
    }
}

hidpp_message! {
    pub struct GetFeatureIdResponseV0 = GET_FEATURE_ID_RESPONSE_V0 {
        fields: GET_FEATURE_ID_RESPONSE_V0_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 1,
        versions: [0],
    } {
        feature_id: u16,
        obsolete: bool,
        hidden: bool,
        engineering: bool,
    }
}

hidpp_message! {
    pub struct GetFeatureIdResponseV1 = GET_FEATURE_ID_RESPONSE_V1 {
        fields: GET_FEATURE_ID_RESPONSE_V1_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 1,
        versions: [1],
    } {
        feature_id: u16,
        obsolete: bool,
        hidden: bool,
        engineering: bool,
        feature_version: u8,
    }
}

hidpp_message! {
    pub struct GetFeatureIdResponseV2 = GET_FEATURE_ID_RESPONSE_V2 {
        fields: GET_FEATURE_ID_RESPONSE_V2_FORMAT,
        report: Long,
        kind: Response,
        feature: FEATURE_ID,
        index: 1,
        versions: [2],
    } {
        feature_id: u16,
        obsolete: bool,
        hidden: bool,
        engineering: bool,
        manufacturing_deactivatable: bool,
        compliance_deactivatable: bool,
        feature_version: u8,
    }
}

/// The versions of the FeatureSet feature.
pub static MODEL: FeatureModel = FeatureModel {
    feature_id: FEATURE_ID,
    name: "FeatureSet",
    versions: &[
        VersionApi {
            version: 0,
            functions: &[
                FunctionApi {
                    index: 0,
                    name: "getCount",
                    request: &GET_COUNT,
                    response: &GET_COUNT_RESPONSE,
                },
                FunctionApi {
                    index: 1,
                    name: "getFeatureId",
                    request: &GET_FEATURE_ID,
                    response: &GET_FEATURE_ID_RESPONSE_V0,
                },
            ],
            events: &[],
        },
        VersionApi {
            version: 1,
            functions: &[
                FunctionApi {
                    index: 0,
                    name: "getCount",
                    request: &GET_COUNT,
                    response: &GET_COUNT_RESPONSE,
                },
                FunctionApi {
                    index: 1,
                    name: "getFeatureId",
                    request: &GET_FEATURE_ID,
                    response: &GET_FEATURE_ID_RESPONSE_V1,
                },
            ],
            events: &[],
        },
        VersionApi {
            version: 2,
            functions: &[
                FunctionApi {
                    index: 0,
                    name: "getCount",
                    request: &GET_COUNT,
                    response: &GET_COUNT_RESPONSE,
                },
                FunctionApi {
                    index: 1,
                    name: "getFeatureId",
                    request: &GET_FEATURE_ID,
                    response: &GET_FEATURE_ID_RESPONSE_V2,
                },
            ],
            events: &[],
        },
    ],
};

/// Represents information about a specific feature as returned by
/// [`FeatureSetFeature::get_feature`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
#[non_exhaustive]
pub struct FeatureInformation {
    /// The protocol ID of the feature.
    pub id: u16,

    /// The type of the feature.
    pub typ: FeatureType,

    /// The latest supported version of the feature.
    ///
    /// This field was added in feature version 1 and will be `0` for all older
    /// versions.
    pub version: u8,
}

impl FeatureInformation {
    /// Reads the information out of a getFeatureId response of any version.
    pub fn from_response(msg: &Message) -> Self {
        let flag = |name: &str| msg.get_as::<bool>(name).unwrap_or(false);

        Self {
            id: msg.get_as("feature_id").unwrap_or(0),
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

/// Implements the `FeatureSet` / `0x0001` feature.
///
/// This feature is primarily used to collect all features supported by the
/// device. To achieve this, call [`Self::count`] to retrieve the amount of
/// supported features (excluding the root feature). Then call
/// [`Self::get_feature`] for every `i in 1..=count` (1-based, as accessing the
/// root feature is not allowed).
#[derive(Clone)]
pub struct FeatureSetFeature {
    /// The underlying HID++ channel.
    chan: Arc<UsbChannel>,

    /// The index of the device to implement the feature for.
    device_index: u8,

    /// The index of the feature in the feature table.
    feature_index: u8,

    /// The version of the feature responses are decoded with.
    version: u8,
}

impl CreatableFeature for FeatureSetFeature {
    const ID: u16 = FEATURE_ID;
    const STARTING_VERSION: u8 = 0;

    fn new(chan: Arc<UsbChannel>, device_index: u8, feature_index: u8) -> Self {
        Self {
            chan,
            device_index,
            feature_index,
            version: LATEST_VERSION,
        }
    }
}

impl Feature for FeatureSetFeature {
    fn id(&self) -> u16 {
        FEATURE_ID
    }
}

impl FeatureSetFeature {
    /// Decodes responses with the layout of the given version of the feature.
    ///
    /// Versions newer than the ones this crate knows fall back to the newest
    /// known layout.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = MODEL.best_version(version).unwrap_or(0);
        self
    }

    /// Retrieves the amount of features supported by the device, not including
    /// the root feature.
    pub fn count(&self) -> Result<u8, ChannelError> {
        let response = self
            .chan
            .send(GetCount::new(self.device_index, self.feature_index))?;

        Ok(response.count)
    }

    /// Retrieves the information about a specific feature based on its index in
    /// the feature table.
    ///
    /// Feature index `0` for the root feature is not allowed.
    pub fn get_feature(&self, index: u8) -> Result<FeatureInformation, ChannelError> {
        if index == 0 {
            return Err(ChannelError::WrongParameter(
                "the Root feature cannot be looked up by index".to_string(),
            ));
        }

        let response_schema = MODEL.get_response_schema(self.version, 1)?;
        let request = GetFeatureId::new(self.device_index, self.feature_index, index);

        let response = self
            .chan
            .send_message(request.to_message()?, response_schema, None)?;

        Ok(FeatureInformation::from_response(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_feature_id_response_v1() {
        let mut frame = [0u8; 20];
        frame[..8].copy_from_slice(&[0x11, 0x01, 0x01, 0x12, 0x92, 0x09, 0b0110_0000, 0x00]);

        let msg = GET_FEATURE_ID_RESPONSE_V1.decode(&frame).unwrap();
        let info = FeatureInformation::from_response(&msg);

        assert_eq!(info.id, 0x9209);
        assert!(info.typ.hidden && info.typ.engineering && !info.typ.obsolete);
        assert_eq!(info.version, 0);
    }

    #[test]
    fn get_count_is_all_padding() {
        let request = GetCount::new(0x01, 0x01);

        assert_eq!(
            request.encode().unwrap(),
            [0x10, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00]
        );
    }
}
