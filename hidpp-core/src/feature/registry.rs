//! Maintains a registry of well-known HID++2.0 features, the dispatcher queue
//! their messages are routed to and, where implemented, their model.

use std::collections::HashMap;

use lazy_static::lazy_static;

use super::{FeatureError, FeatureModel, feature_set, mlx90393_multi_sensor, root};
use crate::dispatcher::QueueName;

/// Represents a known HID++2.0 device feature.
#[derive(Clone, Copy, Debug)]
pub struct KnownFeature {
    /// The name of the feature.
    /// This is usually a slightly modified version of the name found in
    /// Logitech's documentation.
    pub name: &'static str,

    /// The queue responses of the feature are routed to.
    pub queue: QueueName,

    /// The message model of the feature, if implemented.
    pub model: Option<&'static FeatureModel>,
}

static MODELS: [&FeatureModel; 3] = [&root::MODEL, &feature_set::MODEL, &mlx90393_multi_sensor::MODEL];

const NAMES: &[(u16, &str)] = &[
    (0x0002, "FeatureInfo"),
    (0x0003, "DeviceInformation"),
    (0x0004, "UnitId"),
    (0x0005, "DeviceTypeAndName"),
    (0x0007, "DeviceFriendlyName"),
    (0x0008, "KeepAlive"),
    (0x0020, "ConfigChange"),
    (0x0021, "UniqueRandomId"),
    (0x0080, "WirelessSignalStrength"),
    (0x00c2, "DfuControlSigned"),
    (0x00c3, "DfuControl"),
    (0x00d0, "Dfu"),
    (0x1000, "BatteryStatus"),
    (0x1004, "UnifiedBattery"),
    (0x1300, "LedControl"),
    (0x1800, "GenericTest"),
    (0x1802, "DeviceReset"),
    (0x1805, "OobState"),
    (0x1806, "ConfigDeviceProps"),
    (0x1814, "ChangeHost"),
    (0x1815, "HostsInfo"),
    (0x1b04, "ReprogControls5"),
    (0x1d4b, "WirelessDeviceStatus"),
    (0x1e00, "EnableHiddenFeatures"),
    (0x1e02, "ManageDeactivatableFeatures"),
    (0x1e22, "SpiDirectAccess"),
    (0x1eb0, "TdeAccessToNvm"),
    (0x1f20, "AdcMeasurement"),
    (0x2100, "VerticalScrolling"),
    (0x2110, "SmartShiftWheel"),
    (0x2121, "HiResWheel"),
    (0x2150, "Thumbwheel"),
    (0x2201, "AdjustableDpi"),
    (0x2202, "ExtendedAdjustableDpi"),
    (0x2250, "AnalysisMode"),
    (0x40a3, "FnInversionForMultiHostDevices"),
    (0x4220, "LockKeyState"),
    (0x4521, "DisableKeys"),
    (0x4522, "DisableKeysByUsage"),
    (0x4531, "MultiPlatform"),
    (0x4540, "KeyboardInternationalLayouts"),
    (0x6100, "TouchpadRawXy"),
    (0x6501, "Gestures2"),
    (0x8040, "BrightnessControl"),
    (0x8060, "AdjustableReportRate"),
    (0x8061, "ExtendedAdjustableReportRate"),
    (0x8071, "RgbEffects"),
    (0x8081, "PerKeyLighting2"),
    (0x8100, "OnboardProfiles"),
    (0x8110, "MouseButtonFilter"),
    (0x8111, "LatencyMonitoring"),
    (0x9001, "PmwSensor"),
    (0x9205, "Mlx903xx"),
    (0x9209, "Mlx90393MultiSensor"),
    (0x9215, "Ads1231"),
];

lazy_static! {
    static ref KNOWN_FEATURES: HashMap<u16, KnownFeature> = {
        let mut features = NAMES
            .iter()
            .map(|&(id, name)| {
                (id, KnownFeature {
                    name,
                    queue: QueueName::for_feature(id),
                    model: None,
                })
            })
            .collect::<HashMap<_, _>>();

        for model in MODELS {
            features.insert(model.feature_id, KnownFeature {
                name: model.name,
                queue: QueueName::for_feature(model.feature_id),
                model: Some(model),
            });
        }

        features
    };
}

/// Looks up a feature by its ID.
pub fn lookup(feature_id: u16) -> Option<KnownFeature> {
    KNOWN_FEATURES.get(&feature_id).copied()
}

/// Looks up the display name of a feature, if it is known.
pub fn name(feature_id: u16) -> Option<&'static str> {
    lookup(feature_id).map(|feat| feat.name)
}

/// Looks up the model of a feature.
pub fn model(feature_id: u16) -> Result<&'static FeatureModel, FeatureError> {
    lookup(feature_id)
        .and_then(|feat| feat.model)
        .ok_or(FeatureError::UnknownFeature(feature_id))
}

/// All feature models this crate implements.
pub fn models() -> impl Iterator<Item = &'static FeatureModel> {
    MODELS.iter().copied()
}
