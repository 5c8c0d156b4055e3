//! HID++2.0 feature models and typed feature implementations.
//!
//! Every feature is described by a [`FeatureModel`]: a table keyed by feature
//! version listing the request and response schema of each function and the
//! schema of each event. [`FeatureModel::create`] selects the table matching
//! the version a device advertises.

use std::{any::Any, sync::Arc};

use thiserror::Error;

use crate::{channel::UsbChannel, schema::Schema};

pub mod feature_set;
pub mod mlx90393_multi_sensor;
pub mod registry;
pub mod root;

/// Represents a concrete implementation of a HID++2.0 device feature.
pub trait Feature: Any + Send + Sync {
    /// The protocol ID of the feature.
    fn id(&self) -> u16;
}

/// Represents a [`Feature`] that can be instantiated automatically.
pub trait CreatableFeature: Feature {
    /// The protocol ID of the implemented feature.
    const ID: u16;

    /// The version of the feature the implementation starts to support.
    const STARTING_VERSION: u8;

    /// Creates a new instance of the feature implementation.
    fn new(chan: Arc<UsbChannel>, device_index: u8, feature_index: u8) -> Self;
}

/// Represents an error that occurred when looking up a schema in a feature
/// model.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum FeatureError {
    /// The feature model has no table for the version.
    #[error("feature {feature_id:#06x} has no version {version}")]
    UnsupportedVersion { feature_id: u16, version: u8 },

    /// The version of the feature has no function with the index.
    #[error("feature {feature_id:#06x} v{version} has no function {index}")]
    UnknownFunction {
        feature_id: u16,
        version: u8,
        index: u8,
    },

    /// The version of the feature has no event with the index.
    #[error("feature {feature_id:#06x} v{version} has no event {index}")]
    UnknownEvent {
        feature_id: u16,
        version: u8,
        index: u8,
    },

    /// No model is known for the feature.
    #[error("no model is known for feature {0:#06x}")]
    UnknownFeature(u16),

    /// A schema of the model is not valid for any version of the model.
    #[error("`{schema}` is not valid for any version of feature {feature_id:#06x}")]
    VersionMismatch {
        feature_id: u16,
        schema: &'static str,
    },
}

/// A function of a feature with its request and response schemas.
#[derive(Debug)]
pub struct FunctionApi {
    pub index: u8,
    pub name: &'static str,
    pub request: &'static Schema,
    pub response: &'static Schema,
}

/// An event of a feature with its schema.
#[derive(Debug)]
pub struct EventApi {
    pub index: u8,
    pub name: &'static str,
    pub report: &'static Schema,
}

/// The functions and events of one version of a feature.
#[derive(Debug)]
pub struct VersionApi {
    pub version: u8,
    pub functions: &'static [FunctionApi],
    pub events: &'static [EventApi],
}

/// The complete, immutable description of a feature across its versions.
#[derive(Debug)]
pub struct FeatureModel {
    pub feature_id: u16,
    pub name: &'static str,
    pub versions: &'static [VersionApi],
}

impl FeatureModel {
    /// Creates the facade for a specific version of the feature.
    pub fn create(&'static self, version: u8) -> Result<FeatureFacade, FeatureError> {
        self.versions
            .iter()
            .find(|api| api.version == version)
            .map(|api| FeatureFacade { model: self, api })
            .ok_or(FeatureError::UnsupportedVersion {
                feature_id: self.feature_id,
                version,
            })
    }

    /// The highest version of the model that is not newer than `version`.
    ///
    /// Newer feature versions stay backwards compatible, so a device
    /// advertising a version the model does not know yet can still be talked
    /// to with the latest known one.
    pub fn best_version(&self, version: u8) -> Option<u8> {
        self.versions
            .iter()
            .map(|api| api.version)
            .filter(|&known| known <= version)
            .max()
    }

    pub fn get_request_schema(&'static self, version: u8, index: u8) -> Result<&'static Schema, FeatureError> {
        self.create(version)?.request(index)
    }

    pub fn get_response_schema(&'static self, version: u8, index: u8) -> Result<&'static Schema, FeatureError> {
        self.create(version)?.response(index)
    }

    pub fn get_event_schema(&'static self, version: u8, index: u8) -> Result<&'static Schema, FeatureError> {
        self.create(version)?.event(index)
    }

    /// Checks that every response and event schema is valid for at least one
    /// version of the model.
    pub fn validate(&self) -> Result<(), FeatureError> {
        let known = |schema: &'static Schema| {
            self.versions
                .iter()
                .any(|api| schema.supports_version(api.version))
        };

        for api in self.versions {
            let schemas = api
                .functions
                .iter()
                .map(|function| function.response)
                .chain(api.events.iter().map(|event| event.report));

            for schema in schemas {
                if !known(schema) {
                    return Err(FeatureError::VersionMismatch {
                        feature_id: self.feature_id,
                        schema: schema.name,
                    });
                }
            }
        }

        Ok(())
    }

    /// Every schema referenced by the model.
    pub fn schemas(&self) -> impl Iterator<Item = &'static Schema> + '_ {
        self.versions.iter().flat_map(|api| {
            api.functions
                .iter()
                .flat_map(|function| [function.request, function.response])
                .chain(api.events.iter().map(|event| event.report))
        })
    }
}

/// The version-matched view of a [`FeatureModel`].
#[derive(Clone, Copy, Debug)]
pub struct FeatureFacade {
    model: &'static FeatureModel,
    api: &'static VersionApi,
}

impl FeatureFacade {
    pub fn model(&self) -> &'static FeatureModel {
        self.model
    }

    pub fn version(&self) -> u8 {
        self.api.version
    }

    /// Looks up a function by its index.
    pub fn function(&self, index: u8) -> Result<&'static FunctionApi, FeatureError> {
        self.api
            .functions
            .iter()
            .find(|function| function.index == index)
            .ok_or(FeatureError::UnknownFunction {
                feature_id: self.model.feature_id,
                version: self.api.version,
                index,
            })
    }

    /// Looks up a function by its name.
    pub fn function_by_name(&self, name: &str) -> Option<&'static FunctionApi> {
        self.api
            .functions
            .iter()
            .find(|function| function.name == name)
    }

    pub fn request(&self, index: u8) -> Result<&'static Schema, FeatureError> {
        self.function(index).map(|function| function.request)
    }

    pub fn response(&self, index: u8) -> Result<&'static Schema, FeatureError> {
        self.function(index).map(|function| function.response)
    }

    pub fn event(&self, index: u8) -> Result<&'static Schema, FeatureError> {
        self.api
            .events
            .iter()
            .find(|event| event.index == index)
            .map(|event| event.report)
            .ok_or(FeatureError::UnknownEvent {
                feature_id: self.model.feature_id,
                version: self.api.version,
                index,
            })
    }

    pub fn functions(&self) -> &'static [FunctionApi] {
        self.api.functions
    }

    pub fn events(&self) -> &'static [EventApi] {
        self.api.events
    }
}

/// A bitfield describing some properties of a feature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize))]
pub struct FeatureType {
    /// Replaced by a newer feature, but still advertised for older software.
    pub obsolete: bool,

    /// Should not be managed by end user configuration software.
    pub hidden: bool,

    /// Disabled for user software. Used for internal testing and
    /// manufacturing.
    pub engineering: bool,

    /// A manufacturing feature that can be permanently deactivated.
    pub manufacturing_deactivatable: bool,

    /// A compliance feature that can be permanently deactivated.
    pub compliance_deactivatable: bool,
}

impl From<u8> for FeatureType {
    fn from(value: u8) -> Self {
        Self {
            obsolete: value & (1 << 7) != 0,
            hidden: value & (1 << 6) != 0,
            engineering: value & (1 << 5) != 0,
            manufacturing_deactivatable: value & (1 << 4) != 0,
            compliance_deactivatable: value & (1 << 3) != 0,
        }
    }
}

impl From<FeatureType> for u8 {
    fn from(value: FeatureType) -> Self {
        [
            value.obsolete,
            value.hidden,
            value.engineering,
            value.manufacturing_deactivatable,
            value.compliance_deactivatable,
        ]
        .iter()
        .enumerate()
        .filter(|(_, set)| **set)
        .fold(0, |raw, (i, _)| raw | (1 << (7 - i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_type_bits() {
        let typ = FeatureType::from(0b1010_1000);

        assert!(typ.obsolete && !typ.hidden && typ.engineering);
        assert!(!typ.manufacturing_deactivatable && typ.compliance_deactivatable);
        assert_eq!(u8::from(typ), 0b1010_1000);
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert_eq!(
            root::MODEL.create(7).unwrap_err(),
            FeatureError::UnsupportedVersion {
                feature_id: 0x0000,
                version: 7,
            }
        );
        assert_eq!(root::MODEL.best_version(7), Some(2));
    }

    #[test]
    fn lookups_are_deterministic() {
        let first = root::MODEL.get_request_schema(1, 0).unwrap();
        let second = root::MODEL.create(1).unwrap().request(0).unwrap();

        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn unknown_function_and_event() {
        let facade = root::MODEL.create(0).unwrap();

        assert!(matches!(
            facade.request(5),
            Err(FeatureError::UnknownFunction { index: 5, .. })
        ));
        assert!(matches!(
            facade.event(0),
            Err(FeatureError::UnknownEvent { index: 0, .. })
        ));
    }

    #[test]
    fn every_model_is_consistent() {
        for model in registry::models() {
            assert_eq!(model.validate(), Ok(()), "{}", model.name);
            for schema in model.schemas() {
                assert_eq!(schema.verify(), Ok(()));
                assert_eq!(schema.feature_id, model.feature_id, "{}", schema.name);
            }
        }
    }
}
