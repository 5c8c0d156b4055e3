//! Construction options of the transport context, loadable from TOML.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The verbosity of the trace sink.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    #[default]
    NoTrace,
    Error,
    Warning,
    Info,
    Debug,
    ExtraDebug,
}

impl TraceLevel {
    /// The matching `tracing` level, or [`None`] if tracing is disabled.
    pub fn as_tracing(self) -> Option<tracing::Level> {
        match self {
            Self::NoTrace => None,
            Self::Error => Some(tracing::Level::ERROR),
            Self::Warning => Some(tracing::Level::WARN),
            Self::Info => Some(tracing::Level::INFO),
            Self::Debug => Some(tracing::Level::DEBUG),
            Self::ExtraDebug => Some(tracing::Level::TRACE),
        }
    }
}

/// Options accepted by [`crate::transport::UsbContext`].
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Enables a dedicated trace sink with the given level.
    pub trace_level: Option<TraceLevel>,

    /// Writes the trace to this file instead of stderr.
    pub trace_file_name: Option<PathBuf>,

    /// The maximum amount of worker threads polling endpoints.
    pub max_threads: usize,

    /// The timeout of every USB transfer, in milliseconds.
    pub usb_timeout_ms: u64,

    /// Whether kernel drivers detached on open are attached again on close.
    pub reattach_kernel_driver: bool,

    /// Only consider devices with this vendor ID.
    pub vendor_id: Option<u16>,

    /// Only consider devices with this product ID.
    pub product_id: Option<u16>,

    /// Only consider the device with this reader name.
    pub reader_name: Option<String>,

    /// The capacity of every dispatcher queue.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            trace_level: None,
            trace_file_name: None,
            max_threads: 4,
            usb_timeout_ms: 2000,
            reattach_kernel_driver: false,
            vendor_id: None,
            product_id: None,
            reader_name: None,
            queue_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Reads and validates a configuration from a TOML file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every option for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::InvalidValue {
                option: "max_threads",
                reason: "at least one worker thread is required",
            });
        }

        if self.usb_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                option: "usb_timeout_ms",
                reason: "a zero timeout would block forever",
            });
        }

        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                option: "queue_capacity",
                reason: "queues must hold at least one frame",
            });
        }

        Ok(())
    }

    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_timeout_ms)
    }

    /// Whether a device matches the configured selector.
    pub fn selects(&self, reader_name: &str, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|vid| vid == vendor_id)
            && self.product_id.is_none_or(|pid| pid == product_id)
            && self.reader_name.as_deref().is_none_or(|name| name == reader_name)
    }
}

/// Represents an error occurring while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for `{option}`: {reason}")]
    InvalidValue {
        option: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_uses_defaults() {
        let config: TransportConfig = toml::from_str(
            r#"
            trace_level = "extra_debug"
            usb_timeout_ms = 500
            vendor_id = 0x046d
            "#,
        )
        .unwrap();

        assert_eq!(config.trace_level, Some(TraceLevel::ExtraDebug));
        assert_eq!(config.usb_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_threads, 4);
        assert!(!config.reattach_kernel_driver);
        assert!(config.selects("Bus 001 Device 2", 0x046d, 0xc548));
        assert!(!config.selects("Bus 001 Device 2", 0x1234, 0xc548));
    }

    #[test]
    fn zero_threads_are_rejected() {
        let config = TransportConfig {
            max_threads: 0,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                option: "max_threads",
                ..
            })
        ));
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn trace_levels_map_to_tracing() {
        assert_eq!(TraceLevel::NoTrace.as_tracing(), None);
        assert_eq!(TraceLevel::Warning.as_tracing(), Some(tracing::Level::WARN));
        assert_eq!(TraceLevel::ExtraDebug.as_tracing(), Some(tracing::Level::TRACE));
    }
}
