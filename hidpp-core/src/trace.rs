//! Builds the trace sink injected into the transport context and its
//! channels.

use std::{fs::File, sync::Mutex};

use tracing::{Dispatch, level_filters::LevelFilter};

use crate::config::{ConfigError, TransportConfig};

/// An optional, scoped trace sink.
///
/// When no dispatch is held, events go to whatever subscriber is installed
/// for the process.
#[derive(Clone, Debug, Default)]
pub struct TraceSink {
    dispatch: Option<Dispatch>,
}

impl TraceSink {
    /// Creates a sink from the trace options of a configuration.
    pub fn from_config(config: &TransportConfig) -> Result<Self, ConfigError> {
        let Some(level) = config.trace_level.and_then(|level| level.as_tracing()) else {
            return Ok(Self::default());
        };

        let builder = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::from_level(level))
            .with_thread_names(true)
            .with_target(true);

        let dispatch = match &config.trace_file_name {
            Some(path) => {
                let file = File::create(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                Dispatch::new(builder.with_ansi(false).with_writer(Mutex::new(file)).finish())
            },
            None => Dispatch::new(builder.with_writer(std::io::stderr).finish()),
        };

        Ok(Self {
            dispatch: Some(dispatch),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Runs a closure with the sink installed as the default subscriber of the
    /// current thread.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceLevel;

    #[test]
    fn disabled_without_level() {
        let sink = TraceSink::from_config(&TransportConfig::default()).unwrap();
        assert!(!sink.is_enabled());
        assert_eq!(sink.in_scope(|| 7), 7);

        let config = TransportConfig {
            trace_level: Some(TraceLevel::NoTrace),
            ..Default::default()
        };
        assert!(!TraceSink::from_config(&config).unwrap().is_enabled());
    }

    #[test]
    fn enabled_with_level() {
        let config = TransportConfig {
            trace_level: Some(TraceLevel::Debug),
            ..Default::default()
        };

        let sink = TraceSink::from_config(&config).unwrap();
        assert!(sink.is_enabled());
        assert!(sink.in_scope(|| tracing::enabled!(tracing::Level::DEBUG)));
    }
}
