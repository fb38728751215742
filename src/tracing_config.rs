//! Log subscriber setup
//!
//! Installs a `tracing-subscriber` registry whose format, level and span timing come
//! from the `[application]` section. Events carry `mri`, `part`, `hook` and `state`
//! fields; `RUST_LOG` overrides the configured level.
//!
//! # Example
//! ```no_run
//! use rust_scan::{config::ScanConfig, tracing_config};
//! use tracing::info;
//!
//! let config = ScanConfig::load().unwrap();
//! tracing_config::init_from_config(&config).unwrap();
//! info!("Controller started");
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{LogFormat, ScanConfig};
use crate::error::{ScanError, ScanResult};

/// Subscriber settings resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: LogFormat,
    /// Emit span close events with their busy/idle time
    pub spans: bool,
}

impl LogSettings {
    /// Resolve the `[application]` logging keys.
    pub fn from_config(config: &ScanConfig) -> ScanResult<Self> {
        let app = &config.application;
        Ok(Self {
            level: parse_level(&app.log_level)?,
            format: app.log_format,
            spans: app.log_spans,
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let spans = if self.spans { FmtSpan::CLOSE } else { FmtSpan::NONE };
        let filter = self.filter();
        match self.format {
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_span_events(spans)
                .with_filter(filter)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_ansi(false)
                .with_target(false)
                .with_span_events(spans)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_events(spans)
                .with_filter(filter)
                .boxed(),
        }
    }
}

/// Install the global subscriber described by `config`.
pub fn init_from_config(config: &ScanConfig) -> ScanResult<()> {
    init(LogSettings::from_config(config)?)
}

/// Install the global subscriber.
///
/// A second call is a no-op so tests and embedding applications can call it freely.
pub fn init(settings: LogSettings) -> ScanResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    tracing_subscriber::registry()
        .with(settings.layer())
        .try_init()
        .map_err(|e| ScanError::Configuration(format!("Failed to initialize tracing: {e}")))
}

fn parse_level(level: &str) -> ScanResult<Level> {
    level.parse().map_err(|_| {
        ScanError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_ignores_case() {
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_level("Debug").unwrap(), Level::DEBUG);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_settings_follow_application_section() {
        let mut config = ScanConfig::default();
        config.application.log_level = "warn".into();
        config.application.log_format = LogFormat::Json;
        config.application.log_spans = true;
        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(
            settings,
            LogSettings {
                level: Level::WARN,
                format: LogFormat::Json,
                spans: true,
            }
        );
    }

    #[test]
    fn test_second_init_is_a_noop() {
        let settings = LogSettings::from_config(&ScanConfig::default()).unwrap();
        init(settings).unwrap();
        init(settings).unwrap();
    }
}
