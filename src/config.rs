//! Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the scan controller.
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/rust_scan.toml` by default)
//! 2. Environment variables (prefixed with `RUST_SCAN_`, sections split on `__`)
//!
//! Every section carries serde defaults, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use rust_scan::config::ScanConfig;
//!
//! let config = ScanConfig::load().unwrap();
//! println!("Points per profile build: {}", config.trajectory.points_per_build);
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ScanError, ScanResult};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Runnable controller settings
    pub controller: ControllerConfig,
    /// Trajectory planner settings
    pub trajectory: TrajectoryConfig,
    /// HDF writer settings
    pub writer: WriterConfig,
    /// Detector driver settings
    pub detector: DetectorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Log span open/close, giving hook timings
    pub log_spans: bool,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Directory holding saved designs, one sub-directory per controller
    pub design_dir: PathBuf,
    /// Cap on validate/tweak rounds
    pub validate_max_iterations: usize,
    /// Design to load at startup, if any
    pub initial_design: Option<String>,
}

/// Trajectory planner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Target number of profile rows per build/append
    pub points_per_build: usize,
    /// Base timeout (seconds) added to the point duration when waiting for rows
    pub row_timeout_base_s: f64,
}

/// HDF writer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Base of the stall timeout: `base + max(duration, base)`
    pub frame_timeout_base_s: f64,
    /// Interval between progress checks while waiting for frames
    pub progress_poll_s: f64,
    /// Frames between data/attribute flushes
    pub flush_per_n_frames: u32,
}

/// Detector driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Base timeout (seconds) waiting for the next frame
    pub frame_timeout_base_s: f64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust-scan".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            log_spans: false,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            design_dir: PathBuf::from("designs"),
            validate_max_iterations: 10,
            initial_design: None,
        }
    }
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            points_per_build: 4000,
            row_timeout_base_s: 30.0,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            frame_timeout_base_s: 30.0,
            progress_poll_s: 1.0,
            flush_per_n_frames: 10,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_timeout_base_s: 120.0,
        }
    }
}

impl WriterConfig {
    /// Stall timeout for a scan whose points last `duration` seconds.
    pub fn frame_timeout(&self, duration: f64) -> Duration {
        let base = self.frame_timeout_base_s;
        Duration::from_secs_f64(base + duration.max(base))
    }

    /// Interval between progress checks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.progress_poll_s)
    }
}

impl ScanConfig {
    /// Load configuration from `config/rust_scan.toml` and environment variables
    ///
    /// Environment variables can override configuration with prefix `RUST_SCAN_`.
    /// Example: `RUST_SCAN_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> ScanResult<Self> {
        Self::load_from("config/rust_scan.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScanResult<Self> {
        let config: ScanConfig = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_SCAN_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides)
    pub fn from_toml_str(text: &str) -> ScanResult<Self> {
        let config: ScanConfig = Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::string(text))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration back to TOML
    pub fn to_toml_string(&self) -> ScanResult<String> {
        toml::to_string_pretty(self).map_err(|e| ScanError::Serialization(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.controller.validate_max_iterations == 0 {
            return Err(ScanError::Configuration(
                "validate_max_iterations must be at least 1".into(),
            ));
        }

        if self.trajectory.points_per_build < 2 {
            return Err(ScanError::Configuration(
                "points_per_build must be at least 2".into(),
            ));
        }

        let timeouts = [
            ("trajectory.row_timeout_base_s", self.trajectory.row_timeout_base_s),
            ("writer.frame_timeout_base_s", self.writer.frame_timeout_base_s),
            ("writer.progress_poll_s", self.writer.progress_poll_s),
            ("detector.frame_timeout_base_s", self.detector.frame_timeout_base_s),
        ];
        for (name, value) in timeouts {
            if !(value.is_finite() && value > 0.0) {
                return Err(ScanError::Configuration(format!(
                    "{name} must be a positive number of seconds, got {value}"
                )));
            }
        }

        if self.writer.flush_per_n_frames == 0 {
            return Err(ScanError::Configuration(
                "flush_per_n_frames must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
