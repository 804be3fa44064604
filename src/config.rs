//! Configuration for scan commands, loaded with Figment.
//!
//! Configuration is read from:
//! 1. `config/daq_scan.toml` (or a given path); a missing file is not an error
//! 2. Environment variables prefixed with `DAQ_SCAN_`, sections separated by
//!    a double underscore
//!
//! Every field has a default, so an empty configuration is valid.
//!
//! # Example
//! ```no_run
//! use daq_scan::config::ScanConfig;
//!
//! // DAQ_SCAN_MOTION__POLL_INTERVAL_MS=10 overrides [motion] poll_interval_ms
//! let config = ScanConfig::load()?;
//! config.validate()?;
//! println!("Polling every {:?}", config.motion.poll_interval());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_scan.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DAQ_SCAN_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Log output
    pub logging: LogSettings,
    /// Barrier-wait timing
    pub motion: MotionConfig,
    /// Point-by-point execution of nested scans
    pub secondary: SecondaryConfig,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// `[motion]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Interval between `is_busy` polls in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MotionConfig {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// `[secondary]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryConfig {
    /// Name of the axis replaying collected rows through the engine
    pub replay_axis_name: String,
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            replay_axis_name: crate::scan::secondary::DEFAULT_REPLAY_AXIS_NAME.to_string(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    50
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl ScanConfig {
    /// Load configuration from `config/daq_scan.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    /// Load and validate, falling back to defaults on any problem.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match Self::load_from(path) {
            Ok(config) => match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Invalid configuration, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load configuration, using defaults");
                Self::default()
            }
        }
    }

    /// Render the configuration as TOML, e.g. to seed a configuration file
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(ScanConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let level = self.logging.level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            ));
        }

        let format = self.logging.format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                VALID_FORMATS.join(", ")
            ));
        }

        if self.motion.poll_interval_ms == 0 {
            return Err("Invalid poll_interval_ms 0. Must be greater than zero".to_string());
        }

        if self.secondary.replay_axis_name.trim().is_empty() {
            return Err("replay_axis_name must not be empty".to_string());
        }

        Ok(())
    }
}
