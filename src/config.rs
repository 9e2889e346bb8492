//! Layered configuration using Figment
//!
//! Settings are assembled from, in increasing precedence:
//! 1. Compiled defaults ([`Settings::default`])
//! 2. An optional TOML file (conventionally `config/default.toml`)
//! 3. Environment variables prefixed with `HVDAQ_`, `__` separating sections
//!
//! # Environment Variable Overrides
//!
//! ```text
//! HVDAQ_APPLICATION__LOG_LEVEL=debug
//! HVDAQ_POWER_SUPPLY__ADDRESS=5
//! HVDAQ_ACQUISITION__SAMPLE_RATE_HZ=2.0
//! HVDAQ_SAFETY__EMERGENCY_TIMEOUT=100ms
//! ```
//!
//! # Example
//!
//! ```no_run
//! use hv_daq::config::Settings;
//!
//! let settings = Settings::load(Some("config/default.toml".as_ref()))?;
//! println!("supply at GPIB address {}", settings.power_supply.address);
//! # Ok::<(), hv_daq::config::ConfigError>(())
//! ```

use crate::codec::{MAX_CURRENT_LIMIT, MAX_OUTPUT_VOLTAGE};
use crate::safety::FaultPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Highest GPIB primary address.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or merged.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// An explicitly named file does not exist.
    #[error("Configuration file not found: {0}")]
    MissingFile(PathBuf),
    /// A value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// Settings could not be rendered back to TOML.
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Keithley 2290-5 link
    pub power_supply: InstrumentSettings,
    /// Keithley 6485 link
    pub picoammeter: InstrumentSettings,
    /// Periodic polling
    pub acquisition: AcquisitionSettings,
    /// Interlock bounds and fault handling
    pub safety: SafetySettings,
    /// Consumer queues
    pub bus: BusSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// GPIB link to one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// GPIB board index (`GPIB<board>`)
    pub board: u8,
    /// GPIB primary address, 0-30
    pub address: u8,
    /// Default per-command timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Fragment the `*IDN?` reply must contain
    pub identity_match: String,
}

/// Acquisition scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Polling rate, 0.1-10 Hz
    pub sample_rate_hz: f64,
    /// Consecutive failed ticks before acquisition faults
    pub failure_threshold: u32,
    /// Timeout applied to each periodic query
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

/// Safety interlock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySettings {
    /// Highest voltage limit the interlock accepts (V)
    pub max_voltage: f64,
    /// Highest current limit the interlock accepts (A)
    pub max_current: f64,
    /// Bound on the priority `HVOF` issued by emergency and fault paths
    #[serde(with = "humantime_serde")]
    pub emergency_timeout: Duration,
    /// Whether a supply reconnect clears `Fault`
    pub fault_policy: FaultPolicy,
}

/// Sample bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Per-consumer queue capacity
    pub capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationSettings {
                name: "HV DAQ".to_string(),
                log_level: "info".to_string(),
            },
            power_supply: InstrumentSettings {
                board: 0,
                address: 14,
                timeout: Duration::from_secs(5),
                identity_match: "2290".to_string(),
            },
            picoammeter: InstrumentSettings {
                board: 0,
                address: 22,
                timeout: Duration::from_secs(5),
                identity_match: "6485".to_string(),
            },
            acquisition: AcquisitionSettings {
                sample_rate_hz: 1.0,
                failure_threshold: 5,
                read_timeout: Duration::from_secs(2),
            },
            safety: SafetySettings {
                max_voltage: MAX_OUTPUT_VOLTAGE,
                max_current: MAX_CURRENT_LIMIT,
                emergency_timeout: Duration::from_millis(250),
                fault_policy: FaultPolicy::RequireOperatorClear,
            },
            bus: BusSettings { capacity: 1024 },
        }
    }
}

impl Default for SafetySettings {
    fn default() -> Self {
        Settings::default().safety
    }
}

impl Settings {
    /// Load defaults, then `path` if given, then `HVDAQ_*` environment
    /// variables, and validate the result.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if:
    /// - `path` is given but does not exist
    /// - A layer cannot be parsed into `Settings`
    /// - Validation fails
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed("HVDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, link) in [
            ("power_supply", &self.power_supply),
            ("picoammeter", &self.picoammeter),
        ] {
            if link.address > MAX_GPIB_ADDRESS {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {}.address {}. Must be 0-{}",
                    name, link.address, MAX_GPIB_ADDRESS
                )));
            }
            if link.timeout.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "{}.timeout must be greater than zero",
                    name
                )));
            }
        }

        if self.power_supply.board == self.picoammeter.board
            && self.power_supply.address == self.picoammeter.address
        {
            return Err(ConfigError::ValidationError(format!(
                "power_supply and picoammeter share GPIB{}::{}",
                self.power_supply.board, self.power_supply.address
            )));
        }

        let rate = self.acquisition.sample_rate_hz;
        if !(0.1..=10.0).contains(&rate) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid acquisition.sample_rate_hz {}. Must be 0.1-10",
                rate
            )));
        }
        if self.acquisition.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "acquisition.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.acquisition.read_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "acquisition.read_timeout must be greater than zero".to_string(),
            ));
        }

        if !(self.safety.max_voltage > 0.0 && self.safety.max_voltage <= MAX_OUTPUT_VOLTAGE) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid safety.max_voltage {}. Must be in (0, {}]",
                self.safety.max_voltage, MAX_OUTPUT_VOLTAGE
            )));
        }
        if !(self.safety.max_current > 0.0 && self.safety.max_current <= MAX_CURRENT_LIMIT) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid safety.max_current {}. Must be in (0, {}]",
                self.safety.max_current, MAX_CURRENT_LIMIT
            )));
        }
        if self.safety.emergency_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "safety.emergency_timeout must be greater than zero".to_string(),
            ));
        }

        if self.bus.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "bus.capacity must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Period between acquisition ticks.
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.acquisition.sample_rate_hz)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.power_supply.address, 14);
        assert_eq!(settings.picoammeter.address, 22);
        assert_eq!(settings.sample_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_address_out_of_range() {
        let mut settings = Settings::default();
        settings.picoammeter.address = 31;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("picoammeter.address"));
    }

    #[test]
    fn test_shared_address_rejected() {
        let mut settings = Settings::default();
        settings.picoammeter.address = 14;
        assert!(settings.validate().is_err());

        settings.picoammeter.board = 1;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_sample_rate_bounds() {
        let mut settings = Settings::default();
        settings.acquisition.sample_rate_hz = 20.0;
        assert!(settings.validate().is_err());
        settings.acquisition.sample_rate_hz = 0.05;
        assert!(settings.validate().is_err());
        settings.acquisition.sample_rate_hz = 10.0;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_safety_maxima_bounded_by_hardware() {
        let mut settings = Settings::default();
        settings.safety.max_voltage = 6000.0;
        assert!(settings.validate().is_err());
        settings.safety.max_voltage = 1000.0;
        settings.safety.max_current = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[power_supply]
address = 5
timeout = "750ms"

[safety]
max_voltage = 1500.0
fault_policy = "auto_clear_on_reconnect"
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.power_supply.address, 5);
        assert_eq!(settings.power_supply.timeout, Duration::from_millis(750));
        assert_eq!(settings.safety.max_voltage, 1500.0);
        assert_eq!(settings.safety.fault_policy, FaultPolicy::AutoClearOnReconnect);
        // untouched keys keep their defaults
        assert_eq!(settings.picoammeter.address, 22);
        assert_eq!(settings.bus.capacity, 1024);
    }

    #[test]
    fn test_load_rejects_invalid_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\ncapacity = 0").unwrap();
        let err = Settings::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::load(Some(Path::new("/nonexistent/hv_daq.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }

    #[test]
    fn test_to_toml_round_trips() {
        let settings = Settings::default();
        let text = settings.to_toml().unwrap();
        assert!(text.contains("emergency_timeout = \"250ms\""));
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }
}
