//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/silverpak.toml`)
//! 2. Environment variables prefixed with `SILVERPAK_`
//!    (e.g. `SILVERPAK_MOTOR__VELOCITY=200000`)
//!
//! Every section has defaults, so an empty file yields a usable configuration
//! except for the connection target, which `connect()` insists on and
//! `find_and_connect()` discovers.
//!
//! # Example
//! ```no_run
//! use silverpak::config::SilverpakConfig;
//!
//! let config = SilverpakConfig::load()?;
//! config.validate()?;
//! println!("velocity: {}", config.motor.velocity);
//! # Ok::<(), silverpak::SilverpakError>(())
//! ```

use crate::error::{Result, SilverpakError};
use crate::protocol::DriverAddress;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/silverpak.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilverpakConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Which port/baud/driver to talk to
    pub connection: ConnectionConfig,
    /// Motor settings written during initialization
    pub motor: MotorSettings,
    /// Position poller cadence and firmware-quirk thresholds
    pub poller: PollerConfig,
    /// Serial pacing
    pub transport: TransportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Silverpak".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Connection target. Unset fields are searched by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port name, e.g. `/dev/ttyUSB0` or `COM3`
    pub port_name: Option<String>,
    /// Baud rate
    pub baud_rate: Option<u32>,
    /// Driver address switch digit (`1`-`F`, `0`)
    pub driver_address: Option<DriverAddress>,
}

/// Adjustable motor settings sent by `initialize_motor_settings` and
/// `resend_motor_settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorSettings {
    /// Acceleration (`L`)
    pub acceleration: i64,
    /// Encoder ratio × 1000 (`aE`)
    pub encoder_ratio: i64,
    /// Holding current in percent (`h`)
    pub holding_current: i64,
    /// Home switch polarity (`f`)
    pub home_polarity: i64,
    /// Upper travel limit in motor units
    pub max_position: i64,
    /// Motor direction polarity (`F`)
    pub motor_polarity: i64,
    /// Position correction retries (`au`)
    pub position_correction_retries: i64,
    /// Position correction tolerance (`aC`)
    pub position_correction_tolerance: i64,
    /// Running current in percent (`m`)
    pub running_current: i64,
    /// Slew velocity (`V`)
    pub velocity: i64,
}

impl Default for MotorSettings {
    fn default() -> Self {
        Self {
            acceleration: 500,
            encoder_ratio: 10266,
            holding_current: 5,
            home_polarity: 0,
            max_position: 500_000,
            motor_polarity: 1,
            position_correction_retries: 5,
            position_correction_tolerance: 5,
            running_current: 50,
            velocity: 230_000,
        }
    }
}

impl MotorSettings {
    /// Position the motor believes it is at before homing: the upper limit
    /// expressed in encoder-scaled units.
    pub fn assumed_top_position(&self) -> i64 {
        (self.max_position as f64 * (self.encoder_ratio as f64 / 1000.0)).round() as i64
    }
}

/// Poller settings and the empirical firmware thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Start-to-start interval between position queries
    pub interval_ms: u64,
    /// Consecutive unparseable replies before the device is declared lost
    pub max_consecutive_failures: u32,
    /// Position changes tolerated while calibrating home
    pub max_home_calibration_steps: u32,
    /// Position old firmware falsely reports as the top
    pub firmware_quirk_position: i64,
    /// Distance from `firmware_quirk_position` that still counts as the quirk
    pub firmware_quirk_tolerance: i64,
    /// How long an external stop waits for the loop to exit
    pub stop_timeout_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            max_consecutive_failures: 5,
            max_home_calibration_steps: 5,
            firmware_quirk_position: 5_000_000,
            firmware_quirk_tolerance: 100,
            stop_timeout_ms: 1000,
        }
    }
}

impl PollerConfig {
    /// Poll interval as a `Duration`.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Stop timeout as a `Duration`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Serial pacing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Minimum device turnaround; every delay factor is a multiple of this
    pub delay_unit_ms: u64,
    /// How long a read waits for bytes before it counts as empty
    pub read_window_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delay_unit_ms: 50,
            read_window_ms: 20,
        }
    }
}

impl TransportConfig {
    /// Pacing unit as a `Duration`.
    pub fn delay_unit(&self) -> Duration {
        Duration::from_millis(self.delay_unit_ms)
    }

    /// Read window as a `Duration`.
    pub fn read_window(&self) -> Duration {
        Duration::from_millis(self.read_window_ms)
    }
}

impl SilverpakConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SILVERPAK_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(SilverpakError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if let Some(address) = self.connection.driver_address {
            if !address.is_individual() {
                return Err(SilverpakError::Configuration(format!(
                    "driver_address must name a single driver, got {address}"
                )));
            }
        }

        if matches!(self.connection.baud_rate, Some(0)) {
            return Err(SilverpakError::Configuration(
                "baud_rate must be positive".to_string(),
            ));
        }

        if self.motor.encoder_ratio <= 0 {
            return Err(SilverpakError::Configuration(format!(
                "encoder_ratio must be positive, got {}",
                self.motor.encoder_ratio
            )));
        }

        if self.motor.max_position <= 0 {
            return Err(SilverpakError::Configuration(format!(
                "max_position must be positive, got {}",
                self.motor.max_position
            )));
        }

        for (name, value) in [
            ("holding_current", self.motor.holding_current),
            ("running_current", self.motor.running_current),
        ] {
            if !(0..=100).contains(&value) {
                return Err(SilverpakError::Configuration(format!(
                    "{name} is a percentage (0-100), got {value}"
                )));
            }
        }

        if self.poller.interval_ms == 0 {
            return Err(SilverpakError::Configuration(
                "poller.interval_ms must be positive".to_string(),
            ));
        }

        if self.poller.max_consecutive_failures == 0 {
            return Err(SilverpakError::Configuration(
                "poller.max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Render as TOML, e.g. to seed a new configuration file.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SilverpakError::Configuration(format!("cannot serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_silverpak_factory_setup() {
        let config = SilverpakConfig::default();
        assert_eq!(config.motor.velocity, 230_000);
        assert_eq!(config.motor.encoder_ratio, 10266);
        assert_eq!(config.poller.interval_ms, 200);
        assert_eq!(config.poller.max_consecutive_failures, 5);
        assert_eq!(config.transport.delay_unit_ms, 50);
        assert!(config.connection.port_name.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn assumed_top_position_scales_by_encoder_ratio() {
        let motor = MotorSettings {
            max_position: 500_000,
            encoder_ratio: 10266,
            ..Default::default()
        };
        assert_eq!(motor.assumed_top_position(), 5_133_000);
    }

    #[test]
    fn load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[connection]
port_name = "/dev/ttyUSB0"
baud_rate = 9600
driver_address = "1"

[motor]
velocity = 100000

[poller]
interval_ms = 100
"#
        )
        .unwrap();

        let config = SilverpakConfig::load_from(file.path()).unwrap();
        assert_eq!(config.connection.port_name.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.connection.baud_rate, Some(9600));
        assert_eq!(config.connection.driver_address, Some(DriverAddress::Driver1));
        assert_eq!(config.motor.velocity, 100_000);
        assert_eq!(config.motor.acceleration, 500);
        assert_eq!(config.poller.interval_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SilverpakConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SilverpakConfig::default());
    }

    #[test]
    fn validation_rejects_group_address() {
        let mut config = SilverpakConfig::default();
        config.connection.driver_address = Some(DriverAddress::AllDrivers);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = SilverpakConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = SilverpakConfig::default();
        config.motor.running_current = 150;
        assert!(config.validate().is_err());

        let mut config = SilverpakConfig::default();
        config.poller.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip_keeps_address_digit() {
        let mut config = SilverpakConfig::default();
        config.connection.driver_address = Some(DriverAddress::Driver0);
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("driver_address = \"0\""));
    }
}
