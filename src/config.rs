//! Harness configuration using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults (match the bench setup of the ventilator line)
//! 2. `config/harness.toml` (or any path given on the command line)
//! 3. Environment variables prefixed with `VENT_HARNESS_`; nested keys are
//!    separated with a double underscore, e.g. `VENT_HARNESS_SERIAL__PORT=/dev/ttyUSB1`
//!
//! Durations are written in humantime form (`"500ms"`, `"10s"`).
//!
//! # Example
//! ```no_run
//! use vent_harness::config::HarnessConfig;
//!
//! let config = HarnessConfig::load()?;
//! config.validate()?;
//! println!("Serial port: {}", config.serial.port);
//! # Ok::<(), vent_harness::error::HarnessError>(())
//! ```

use crate::error::{HarnessError, HarnessResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the harness configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/harness.toml";

/// Top-level harness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub serial: SerialConfig,
    /// Liveness probe and monitor loop settings
    pub probe: ProbeConfig,
    /// Step pacing and command timeouts
    pub timing: TimingConfig,
    /// Locations of the YAML catalogs
    pub catalog: CatalogPaths,
    /// Report output settings
    pub report: ReportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Ventilator UART Test Harness".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Communication speed
    pub baud_rate: u32,
    /// Terminator appended to every outgoing command
    pub line_terminator: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            line_terminator: "\n".to_string(),
        }
    }
}

/// Liveness probe and connected-loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Command sent to confirm the device is alive
    pub command: String,
    /// Regex a probe reply must match
    pub response_pattern: String,
    /// Marker the device prints once a reboot has finished
    pub reboot_marker: String,
    /// Probe attempts per connection cycle
    pub retry_budget: u32,
    /// How long to wait for a probe reply
    #[serde(with = "humantime_serde")]
    pub response_window: Duration,
    /// Backoff between probe attempts and between connection cycles
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Interval at which the console buffer is cleared
    #[serde(with = "humantime_serde")]
    pub clear_interval: Duration,
    /// Number of received lines kept in the console buffer
    pub console_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            command: "time_tick".to_string(),
            response_pattern: r"\[time_tick\+ok\]\s*".to_string(),
            reboot_marker: "POST Check - Coin Bat.".to_string(),
            retry_budget: 5,
            response_window: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            clear_interval: Duration::from_secs(20),
            console_capacity: 200,
        }
    }
}

/// Runner pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a command waits for its single response line
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Delay applied after every step, whatever its outcome
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// How long the runner waits for the monitor to report `Connected`
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(2),
            settle_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// Locations of the command, condition and plan catalogs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogPaths {
    /// Command table (`commands:` mapping)
    pub commands: PathBuf,
    /// Condition table (`conditions:` mapping)
    pub conditions: PathBuf,
    /// Test plans (`plans:` mapping)
    pub plans: PathBuf,
}

impl Default for CatalogPaths {
    fn default() -> Self {
        Self {
            commands: PathBuf::from("config/commands.yml"),
            conditions: PathBuf::from("config/conditions.yml"),
            plans: PathBuf::from("config/plans.yml"),
        }
    }
}

/// Report output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory the report (and session dump) is written to
    pub output_dir: PathBuf,
    /// Also write the full session as JSON next to the report
    pub save_session_json: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("reports"),
            save_session_json: true,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from `config/harness.toml` and environment variables
    pub fn load() -> HarnessResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment variables
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HarnessResult<Self> {
        let config = Figment::from(Serialized::defaults(HarnessConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VENT_HARNESS_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> HarnessResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(HarnessError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(HarnessError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.serial.port.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "serial.port cannot be empty".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(HarnessError::Configuration(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }

        if self.probe.command.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "probe.command cannot be empty".to_string(),
            ));
        }
        regex::Regex::new(&self.probe.response_pattern).map_err(|e| {
            HarnessError::Configuration(format!(
                "Invalid probe.response_pattern '{}': {}",
                self.probe.response_pattern, e
            ))
        })?;
        if self.probe.retry_budget == 0 {
            return Err(HarnessError::Configuration(
                "probe.retry_budget must be at least 1".to_string(),
            ));
        }
        if self.probe.console_capacity == 0 {
            return Err(HarnessError::Configuration(
                "probe.console_capacity must be at least 1".to_string(),
            ));
        }

        for (name, value) in [
            ("probe.response_window", self.probe.response_window),
            ("probe.clear_interval", self.probe.clear_interval),
            ("timing.command_timeout", self.timing.command_timeout),
            ("timing.connect_timeout", self.timing.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(HarnessError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}
