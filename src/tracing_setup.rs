//! Tracing initialisation
//!
//! Logs go to stderr so the rendered report on stdout stays clean. The
//! monitor, transport and runner all log through the `tracing` macros, and
//! every plan step runs inside a `step` span, so one call here is enough to
//! follow a whole run.
//!
//! # Example
//! ```no_run
//! use vent_harness::config::HarnessConfig;
//! use vent_harness::tracing_setup::{self, TracingConfig};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarnessConfig::load()?;
//! tracing_setup::init(TracingConfig::from_harness_config(&config)?.with_step_timing(true))?;
//! info!(port = %config.serial.port, "harness starting");
//! # Ok(())
//! # }
//! ```

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use std::io::IsTerminal;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, for watching a run at the bench
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event, for collecting station logs
    Json,
}

impl FromStr for OutputFormat {
    type Err = HarnessError;

    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(HarnessError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Log when each step span closes, with its busy/idle time
    pub step_timing: bool,
    /// Colour output; ignored for JSON
    pub ansi: bool,
}

impl TracingConfig {
    /// Take level and format from the `[application]` section.
    ///
    /// Colours are only enabled when stderr is a terminal.
    pub fn from_harness_config(config: &HarnessConfig) -> HarnessResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            step_timing: false,
            ansi: std::io::stderr().is_terminal(),
        })
    }

    /// Log step durations when each step finishes.
    pub fn with_step_timing(mut self, enabled: bool) -> Self {
        self.step_timing = enabled;
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.step_timing {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already installed this returns
/// `Ok(())`.
pub fn init(config: TracingConfig) -> HarnessResult<()> {
    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(config.span_events());
    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.ansi).with_filter(env_filter).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(config.ansi).with_filter(env_filter).boxed(),
        OutputFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(HarnessError::Configuration(format!(
                    "Failed to initialize tracing: {e}"
                )))
            }
        })
}

fn parse_log_level(level: &str) -> HarnessResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(HarnessError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
