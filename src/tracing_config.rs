//! Structured logging setup.
//!
//! `[application] log_level` sets the default level and `RUST_LOG` overrides it.
//! `log_format` picks the output:
//! - `pretty` for the operator terminal
//! - `compact` for one line per event
//! - `json` for log shippers
//!
//! ```no_run
//! use tvac_daq::{config::Settings, tracing_config};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! tracing_config::init_from_settings(&settings)?;
//! info!(period_secs = settings.acquisition.period_secs, "Bench starting");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured.
    Pretty,
    /// One line per event, no colour.
    Compact,
    /// One JSON object per line.
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Level and layout taken from `[application]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output layout.
    pub format: OutputFormat,
}

impl TracingConfig {
    /// Read level and format from the application settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format.parse()?,
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }
}

/// Install the global subscriber described by the application settings.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber. Once one is installed, later calls are no-ops.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = config.filter();
    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().pretty().with_filter(filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(fmt::layer().compact().with_ansi(false).with_filter(filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(filter))
            .try_init(),
    };
    result.map_err(|e| format!("Failed to initialize tracing: {}", e))
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level.trim()).map_err(|_| {
        format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}
