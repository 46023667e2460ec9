//! Bench configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/tvac.toml` by default, missing file = built-in defaults)
//! 2. environment variables prefixed with `TVAC_`, `__` separating nested keys
//!
//! ```text
//! TVAC_ACQUISITION__PERIOD_SECS=20
//! TVAC_PSU__ADDRESS=192.168.1.90
//! ```
//!
//! The built-in defaults describe the QLCS TVAC bench: DAQ970A with the QLCS channel table,
//! a 4-output PSU, U-plane heaters at -20/30 degC and P1S heaters at 58/60 degC, 60 s period.
//!
//! [`Settings::validate`] checks everything that can be checked without hardware, so a bad
//! configuration is reported before any instrument is contacted.

use crate::actuator::{HeaterGroup, ThresholdTable, Thresholds};
use crate::channel_map::{ChannelId, ChannelMap, ChannelSpec};
use crate::error::{AppResult, DaqError};
use crate::instrument::{daq970a, psu, TransportKind};
use crate::tracing_config::TracingConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/tvac.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TVAC_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub acquisition: AcquisitionConfig,
    pub storage: StorageConfig,
    pub daq: DaqConfig,
    pub psu: PsuConfig,
    pub heaters: Vec<HeaterConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            storage: StorageConfig::default(),
            daq: DaqConfig::default(),
            psu: PsuConfig::default(),
            heaters: default_heaters(),
        }
    }
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// trace, debug, info, warn, error
    pub log_level: String,
    /// pretty, compact, json
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "TVAC bench".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// What the loop does when an instrument is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossPolicy {
    /// Stop the run; the operator reconnects by restarting.
    #[default]
    Halt,
    /// Try to reconnect before every following tick.
    Retry,
}

/// Poll timing and windowing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Poll period.
    pub period_secs: u64,
    /// Instrument timeout is `period - margin` unless set per instrument.
    pub timeout_margin_secs: u64,
    /// Points kept per live series.
    pub history_capacity: usize,
    pub on_connection_loss: LossPolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            timeout_margin_secs: 5,
            history_capacity: 120,
            on_connection_loss: LossPolicy::Halt,
        }
    }
}

/// Log file placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub output_dir: PathBuf,
    /// File name is `<prefix>_<YYYYmmdd_HHMMSS>.txt`.
    pub file_prefix: String,
    /// First metadata line.
    pub title: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("log"),
            file_prefix: "temp_plotter".to_string(),
            title: "DAQ970A and PSU data".to_string(),
        }
    }
}

/// Acquisition unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    pub enabled: bool,
    pub transport: TransportKind,
    pub address: String,
    /// Overrides `period - margin`.
    pub timeout_ms: Option<u64>,
    /// Channel table in scan order. Built-in QLCS table when absent.
    pub channels: Option<Vec<ChannelSpec>>,
    /// Scan setup commands sent after reset. Built-in QLCS setup when absent.
    pub configure: Option<Vec<String>>,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportKind::Lan,
            address: String::new(),
            timeout_ms: None,
            channels: None,
            configure: None,
        }
    }
}

/// Power supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsuConfig {
    pub enabled: bool,
    pub transport: TransportKind,
    pub address: String,
    pub channels: u8,
    pub timeout_ms: Option<u64>,
    /// Setpoints loaded on connect, first entry for output 1.
    pub initial_voltages: Vec<f64>,
}

impl Default for PsuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportKind::Lan,
            address: "192.168.1.90".to_string(),
            channels: psu::DEFAULT_CHANNELS,
            timeout_ms: None,
            initial_voltages: psu::QLCS_TVAC_VOLTAGES.to_vec(),
        }
    }
}

/// One heater group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub name: String,
    /// Channels averaged into the reference temperature.
    pub reference: Vec<ChannelId>,
    /// PSU outputs (1-based) switched together.
    pub outputs: Vec<u8>,
    pub low: f64,
    pub high: f64,
}

fn default_heaters() -> Vec<HeaterConfig> {
    vec![
        HeaterConfig {
            name: "U-plane".to_string(),
            reference: vec!["211".into(), "213".into()],
            outputs: vec![1, 2],
            low: -20.0,
            high: 30.0,
        },
        HeaterConfig {
            name: "P1S".to_string(),
            reference: vec!["317".into(), "318".into(), "319".into()],
            outputs: vec![3, 4],
            low: 58.0,
            high: 60.0,
        },
    ]
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    /// Poll period.
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.acquisition.period_secs)
    }

    fn derived_timeout(&self) -> Duration {
        self.period()
            .saturating_sub(Duration::from_secs(self.acquisition.timeout_margin_secs))
    }

    /// DAQ I/O timeout.
    pub fn daq_timeout(&self) -> Duration {
        self.daq
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.derived_timeout())
    }

    /// PSU I/O timeout.
    pub fn psu_timeout(&self) -> Duration {
        self.psu
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| psu::DEFAULT_TIMEOUT.min(self.derived_timeout()))
    }

    /// DAQ scan setup commands.
    pub fn daq_configuration(&self) -> Vec<String> {
        match &self.daq.configure {
            Some(commands) => commands.clone(),
            None => daq970a::QLCS_TVAC_CONFIGURATION
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }

    /// Channel map of the run. Empty when the DAQ is disabled.
    pub fn channel_map(&self) -> AppResult<ChannelMap> {
        if !self.daq.enabled {
            return Ok(ChannelMap::empty());
        }
        match &self.daq.channels {
            Some(channels) => ChannelMap::new(channels.clone()),
            None => ChannelMap::qlcs_tvac(),
        }
    }

    /// Initial thresholds of every heater group.
    pub fn threshold_table(&self) -> AppResult<ThresholdTable> {
        let mut table = ThresholdTable::default();
        for heater in &self.heaters {
            let band = Thresholds::new(heater.low, heater.high).map_err(|e| {
                DaqError::Configuration(format!("Heater group '{}': {}", heater.name, e))
            })?;
            table.insert(heater.name.clone(), band);
        }
        Ok(table)
    }

    /// Heater groups resolved against `map`.
    pub fn heater_groups(&self, map: &ChannelMap) -> AppResult<Vec<HeaterGroup>> {
        self.heaters
            .iter()
            .map(|heater| {
                HeaterGroup::resolve(&heater.name, &heater.reference, heater.outputs.clone(), map)
            })
            .collect()
    }

    /// Check the whole configuration.
    ///
    /// # Errors
    /// `Configuration` naming the first problem found, `FeatureNotEnabled` for a serial
    /// transport in a build without `instrument_serial`.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |message: String| Err(DaqError::Configuration(message));

        TracingConfig::from_settings(self).map_err(DaqError::Configuration)?;

        let period = self.period();
        if period.is_zero() {
            return invalid("acquisition.period_secs must be at least 1".to_string());
        }
        if self.acquisition.history_capacity == 0 {
            return invalid("acquisition.history_capacity must be at least 1".to_string());
        }
        if self.storage.file_prefix.trim().is_empty() {
            return invalid("storage.file_prefix must not be empty".to_string());
        }

        if !self.daq.enabled && !self.psu.enabled {
            return invalid("At least one of daq and psu must be enabled".to_string());
        }

        let serial = (self.daq.enabled && self.daq.transport == TransportKind::Serial)
            || (self.psu.enabled && self.psu.transport == TransportKind::Serial);
        if serial && !cfg!(feature = "instrument_serial") {
            return Err(DaqError::FeatureNotEnabled(
                "instrument_serial (serial transport configured)".to_string(),
            ));
        }

        if self.daq.enabled {
            let timeout = self.daq_timeout();
            if timeout.is_zero() || timeout >= period {
                return invalid(format!(
                    "DAQ timeout {:?} must be positive and shorter than the poll period {:?}",
                    timeout, period
                ));
            }
            if self.daq.transport != TransportKind::Mock && self.daq.address.trim().is_empty() {
                return invalid("daq.address must be set".to_string());
            }
        }

        if self.psu.enabled {
            let timeout = self.psu_timeout();
            if timeout.is_zero() || timeout >= period {
                return invalid(format!(
                    "PSU timeout {:?} must be positive and shorter than the poll period {:?}",
                    timeout, period
                ));
            }
            if self.psu.channels == 0 {
                return invalid("psu.channels must be at least 1".to_string());
            }
            if self.psu.transport != TransportKind::Mock && self.psu.address.trim().is_empty() {
                return invalid("psu.address must be set".to_string());
            }
            if self.psu.initial_voltages.len() > usize::from(self.psu.channels) {
                return invalid(format!(
                    "{} initial voltages for {} PSU outputs",
                    self.psu.initial_voltages.len(),
                    self.psu.channels
                ));
            }
            if let Some(v) = self
                .psu
                .initial_voltages
                .iter()
                .find(|v| !v.is_finite() || **v < 0.0)
            {
                return invalid(format!("Invalid initial PSU voltage {}", v));
            }
        }

        let map = self.channel_map()?;
        self.threshold_table()?;

        let mut names = HashSet::new();
        let mut driven = HashSet::new();
        for heater in &self.heaters {
            if !names.insert(heater.name.as_str()) {
                return invalid(format!("Duplicate heater group '{}'", heater.name));
            }
            if !self.psu.enabled {
                return invalid(format!(
                    "Heater group '{}' needs the power supply enabled",
                    heater.name
                ));
            }
            for output in &heater.outputs {
                if *output == 0 || *output > self.psu.channels {
                    return invalid(format!(
                        "Heater group '{}' drives output {} but the PSU has outputs 1..={}",
                        heater.name, output, self.psu.channels
                    ));
                }
                if !driven.insert(*output) {
                    return invalid(format!(
                        "PSU output {} is driven by more than one heater group",
                        output
                    ));
                }
            }
        }
        self.heater_groups(&map)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_map::Plane;
    use std::io::Write;

    fn bench() -> Settings {
        let mut settings = Settings::default();
        settings.daq.address = "192.168.1.91".to_string();
        settings
    }

    #[test]
    fn defaults_describe_the_qlcs_bench() {
        let settings = bench();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.daq_timeout(), Duration::from_secs(55));
        assert_eq!(settings.heaters.len(), 2);
        assert_eq!(settings.channel_map().unwrap().len(), 57);
        let table = settings.threshold_table().unwrap();
        assert_eq!(table.get("P1S").unwrap().low(), 58.0);
    }

    #[test]
    fn default_heater_bands() {
        let table = Settings::default().threshold_table().unwrap();
        let u_plane = table.get("U-plane").unwrap();
        assert_eq!((u_plane.low(), u_plane.high()), (-20.0, 30.0));
        let p1s = table.get("P1S").unwrap();
        assert_eq!((p1s.low(), p1s.high()), (58.0, 60.0));
    }

    #[test]
    fn shipped_profile_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/tvac.toml");
        let settings = Settings::load_from(path).unwrap();
        assert_eq!(settings.heaters, Settings::default().heaters);
    }

    #[test]
    fn inverted_thresholds_are_fatal() {
        let mut settings = bench();
        settings.heaters[0].low = 61.0;
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn psu_only_profile_needs_serial_support() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/psu_only.toml");
        let settings = Settings::load_from(path).unwrap();
        assert!(!settings.daq.enabled);
        assert!(settings.heaters.is_empty());
        let validated = settings.validate();
        if cfg!(feature = "instrument_serial") {
            assert!(validated.is_ok());
        } else {
            assert!(matches!(validated, Err(DaqError::FeatureNotEnabled(_))));
        }
    }

    #[test]
    fn unknown_log_settings_are_fatal() {
        let mut settings = bench();
        settings.application.log_format = "xml".to_string();
        assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));
        settings.application.log_format = "JSON".to_string();
        settings.application.log_level = "chatty".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn timeout_must_be_shorter_than_period() {
        let mut settings = bench();
        settings.daq.timeout_ms = Some(60_000);
        assert!(settings.validate().is_err());
        settings.daq.timeout_ms = None;
        settings.acquisition.timeout_margin_secs = 60;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn heater_outputs_are_checked() {
        let mut settings = bench();
        settings.heaters[1].outputs = vec![2, 5];
        assert!(settings.validate().is_err());
        settings.heaters[1].outputs = vec![2];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn unknown_reference_sensor_is_fatal() {
        let mut settings = bench();
        settings.heaters[0].reference = vec!["206".into()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn psu_only_bench() {
        let mut settings = Settings::default();
        settings.daq.enabled = false;
        settings.heaters.clear();
        settings.acquisition.period_secs = 20;
        assert!(settings.validate().is_ok());
        assert!(settings.channel_map().unwrap().is_empty());
        assert_eq!(settings.psu_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn toml_file_and_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[acquisition]
period_secs = 30
on_connection_loss = "retry"

[daq]
transport = "mock"

[[daq.channels]]
id = "211"
plane = "u"
name = "pt31"

[[daq.channels]]
id = "213"
plane = "U"
name = "pt33"

[[heaters]]
name = "U-plane"
reference = ["211", "213"]
outputs = [1, 2]
low = 40.0
high = 42.5
"#
        )
        .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("TVAC_PSU__ADDRESS", "10.0.0.7");
            let settings = Settings::load_from(file.path()).map_err(|e| e.to_string())?;
            assert_eq!(settings.acquisition.period_secs, 30);
            assert_eq!(settings.acquisition.on_connection_loss, LossPolicy::Retry);
            assert_eq!(settings.psu.address, "10.0.0.7");
            assert_eq!(settings.heaters.len(), 1);
            let map = settings.channel_map().map_err(|e| e.to_string())?;
            assert_eq!(map.group_size(Plane::U), 2);
            assert!(settings.validate().is_ok());
            Ok(())
        });
    }
}
