//! Multi-output SCPI power supply (R&S HMP series command set).
//!
//! Every per-output command is preceded by `INST OUT<n>` to select the output. On connect
//! every output is switched off and the configured voltage setpoints are loaded, so heaters
//! never come up energised after a reconnect.

use crate::error::{AppResult, DaqError};
use crate::instrument::transport::{Connector, DeviceRole, ScpiSession};
use crate::instrument::{parse_number, Instrument, Measure, Setting, Source, TransportKind};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Name used in logs and errors.
pub const NAME: &str = "psu";

/// Outputs of a HMP4040.
pub const DEFAULT_CHANNELS: u8 = 4;

/// Setpoints loaded on connect for the QLCS heaters and front-end boards, volts.
pub const QLCS_TVAC_VOLTAGES: [f64; 4] = [14.02, 26.9, 50.0, 50.0];

/// Default I/O timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// SCPI power supply driver.
pub struct ScpiPowerSupply {
    session: ScpiSession,
    connector: Connector,
    channels: u8,
    timeout: Duration,
    initial_voltages: Vec<f64>,
}

impl ScpiPowerSupply {
    /// Driver for a supply with `channels` outputs and no initial setpoints.
    pub fn new(connector: Connector, channels: u8) -> Self {
        Self {
            session: ScpiSession::new(NAME),
            connector,
            channels,
            timeout: DEFAULT_TIMEOUT,
            initial_voltages: Vec::new(),
        }
    }

    /// I/O timeout for every command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Voltage setpoints loaded on connect, first entry for output 1.
    pub fn with_initial_voltages(mut self, voltages: Vec<f64>) -> Self {
        self.initial_voltages = voltages;
        self
    }

    fn check_output(&self, output: u8) -> AppResult<()> {
        if output == 0 || output > self.channels {
            return Err(DaqError::Configuration(format!(
                "{}: output {} out of range 1..={}",
                NAME, output, self.channels
            )));
        }
        Ok(())
    }

    async fn select(&mut self, output: u8) -> AppResult<()> {
        self.check_output(output)?;
        self.session.write(&format!("INST OUT{}", output)).await
    }

    /// Switch every output off.
    pub async fn all_off(&mut self) -> AppResult<()> {
        for output in 1..=self.channels {
            self.write(output, Setting::Output(false)).await?;
        }
        info!(instrument = NAME, "All outputs off");
        Ok(())
    }

    async fn bring_up(&mut self) -> AppResult<()> {
        let identity = self.session.query("*IDN?").await?;
        info!(instrument = NAME, identity = %identity.trim(), "Identified");

        self.all_off().await?;
        let voltages = self.initial_voltages.clone();
        for (index, voltage) in voltages.into_iter().enumerate() {
            let output = u8::try_from(index + 1).map_err(|_| {
                DaqError::Configuration(format!("{}: too many initial voltages", NAME))
            })?;
            self.write(output, Setting::Voltage(voltage)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Instrument for ScpiPowerSupply {
    fn name(&self) -> &str {
        NAME
    }

    fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    async fn connect(&mut self, address: &str, kind: TransportKind) -> AppResult<()> {
        let transport = self
            .connector
            .open(NAME, DeviceRole::Source, address, kind, self.timeout)
            .await?;
        self.session.attach(transport).await;
        if let Err(e) = self.bring_up().await {
            self.session.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if self.session.is_open() {
            self.session.close().await;
            info!(instrument = NAME, "Disconnected");
        }
        Ok(())
    }

    async fn identify(&mut self) -> AppResult<String> {
        let identity = self.session.query("*IDN?").await?;
        Ok(identity.trim().to_string())
    }
}

#[async_trait]
impl Source for ScpiPowerSupply {
    fn channel_count(&self) -> u8 {
        self.channels
    }

    async fn read(&mut self, output: u8, measure: Measure) -> AppResult<f64> {
        self.select(output).await?;
        let command = match measure {
            Measure::Voltage => "MEAS:VOLT?",
            Measure::Current => "MEAS:CURR?",
        };
        let reply = self.session.query(command).await?;
        parse_number(NAME, command, &reply)
    }

    async fn write(&mut self, output: u8, setting: Setting) -> AppResult<()> {
        self.select(output).await?;
        let command = match setting {
            Setting::Voltage(volts) => format!("VOLT {}", volts),
            Setting::Output(true) => "OUTP ON".to_string(),
            Setting::Output(false) => "OUTP OFF".to_string(),
        };
        debug!(instrument = NAME, output, command = %command, "Output setting");
        self.session.write(&command).await
    }
}
