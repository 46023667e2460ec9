//! Keysight DAQ970A data acquisition unit.
//!
//! Bring-up on every connect:
//!
//! 1. `*RST`
//! 2. drain `SYST:ERR?` until the reply reads `+0,"No error"`, then `ABOR`
//! 3. `*IDN?`
//! 4. the scan configuration commands (RTD and strain channel setup, apertures,
//!    `ROUT:SCAN`, `TRIG:COUN 1`)
//!
//! A poll is a single `READ?`, answered with one comma-separated value per channel of the
//! scan list. The instrument timeout must cover the whole scan, which takes most of a minute
//! for the QLCS wiring at 200 ms aperture.

use crate::channel_map::ChannelId;
use crate::error::{AppResult, DaqError};
use crate::instrument::transport::{Connector, DeviceRole, ScpiSession};
use crate::instrument::{Acquisition, Instrument, TransportKind};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use tracing::{info, warn};

/// Name used in logs and errors.
pub const NAME: &str = "daq970a";

/// I/O timeout: five seconds shorter than the 60 s poll period.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(55_000);

/// Scan setup of the QLCS TVAC campaign.
pub const QLCS_TVAC_CONFIGURATION: &[&str] = &[
    "CONF:TEMP:RTD 1000,(@101:120)",
    "CONF:TEMP:RTD 1000,(@201:205,207:220)",
    "CONF:TEMP:RTD 1000,(@315:319)",
    "CONF:STR:DIR 120,2,(@301:309,311:314)",
    "TEMP:APER 200E-3",
    "STR:APER 200E-3",
    "ROUT:SCAN (@101:120,201:205,207:220,301:309,311:314,315:319)",
    "TRIG:COUN 1",
];

/// Upper bound on error queue entries read in one drain.
const MAX_QUEUED_ERRORS: usize = 64;

/// DAQ970A driver.
pub struct Daq970a {
    session: ScpiSession,
    connector: Connector,
    timeout: Duration,
    configuration: Vec<String>,
    scan_order: Vec<ChannelId>,
    no_error: Regex,
}

impl Daq970a {
    /// Driver reading `scan_order`, configured with the QLCS TVAC scan setup.
    pub fn new(connector: Connector, scan_order: Vec<ChannelId>) -> AppResult<Self> {
        let no_error = Regex::new(r"^\+?0")
            .map_err(|e| DaqError::Configuration(format!("error queue pattern: {}", e)))?;
        Ok(Self {
            session: ScpiSession::new(NAME),
            connector,
            timeout: DEFAULT_TIMEOUT,
            configuration: QLCS_TVAC_CONFIGURATION
                .iter()
                .map(|c| c.to_string())
                .collect(),
            scan_order,
            no_error,
        })
    }

    /// I/O timeout for every command.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the scan configuration commands sent after reset.
    pub fn with_configuration(mut self, commands: Vec<String>) -> Self {
        self.configuration = commands;
        self
    }

    /// Read the error queue until it is empty. Returns the entries found.
    pub async fn drain_errors(&mut self) -> AppResult<Vec<String>> {
        let mut found = Vec::new();
        for _ in 0..MAX_QUEUED_ERRORS {
            let reply = self.session.query("SYST:ERR?").await?;
            if self.no_error.is_match(reply.trim()) {
                return Ok(found);
            }
            warn!(instrument = NAME, "Queued error: {}", reply);
            found.push(reply);
        }
        Err(DaqError::Instrument(format!(
            "{}: error queue not empty after {} reads",
            NAME, MAX_QUEUED_ERRORS
        )))
    }

    async fn bring_up(&mut self) -> AppResult<()> {
        self.session.write("*RST").await?;
        self.drain_errors().await?;
        self.session.write("ABOR").await?;

        let identity = self.session.query("*IDN?").await?;
        info!(instrument = NAME, identity = %identity.trim(), "Identified");

        for command in self.configuration.clone() {
            self.session.write(&command).await?;
        }
        let errors = self.drain_errors().await?;
        if !errors.is_empty() {
            return Err(DaqError::Instrument(format!(
                "{}: scan configuration rejected: {}",
                NAME,
                errors.join("; ")
            )));
        }
        info!(
            instrument = NAME,
            channels = self.scan_order.len(),
            "Scan configured"
        );
        Ok(())
    }

    fn parse_scan(reply: &str) -> AppResult<Vec<f64>> {
        reply
            .trim()
            .split(',')
            .map(|field| {
                field.trim().parse::<f64>().map_err(|e| {
                    DaqError::Instrument(format!("{}: bad scan value '{}': {}", NAME, field, e))
                })
            })
            .collect()
    }
}

#[async_trait]
impl Instrument for Daq970a {
    fn name(&self) -> &str {
        NAME
    }

    fn is_connected(&self) -> bool {
        self.session.is_open()
    }

    async fn connect(&mut self, address: &str, kind: TransportKind) -> AppResult<()> {
        let transport = self
            .connector
            .open(NAME, DeviceRole::Acquisition, address, kind, self.timeout)
            .await?;
        self.session.attach(transport).await;
        if let Err(e) = self.bring_up().await {
            self.session.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        if !self.session.is_open() {
            return Ok(());
        }
        // The instrument may already be gone; closing must still succeed.
        if let Err(e) = self.drain_errors().await {
            warn!(instrument = NAME, "Error queue not drained on disconnect: {}", e);
        }
        self.session.close().await;
        info!(instrument = NAME, "Disconnected");
        Ok(())
    }

    async fn identify(&mut self) -> AppResult<String> {
        let identity = self.session.query("*IDN?").await?;
        Ok(identity.trim().to_string())
    }
}

#[async_trait]
impl Acquisition for Daq970a {
    async fn read_all(&mut self) -> AppResult<Vec<f64>> {
        let reply = self.session.query("READ?").await?;
        Self::parse_scan(&reply)
    }

    async fn read_channel(&mut self, channel: &ChannelId) -> AppResult<f64> {
        let position = self
            .scan_order
            .iter()
            .position(|id| id == channel)
            .ok_or_else(|| {
                DaqError::Instrument(format!("{}: channel {} is not scanned", NAME, channel))
            })?;
        let scan = self.read_all().await?;
        scan.get(position).copied().ok_or(DaqError::FormatMismatch {
            group: "scan".to_string(),
            expected: self.scan_order.len(),
            actual: scan.len(),
        })
    }

    async fn abort(&mut self) -> AppResult<()> {
        self.session.write("ABOR").await
    }
}
