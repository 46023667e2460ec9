//! Instrument adapters.
//!
//! Every bench instrument implements the [`Instrument`] lifecycle plus one capability:
//!
//! - [`Acquisition`]: multi-channel scanner returning one flat vector per scan (DAQ970A).
//! - [`Source`]: multi-output power supply, addressed per output.
//!
//! Drivers speak SCPI over a [`transport::ScpiTransport`] chosen by [`TransportKind`]:
//! a raw LAN socket, a USB virtual COM port (feature `instrument_serial`) or the simulated
//! bench in [`mock`]. Every driver is owned by the poll loop, so methods take `&mut self`.
//!
//! Transport failures surface as `DaqError::Connection` or `DaqError::Timeout` and leave the
//! driver disconnected. Other failures (unparsable replies, unknown channels) are surfaced
//! as `DaqError::Instrument` without touching the connection.

pub mod daq970a;
pub mod mock;
pub mod psu;
pub mod transport;

use crate::channel_map::ChannelId;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use daq970a::Daq970a;
pub use psu::ScpiPowerSupply;
pub use transport::{Connector, ScpiTransport};

/// How an instrument is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw SCPI socket, `host` or `host:port`.
    #[default]
    Lan,
    /// USB virtual COM port, e.g. `/dev/ttyACM0`.
    Serial,
    /// Simulated bench.
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Lan => "lan",
            TransportKind::Serial => "serial",
            TransportKind::Mock => "mock",
        })
    }
}

impl FromStr for TransportKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lan" | "ip" | "tcp" => Ok(TransportKind::Lan),
            "serial" | "usb" => Ok(TransportKind::Serial),
            "mock" => Ok(TransportKind::Mock),
            other => Err(DaqError::Configuration(format!(
                "Unknown transport '{}'. Must be one of: lan, serial, mock",
                other
            ))),
        }
    }
}

/// Output setting of a [`Source`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    /// Voltage setpoint in volts.
    Voltage(f64),
    /// Output relay.
    Output(bool),
}

/// Quantity measured on a [`Source`] output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    /// Output voltage, volts.
    Voltage,
    /// Output current, amperes.
    Current,
}

/// Connection lifecycle shared by all instruments.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Short name used in logs and errors (`daq970a`, `psu`).
    fn name(&self) -> &str;

    /// True while a transport is attached.
    fn is_connected(&self) -> bool;

    /// Open the transport and bring the instrument into its measurement configuration.
    async fn connect(&mut self, address: &str, kind: TransportKind) -> AppResult<()>;

    /// Release the transport. A no-op when already disconnected.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// `*IDN?` reply.
    async fn identify(&mut self) -> AppResult<String>;
}

/// Scanner returning every configured channel in one call.
#[async_trait]
pub trait Acquisition: Instrument {
    /// One scan, in scan-list order.
    async fn read_all(&mut self) -> AppResult<Vec<f64>>;

    /// Reading of a single channel of the scan list.
    async fn read_channel(&mut self, channel: &ChannelId) -> AppResult<f64>;

    /// Abort a scan in progress.
    async fn abort(&mut self) -> AppResult<()>;
}

/// Multi-output source. Outputs are numbered from 1.
#[async_trait]
pub trait Source: Instrument {
    /// Number of outputs.
    fn channel_count(&self) -> u8;

    /// Measure one output.
    async fn read(&mut self, output: u8, measure: Measure) -> AppResult<f64>;

    /// Apply a setting to one output.
    async fn write(&mut self, output: u8, setting: Setting) -> AppResult<()>;
}

pub(crate) fn not_connected(instrument: &str) -> DaqError {
    DaqError::connection(instrument, "not connected")
}

/// Parse a numeric SCPI reply.
pub(crate) fn parse_number(instrument: &str, command: &str, reply: &str) -> AppResult<f64> {
    reply.trim().parse::<f64>().map_err(|e| {
        DaqError::Instrument(format!(
            "{}: unparsable reply '{}' to '{}': {}",
            instrument,
            reply.trim(),
            command,
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parsing() {
        assert_eq!("LAN".parse::<TransportKind>().unwrap(), TransportKind::Lan);
        assert_eq!("usb".parse::<TransportKind>().unwrap(), TransportKind::Serial);
        assert!("gpib".parse::<TransportKind>().is_err());
    }

    #[test]
    fn numeric_replies() {
        assert_eq!(parse_number("psu", "MEAS:VOLT?", "+1.402000E+01\n").unwrap(), 14.02);
        assert!(matches!(
            parse_number("psu", "MEAS:VOLT?", "ERR"),
            Err(DaqError::Instrument(_))
        ));
    }
}
