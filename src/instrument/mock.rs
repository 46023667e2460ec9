//! Simulated TVAC bench for dry runs and tests.
//!
//! One [`MockBench`] plays both instruments: it answers the DAQ970A scan commands with the
//! temperatures of a crude thermal plant and the power supply commands with an ohmic load.
//! Heated planes warm up while any of their heater outputs is on and cool down otherwise, so
//! a dry run shows the hysteresis controller cycling.
//!
//! Failures can be injected at any time (`set_offline`, `truncate_scan`, `push_error`).

use crate::channel_map::{ChannelId, ChannelMap, Plane};
use crate::error::{AppResult, DaqError};
use crate::instrument::transport::{DeviceRole, ScpiTransport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const DAQ_IDENTITY: &str = "Keysight Technologies,DAQ970A,MY58000000,A.03.01-02.40-03.01-00.02-01-02";
const PSU_IDENTITY: &str = "ROHDE&SCHWARZ,HMP4040,000000,HW50020001/SW2.62";
const NO_ERROR: &str = "+0,\"No error\"";

/// Starting temperature of every RTD.
pub const START_TEMPERATURE: f64 = 55.0;
/// Warming per scan while a plane's heaters are on, degC.
pub const HEAT_STEP: f64 = 1.5;
/// Cooling per scan while a plane's heaters are off, degC.
pub const COOL_STEP: f64 = 1.0;
/// Resistance seen by every PSU output, ohms.
pub const LOAD_OHMS: f64 = 28.0;

#[derive(Debug, Clone)]
struct SimChannel {
    id: ChannelId,
    plane: Plane,
    value: f64,
}

#[derive(Debug, Clone, Default)]
struct SimOutput {
    voltage: f64,
    on: bool,
}

#[derive(Debug)]
struct BenchState {
    channels: Vec<SimChannel>,
    heaters: Vec<(Plane, Vec<u8>)>,
    outputs: Vec<SimOutput>,
    selected: u8,
    errors: VecDeque<String>,
    offline: bool,
    scan_length: Option<usize>,
    commands: Vec<String>,
}

impl BenchState {
    fn heated(&self, plane: Plane) -> Option<bool> {
        self.heaters
            .iter()
            .find(|(p, _)| *p == plane)
            .map(|(_, outputs)| {
                outputs.iter().any(|n| {
                    self.outputs
                        .get(usize::from(*n).wrapping_sub(1))
                        .map(|o| o.on)
                        .unwrap_or(false)
                })
            })
    }

    fn scan(&mut self) -> Vec<f64> {
        let heating: Vec<Option<bool>> = self
            .channels
            .iter()
            .map(|channel| self.heated(channel.plane))
            .collect();
        for (channel, heated) in self.channels.iter_mut().zip(heating) {
            match heated {
                Some(true) => channel.value += HEAT_STEP,
                Some(false) => channel.value -= COOL_STEP,
                None => {}
            }
        }
        let length = self.scan_length.unwrap_or(self.channels.len());
        self.channels
            .iter()
            .map(|c| c.value)
            .chain(std::iter::repeat(0.0))
            .take(length)
            .collect()
    }

    fn output(&mut self) -> Option<&mut SimOutput> {
        self.outputs.get_mut(usize::from(self.selected).wrapping_sub(1))
    }

    fn measure(&mut self, what: &str) -> Option<f64> {
        let output = self.output()?;
        let (voltage, current) = if output.on {
            (output.voltage, output.voltage / LOAD_OHMS)
        } else {
            (0.0, 0.0)
        };
        match what {
            "VOLT" => Some(voltage),
            "CURR" => Some(current),
            _ => None,
        }
    }
}

/// Shared handle to the simulated bench. Clones talk to the same bench.
#[derive(Debug, Clone)]
pub struct MockBench {
    state: Arc<Mutex<BenchState>>,
}

impl MockBench {
    /// Bench scanning the channels of `map`, with `psu_channels` outputs. Each `heaters`
    /// entry couples a plane to the outputs that warm it.
    pub fn new(map: &ChannelMap, psu_channels: u8, heaters: Vec<(Plane, Vec<u8>)>) -> Self {
        let channels = map
            .scan_order()
            .iter()
            .enumerate()
            .filter_map(|(index, id)| {
                let (plane, _) = map.resolve(id)?;
                let value = if plane.is_temperature() {
                    START_TEMPERATURE + (index % 5) as f64 * 0.2
                } else {
                    (index % 3) as f64 * 1e-6
                };
                Some(SimChannel {
                    id: id.clone(),
                    plane,
                    value,
                })
            })
            .collect();

        Self {
            state: Arc::new(Mutex::new(BenchState {
                channels,
                heaters,
                outputs: vec![SimOutput::default(); usize::from(psu_channels)],
                selected: 1,
                errors: VecDeque::new(),
                offline: false,
                scan_length: None,
                commands: Vec::new(),
            })),
        }
    }

    /// Open a transport for one instrument of the bench.
    pub async fn open(&self, instrument: &str, role: DeviceRole) -> AppResult<MockTransport> {
        if self.state.lock().await.offline {
            return Err(DaqError::connection(instrument, "simulated bench offline"));
        }
        Ok(MockTransport {
            instrument: instrument.to_string(),
            role,
            bench: self.clone(),
        })
    }

    /// Make every instrument unreachable (or reachable again).
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Force the length of the next scans (`None` restores the real length).
    pub async fn truncate_scan(&self, length: Option<usize>) {
        self.state.lock().await.scan_length = length;
    }

    /// Queue an entry in the instrument error queue.
    pub async fn push_error(&self, error: &str) {
        self.state.lock().await.errors.push_back(error.to_string());
    }

    /// Override the current reading of a channel.
    pub async fn set_value(&self, channel: &ChannelId, value: f64) {
        let mut state = self.state.lock().await;
        if let Some(sim) = state.channels.iter_mut().find(|c| &c.id == channel) {
            sim.value = value;
        }
    }

    /// Relay state of a PSU output (1-based).
    pub async fn output_on(&self, output: u8) -> Option<bool> {
        let state = self.state.lock().await;
        state
            .outputs
            .get(usize::from(output).wrapping_sub(1))
            .map(|o| o.on)
    }

    /// Voltage setpoint of a PSU output (1-based).
    pub async fn voltage_setpoint(&self, output: u8) -> Option<f64> {
        let state = self.state.lock().await;
        state
            .outputs
            .get(usize::from(output).wrapping_sub(1))
            .map(|o| o.voltage)
    }

    /// Every command received so far, as `instrument: command`.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.commands.clone()
    }
}

/// Transport into the simulated bench.
#[derive(Debug)]
pub struct MockTransport {
    instrument: String,
    role: DeviceRole,
    bench: MockBench,
}

impl MockTransport {
    fn offline(&self) -> DaqError {
        DaqError::connection(&self.instrument, "simulated bench offline")
    }

    async fn handle(&mut self, command: &str) -> AppResult<Option<String>> {
        let mut state = self.bench.state.lock().await;
        if state.offline {
            return Err(self.offline());
        }
        state
            .commands
            .push(format!("{}: {}", self.instrument, command));
        debug!(instrument = %self.instrument, command, "Simulated SCPI");

        let upper = command.trim().to_ascii_uppercase();
        let (header, argument) = match upper.split_once(' ') {
            Some((header, argument)) => (header.to_string(), argument.trim().to_string()),
            None => (upper.clone(), String::new()),
        };

        let reply = match (self.role, header.as_str()) {
            (DeviceRole::Acquisition, "*IDN?") => Some(DAQ_IDENTITY.to_string()),
            (DeviceRole::Source, "*IDN?") => Some(PSU_IDENTITY.to_string()),
            (_, "SYST:ERR?") | (_, "SYST:ERROR?") => Some(
                state
                    .errors
                    .pop_front()
                    .unwrap_or_else(|| NO_ERROR.to_string()),
            ),
            (_, "*RST") | (_, "RST") | (_, "*CLS") => {
                state.scan_length = None;
                None
            }
            (DeviceRole::Acquisition, "ABOR") => None,
            (DeviceRole::Acquisition, "READ?") => Some(
                state
                    .scan()
                    .iter()
                    .map(|v| format!("{:+.6E}", v))
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            (DeviceRole::Acquisition, h)
                if h.starts_with("CONF:")
                    || h.starts_with("TEMP:")
                    || h.starts_with("STR:")
                    || h.starts_with("ROUT:")
                    || h.starts_with("TRIG:") =>
            {
                None
            }
            (DeviceRole::Source, "INST") | (DeviceRole::Source, "INST:NSEL") => {
                let number = argument.trim_start_matches("OUT").parse::<u8>().ok();
                match number {
                    Some(n) if n >= 1 && usize::from(n) <= state.outputs.len() => {
                        state.selected = n;
                    }
                    _ => state
                        .errors
                        .push_back("-222,\"Data out of range\"".to_string()),
                }
                None
            }
            (DeviceRole::Source, "VOLT") => {
                let value = argument.parse::<f64>().ok();
                let applied = match (value, state.output()) {
                    (Some(v), Some(output)) => {
                        output.voltage = v;
                        true
                    }
                    _ => false,
                };
                if !applied {
                    state
                        .errors
                        .push_back("-224,\"Illegal parameter value\"".to_string());
                }
                None
            }
            (DeviceRole::Source, "OUTP") => {
                let on = matches!(argument.as_str(), "ON" | "1");
                if let Some(output) = state.output() {
                    output.on = on;
                }
                None
            }
            (DeviceRole::Source, h) if h.starts_with("MEAS:") => {
                let what = h.trim_start_matches("MEAS:").trim_end_matches('?');
                match state.measure(what) {
                    Some(value) => Some(format!("{:.4}", value)),
                    None => {
                        return Err(DaqError::Instrument(format!(
                            "{}: undefined query '{}'",
                            self.instrument, command
                        )))
                    }
                }
            }
            (_, h) => {
                state
                    .errors
                    .push_back("-113,\"Undefined header\"".to_string());
                if h.ends_with('?') {
                    return Err(DaqError::Instrument(format!(
                        "{}: undefined query '{}'",
                        self.instrument, command
                    )));
                }
                None
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.handle(command).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        self.handle(command).await?.ok_or_else(|| {
            DaqError::Instrument(format!(
                "{}: '{}' does not return a value",
                self.instrument, command
            ))
        })
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock:{}", self.instrument)
    }
}
