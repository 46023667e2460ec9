//! # TVAC bench acquisition library
//!
//! Drives a thermal-vacuum test bench: a DAQ970A scans RTDs and strain gauges, a multi-output
//! SCPI power supply drives heater groups, and one periodic loop couples
//!
//! ```text
//! poll ─► hysteresis decision ─► PSU outputs ─► CSV log ─► live series
//! ```
//!
//! The binary (`main.rs`) wires these modules together; everything is usable on its own
//! against the simulated bench in [`instrument::mock`].
//!
//! ## Crate Structure
//!
//! - **`channel_map`**: Static channel table (ChannelId → plane and sensor name) in scan
//!   order, plus regrouping of a flat scan into planes.
//! - **`sample`**: One poll worth of readings.
//! - **`instrument`**: The adapter traits (`Instrument`, `Acquisition`, `Source`), the SCPI
//!   line transports and the DAQ970A / power supply drivers.
//! - **`acquisition`**: The poller producing one [`sample::Sample`] per tick.
//! - **`actuator`**: Heater hysteresis and the threshold table.
//! - **`data`**: Log schema, sample logger, offline log reader and live series windows.
//! - **`controller`**: The run loop.
//! - **`console`**: Operator commands on stdin.
//! - **`config`**: Figment-backed settings (`config/tvac.toml` + `TVAC_` environment).
//! - **`tracing_config`**: Subscriber setup.
//! - **`error`**: `DaqError` and `AppResult`.
//! - **`gui`**: Live plot window (feature `gui`).

pub mod acquisition;
pub mod actuator;
pub mod channel_map;
pub mod config;
pub mod console;
pub mod controller;
pub mod data;
pub mod error;
pub mod instrument;
pub mod sample;
pub mod tracing_config;

#[cfg(feature = "gui")]
pub mod gui;
