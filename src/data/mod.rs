//! Data persistence and windowing modules.
//!
//! - **`schema`**: the single column order shared by the log header and every data line.
//! - **`sample_log`**: append-only delimited log of samples, flushed per record.
//! - **`series`**: bounded sliding windows feeding the live plots.
//! - **`log_reader`**: offline parser for finished log files.
pub mod log_reader;
pub mod sample_log;
pub mod schema;
pub mod series;
