//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole bench. Using the
//! `thiserror` crate, it provides one place where every failure of the acquisition pipeline
//! is named, from configuration mistakes caught at startup to instruments dropping off the
//! network in the middle of a run.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches in
//!   the TOML configuration or `TVAC_` environment overrides.
//! - **`Configuration`**: Semantic errors in the configuration (threshold ordering, unmapped
//!   or duplicated channels, heater outputs outside the power supply). Always fatal and
//!   reported before any instrument connection is attempted.
//! - **`Connection`** / **`Timeout`**: The instrument is unreachable or did not answer within
//!   its timeout. The poll cycle aborts cleanly and the loop policy decides whether to halt
//!   or retry at the next tick.
//! - **`Instrument`**: Any other failure reported by an instrument (garbage reply, error
//!   queue entry). Surfaced, never swallowed.
//! - **`Parse`**: A user-edited setting is not a number. Recovered locally by keeping the
//!   previous value.
//! - **`FormatMismatch`**: A sample's per-plane length disagrees with the channel map. The
//!   poll is aborted instead of writing a misaligned log line.
//! - **`Io`** / **`Csv`**: Log file I/O.
//! - **`FeatureNotEnabled`**: The configuration asks for functionality that was not compiled
//!   in (e.g. serial transport without `instrument_serial`).
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with the
//! `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the acquisition pipeline can report.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration source could not be read or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration was read but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Instrument transport is unavailable.
    #[error("{instrument}: connection error: {reason}")]
    Connection {
        /// Instrument name as used in the logs.
        instrument: String,
        /// What went wrong.
        reason: String,
    },

    /// Instrument did not answer within its I/O timeout.
    #[error("{instrument}: no answer within {after:?}")]
    Timeout {
        /// Instrument name as used in the logs.
        instrument: String,
        /// Timeout that expired.
        after: Duration,
    },

    /// Instrument answered with something unusable.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A setting could not be parsed as a number.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Grouped readings disagree with the channel map.
    #[error("Format mismatch in {group}: expected {expected} readings, got {actual}")]
    FormatMismatch {
        /// Plane or PSU group that failed the check.
        group: String,
        /// Length demanded by the channel map.
        expected: usize,
        /// Length actually present.
        actual: usize,
    },

    /// Log file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Requested functionality is behind a disabled cargo feature.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Shorthand for [`DaqError::Connection`].
    pub fn connection(instrument: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::Connection {
            instrument: instrument.into(),
            reason: reason.into(),
        }
    }

    /// True when the instrument is gone (unreachable or silent) and must be reconnected.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, DaqError::Connection { .. } | DaqError::Timeout { .. })
    }

    /// True for failures that belong to an instrument rather than to the bench itself.
    ///
    /// These mark the instrument disconnected; they never crash the poll loop on their own.
    pub fn is_instrument_fault(&self) -> bool {
        self.is_connection_loss() || matches!(self, DaqError::Instrument(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connection_loss() {
        let err = DaqError::connection("daq970a", "refused");
        assert!(err.is_connection_loss());
        assert!(err.is_instrument_fault());
        assert_eq!(err.to_string(), "daq970a: connection error: refused");

        let timeout = DaqError::Timeout {
            instrument: "psu".into(),
            after: Duration::from_secs(55),
        };
        assert!(timeout.is_connection_loss());
    }

    #[test]
    fn instrument_error_is_fault_but_not_loss() {
        let err = DaqError::Instrument("bad reply".into());
        assert!(err.is_instrument_fault());
        assert!(!err.is_connection_loss());
    }

    #[test]
    fn format_mismatch_is_not_instrument_fault() {
        let err = DaqError::FormatMismatch {
            group: "U".into(),
            expected: 18,
            actual: 17,
        };
        assert!(!err.is_instrument_fault());
        assert!(err.to_string().contains("expected 18"));
    }
}
