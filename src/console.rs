//! Operator console on stdin.
//!
//! ```text
//! set U-plane low 57.5
//! set P1S hi 61
//! status
//! stop
//! ```
//!
//! Threshold edits go to the run loop through a `watch` channel and take effect at the next
//! evaluation. A rejected edit leaves the thresholds in force untouched.

use crate::actuator::{Bound, ThresholdTable};
use crate::controller::RunStatus;
use crate::error::{AppResult, DaqError};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const HELP: &str = "commands: set <group> <low|high> <value> | status | thresholds | stop | help";

/// One console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Change one threshold. The value is kept as text until applied.
    Set {
        /// Heater group name.
        group: String,
        /// Which side of the band.
        bound: Bound,
        /// New value, degC.
        value: String,
    },
    /// Print the last run status.
    Status,
    /// Print the thresholds in force.
    Thresholds,
    /// Stop after the tick in progress.
    Stop,
    /// Print the command list.
    Help,
}

/// Parse a console line. Blank lines give `None`.
///
/// # Errors
/// `Parse` for an unknown command or a malformed `set`.
pub fn parse_command(line: &str) -> AppResult<Option<ConsoleCommand>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((verb, args)) = words.split_first() else {
        return Ok(None);
    };
    let command = match (verb.to_ascii_lowercase().as_str(), args) {
        ("set", [group, bound, value]) => ConsoleCommand::Set {
            group: group.to_string(),
            bound: bound.parse()?,
            value: value.to_string(),
        },
        ("set", _) => {
            return Err(DaqError::Parse(
                "usage: set <group> <low|high> <value>".to_string(),
            ))
        }
        ("status", []) => ConsoleCommand::Status,
        ("thresholds", []) => ConsoleCommand::Thresholds,
        ("stop" | "quit" | "exit", []) => ConsoleCommand::Stop,
        ("help" | "?", _) => ConsoleCommand::Help,
        _ => return Err(DaqError::Parse(format!("unknown command '{}'", line.trim()))),
    };
    Ok(Some(command))
}

fn describe(table: &ThresholdTable) -> String {
    if table.is_empty() {
        return "no heater groups".to_string();
    }
    table
        .iter()
        .map(|(group, band)| format!("{}: {} < t < {}", group, band.low(), band.high()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Channels the console talks to the run loop through.
pub struct ConsoleLinks {
    /// Thresholds read by the run loop.
    pub thresholds: watch::Sender<ThresholdTable>,
    /// Shared with the Ctrl-C handler.
    pub stop: Arc<watch::Sender<bool>>,
    /// Status published by the run loop.
    pub status: watch::Receiver<RunStatus>,
}

impl ConsoleLinks {
    /// Carry out one command and return the reply line.
    ///
    /// # Errors
    /// `Parse` or `Configuration` for a rejected edit; the thresholds are unchanged.
    pub fn execute(&self, command: ConsoleCommand) -> AppResult<String> {
        match command {
            ConsoleCommand::Set {
                group,
                bound,
                value,
            } => {
                let mut table = self.thresholds.borrow().clone();
                let band = table.set_bound(&group, bound, &value)?;
                self.thresholds.send_replace(table);
                Ok(format!(
                    "{}: {} < t < {} from the next tick",
                    group,
                    band.low(),
                    band.high()
                ))
            }
            ConsoleCommand::Status => Ok(self.status.borrow().to_string()),
            ConsoleCommand::Thresholds => Ok(describe(&self.thresholds.borrow())),
            ConsoleCommand::Stop => {
                info!("Stop requested from the console");
                self.stop.send_replace(true);
                Ok("stopping after the current tick".to_string())
            }
            ConsoleCommand::Help => Ok(HELP.to_string()),
        }
    }
}

/// Serve console lines from `input` until `stop` or end of input.
///
/// End of input leaves the run going.
pub async fn run_console<R, W>(input: R, mut output: W, links: ConsoleLinks) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match parse_command(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => {
                let stopping = command == ConsoleCommand::Stop;
                let reply = links.execute(command);
                if stopping {
                    let text = reply.unwrap_or_else(|e| e.to_string());
                    output.write_all(format!("{}\n", text).as_bytes()).await?;
                    output.flush().await?;
                    return Ok(());
                }
                reply
            }
            Err(e) => Err(e),
        };
        let text = match reply {
            Ok(text) => text,
            Err(e) => {
                warn!("Console command rejected: {}", e);
                format!("rejected: {}", e)
            }
        };
        output.write_all(format!("{}\n", text).as_bytes()).await?;
        output.flush().await?;
    }
    debug!("Console input closed");
    Ok(())
}
