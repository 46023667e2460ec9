//! Offline reader for finished sample logs.
//!
//! `#` lines are kept as metadata, the first non-comment line is the header and every other
//! line is one sample. Columns are classified by name prefix (`pt`, `strain`, `V`, `I`, `P`)
//! for the per-quantity summary printed by `tvac_daq read`.

use crate::data::schema::TIMESTAMP_COLUMN;
use crate::error::{AppResult, DaqError};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Physical quantity of a log column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Quantity {
    Temperature,
    Strain,
    Voltage,
    Current,
    Power,
    Other,
}

impl Quantity {
    /// Classify a column by its name.
    pub fn of_column(name: &str) -> Self {
        let numbered = |prefix: char| {
            name.strip_prefix(prefix)
                .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        };
        if name.starts_with("strain") {
            Quantity::Strain
        } else if name.starts_with("pt") {
            Quantity::Temperature
        } else if numbered('V') {
            Quantity::Voltage
        } else if numbered('I') {
            Quantity::Current
        } else if numbered('P') {
            Quantity::Power
        } else {
            Quantity::Other
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "degC",
            Quantity::Strain => "eps",
            Quantity::Voltage => "V",
            Quantity::Current => "A",
            Quantity::Power => "W",
            Quantity::Other => "",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Strain => "strain",
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
            Quantity::Other => "other",
        }
    }
}

/// Summary of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub name: String,
    pub quantity: Quantity,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub last: f64,
}

/// Parsed log file.
#[derive(Debug, Clone, Default)]
pub struct LogTable {
    /// Comment lines without the leading `#`.
    pub comments: Vec<String>,
    /// Header, timestamp first.
    pub columns: Vec<String>,
    /// Timestamps, one per row.
    pub timestamps: Vec<i64>,
    /// Values per row, excluding the timestamp.
    pub rows: Vec<Vec<f64>>,
}

impl LogTable {
    /// Values of a named column.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.columns.iter().skip(1).position(|c| c == name)?;
        Some(self.rows.iter().map(|row| row[index]).collect())
    }

    /// Min, mean, max and last value of every data column, grouped by quantity.
    ///
    /// Empty when the log has no data rows.
    pub fn column_stats(&self) -> Vec<ColumnStats> {
        if self.rows.is_empty() {
            return Vec::new();
        }
        let mut stats: Vec<ColumnStats> = self
            .columns
            .iter()
            .skip(1)
            .enumerate()
            .map(|(index, name)| {
                let values = self.rows.iter().map(|row| row[index]);
                let (min, max, sum) = values.clone().fold(
                    (f64::INFINITY, f64::NEG_INFINITY, 0.0),
                    |(min, max, sum), v| (min.min(v), max.max(v), sum + v),
                );
                ColumnStats {
                    name: name.clone(),
                    quantity: Quantity::of_column(name),
                    min,
                    mean: sum / self.rows.len() as f64,
                    max,
                    last: values.last().unwrap_or(f64::NAN),
                }
            })
            .collect();
        // Stable: column order is kept inside each quantity.
        stats.sort_by_key(|s| s.quantity);
        stats
    }

    /// First and last timestamp.
    pub fn time_span(&self) -> Option<(i64, i64)> {
        Some((*self.timestamps.first()?, *self.timestamps.last()?))
    }
}

/// Read a log file from disk.
pub fn read_log(path: &Path) -> AppResult<LogTable> {
    let file = File::open(path)?;
    read_log_from(BufReader::new(file))
}

/// Read a log from any buffered source.
///
/// # Errors
/// `Parse` for a missing header, a wrong field count or a non-numeric field.
pub fn read_log_from<R: BufRead>(reader: R) -> AppResult<LogTable> {
    let mut table = LogTable::default();
    let mut data = String::new();

    let mut lines = reader.lines();
    for line in lines.by_ref() {
        let line = line?;
        match line.strip_prefix('#') {
            Some(comment) => table.comments.push(comment.to_string()),
            None => {
                data.push_str(&line);
                data.push('\n');
                break;
            }
        }
    }
    for line in lines {
        let line = line?;
        if !line.starts_with('#') {
            data.push_str(&line);
            data.push('\n');
        }
    }

    parse_body(data.as_bytes(), &mut table)?;
    Ok(table)
}

fn parse_body<R: Read>(body: R, table: &mut LogTable) -> AppResult<()> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(body);

    table.columns = reader.headers()?.iter().map(str::to_string).collect();
    if table.columns.first().map(String::as_str) != Some(TIMESTAMP_COLUMN) {
        return Err(DaqError::Parse(format!(
            "Expected '{}' as first column, found {:?}",
            TIMESTAMP_COLUMN,
            table.columns.first()
        )));
    }

    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DaqError::Parse(format!("data line {}: {}", line + 1, e)))?;
        let mut fields = record.iter();
        let timestamp = fields
            .next()
            .unwrap_or_default()
            .parse::<i64>()
            .map_err(|e| DaqError::Parse(format!("data line {} timestamp: {}", line + 1, e)))?;
        let values = fields
            .zip(table.columns.iter().skip(1))
            .map(|(field, column)| {
                field.parse::<f64>().map_err(|e| {
                    DaqError::Parse(format!("data line {} {} = '{}': {}", line + 1, column, field, e))
                })
            })
            .collect::<AppResult<Vec<f64>>>()?;
        table.timestamps.push(timestamp);
        table.rows.push(values);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "#DAQ970A and PSU data\n\
                       #Date: 20240312_101500\n\
                       Timestamp,pt31,strain01,V0,I0,P0\n\
                       100,20.0,1e-6,14.0,0.5,7.0\n\
                       160,22.0,3e-6,14.0,1.0,14.0\n";

    #[test]
    fn comments_header_and_rows() {
        let table = read_log_from(LOG.as_bytes()).unwrap();
        assert_eq!(table.comments[1], "Date: 20240312_101500");
        assert_eq!(table.columns.len(), 6);
        assert_eq!(table.timestamps, vec![100, 160]);
        assert_eq!(table.column("I0").unwrap(), vec![0.5, 1.0]);
        assert_eq!(table.time_span(), Some((100, 160)));
    }

    #[test]
    fn stats_grouped_by_quantity() {
        let table = read_log_from(LOG.as_bytes()).unwrap();
        let stats = table.column_stats();
        let order: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["pt31", "strain01", "V0", "I0", "P0"]);
        let pt = &stats[0];
        assert_eq!(pt.quantity, Quantity::Temperature);
        assert_eq!((pt.min, pt.mean, pt.max, pt.last), (20.0, 21.0, 22.0, 22.0));
    }

    #[test]
    fn column_classification() {
        assert_eq!(Quantity::of_column("pt43"), Quantity::Temperature);
        assert_eq!(Quantity::of_column("P3"), Quantity::Power);
        assert_eq!(Quantity::of_column("Pressure"), Quantity::Other);
        assert_eq!(Quantity::of_column("V12"), Quantity::Voltage);
    }

    #[test]
    fn non_numeric_value_is_reported() {
        let bad = "Timestamp,V0\n100,abc\n";
        let err = read_log_from(bad.as_bytes()).unwrap_err();
        assert!(matches!(err, DaqError::Parse(_)));
    }

    #[test]
    fn missing_timestamp_column_is_rejected() {
        assert!(read_log_from("V0,I0\n1,2\n".as_bytes()).is_err());
    }

    #[test]
    fn header_only_log_has_no_stats() {
        let table = read_log_from("#x\nTimestamp,V0,I0,P0\n".as_bytes()).unwrap();
        assert!(table.rows.is_empty());
        assert!(table.column_stats().is_empty());
    }
}
