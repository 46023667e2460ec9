//! Log column schema.
//!
//! Header writing and data writing both go through [`LogSchema`], so the column order of
//! every data line is the one announced by the header. Order: `Timestamp`, the sensors of
//! planes U, Y, EXT, P1S and STRAIN (channel map order inside each plane), then a
//! `V{i},I{i},P{i}` triple per PSU output.

use crate::channel_map::{ChannelMap, Plane};
use crate::error::{AppResult, DaqError};
use crate::sample::{PsuReading, Sample};

/// Name of the first column.
pub const TIMESTAMP_COLUMN: &str = "Timestamp";

/// Format a reading with the shortest text that parses back to the same value.
///
/// Whole numbers keep a trailing `.0` (`5.0`), tiny values use exponents (`1e-7`).
pub fn format_value(value: f64) -> String {
    format!("{:?}", value)
}

/// Column order of a log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSchema {
    columns: Vec<String>,
    plane_sizes: Vec<(Plane, usize)>,
    psu_channels: usize,
}

impl LogSchema {
    /// Derive the schema from the channel map and the PSU width.
    pub fn new(map: &ChannelMap, psu_channels: usize) -> Self {
        let mut columns = Vec::with_capacity(1 + map.len() + 3 * psu_channels);
        columns.push(TIMESTAMP_COLUMN.to_string());
        columns.extend(map.column_names());
        for channel in 0..psu_channels {
            columns.push(format!("V{}", channel));
            columns.push(format!("I{}", channel));
            columns.push(format!("P{}", channel));
        }

        let plane_sizes = Plane::ALL
            .iter()
            .map(|plane| (*plane, map.group_size(*plane)))
            .collect();

        Self {
            columns,
            plane_sizes,
            psu_channels,
        }
    }

    /// Column names, timestamp first.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of PSU outputs covered.
    pub fn psu_channels(&self) -> usize {
        self.psu_channels
    }

    /// Expected number of readings per plane.
    pub fn plane_size(&self, plane: Plane) -> usize {
        self.plane_sizes
            .iter()
            .find(|(p, _)| *p == plane)
            .map(|(_, size)| *size)
            .unwrap_or(0)
    }

    fn check(&self, sample: &Sample) -> AppResult<()> {
        for (plane, expected) in &self.plane_sizes {
            let actual = sample.readings(*plane).len();
            if actual != *expected {
                return Err(DaqError::FormatMismatch {
                    group: format!("plane {}", plane),
                    expected: *expected,
                    actual,
                });
            }
        }
        if sample.psu.len() != self.psu_channels {
            return Err(DaqError::FormatMismatch {
                group: "psu".to_string(),
                expected: self.psu_channels,
                actual: sample.psu.len(),
            });
        }
        Ok(())
    }

    /// Fields of the data line for `sample`, in column order.
    ///
    /// # Errors
    /// `FormatMismatch` if the sample does not fit the schema.
    pub fn record(&self, sample: &Sample) -> AppResult<Vec<String>> {
        self.check(sample)?;

        let mut fields = Vec::with_capacity(self.columns.len());
        fields.push(sample.timestamp.to_string());
        for (plane, _) in &self.plane_sizes {
            fields.extend(sample.readings(*plane).iter().copied().map(format_value));
        }
        for reading in &sample.psu {
            fields.push(format_value(reading.voltage));
            fields.push(format_value(reading.current));
            fields.push(format_value(reading.power));
        }
        Ok(fields)
    }

    /// Rebuild a sample from the fields of a data line.
    ///
    /// # Errors
    /// `FormatMismatch` for a wrong field count, `Parse` for a non-numeric field.
    pub fn parse_record<S: AsRef<str>>(&self, fields: &[S]) -> AppResult<Sample> {
        if fields.len() != self.columns.len() {
            return Err(DaqError::FormatMismatch {
                group: "record".to_string(),
                expected: self.columns.len(),
                actual: fields.len(),
            });
        }

        let timestamp = fields[0].as_ref().trim().parse::<i64>().map_err(|e| {
            DaqError::Parse(format!("timestamp '{}': {}", fields[0].as_ref(), e))
        })?;
        let values = fields[1..]
            .iter()
            .zip(&self.columns[1..])
            .map(|(field, column)| {
                field.as_ref().trim().parse::<f64>().map_err(|e| {
                    DaqError::Parse(format!("{} = '{}': {}", column, field.as_ref(), e))
                })
            })
            .collect::<AppResult<Vec<f64>>>()?;

        let mut sample = Sample::new(timestamp);
        let mut offset = 0;
        for (plane, size) in &self.plane_sizes {
            sample
                .planes
                .set(*plane, values[offset..offset + size].to_vec());
            offset += size;
        }
        sample.psu = values[offset..]
            .chunks_exact(3)
            .map(|triple| PsuReading {
                voltage: triple[0],
                current: triple[1],
                power: triple[2],
            })
            .collect();
        Ok(sample)
    }
}
