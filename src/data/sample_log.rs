//! Append-only sample log.
//!
//! File layout:
//!
//! ```text
//! #DAQ970A and PSU data
//! #Date: 20240312_101500
//! #IDN daq970a: Keysight Technologies,DAQ970A,...
//! #Initial Reference temperatures: 58degC < U-plane < 60degC, 58degC < P1S < 60degC
//! Timestamp,pt21,...,V0,I0,P0
//! 1710234900,21.37,...,14.02,0.51,7.1502
//! ```
//!
//! Comment lines come first, then exactly one header line, then one comma-separated line per
//! poll. Every append is flushed, so a crash loses at most the record being written.

use crate::actuator::ThresholdTable;
use crate::data::schema::LogSchema;
use crate::error::{AppResult, DaqError};
use crate::sample::Sample;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `#` comment lines written before the header.
#[derive(Debug, Clone, Default)]
pub struct LogMetadata {
    lines: Vec<String>,
}

impl LogMetadata {
    /// Metadata starting with a title line.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            lines: vec![title.into()],
        }
    }

    /// Add the run date (`YYYYmmdd_HHMMSS`).
    pub fn with_date(mut self, date: impl AsRef<str>) -> Self {
        self.lines.push(format!("Date: {}", date.as_ref()));
        self
    }

    /// Add an instrument identity line.
    pub fn with_identity(mut self, instrument: &str, identity: &str) -> Self {
        self.lines
            .push(format!("IDN {}: {}", instrument, identity.trim()));
        self
    }

    /// Add the thresholds in force when the log was opened.
    pub fn with_thresholds(mut self, thresholds: &ThresholdTable) -> Self {
        if !thresholds.is_empty() {
            let bands = thresholds
                .iter()
                .map(|(group, band)| {
                    format!("{}degC < {} < {}degC", band.low(), group, band.high())
                })
                .collect::<Vec<_>>()
                .join(", ");
            self.lines
                .push(format!("Initial Reference temperatures: {}", bands));
        }
        self
    }

    /// Lines without the leading `#`.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Path of a new log file: `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.txt`.
pub fn log_file_path(dir: &Path, prefix: &str, timestr: &str) -> PathBuf {
    dir.join(format!("{}_{}.txt", prefix, timestr))
}

/// Writer of the delimited sample log.
pub struct SampleLogger<W: Write> {
    writer: csv::Writer<W>,
    schema: LogSchema,
    header_written: bool,
    records: u64,
}

impl SampleLogger<File> {
    /// Create the log file (and its directory) and write the metadata comments.
    pub fn create(path: &Path, schema: LogSchema, metadata: &LogMetadata) -> AppResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let file = File::create(path)?;
        info!("Sample log opened at '{}'", path.display());

        let mut logger = Self::new(file, schema);
        logger.write_metadata(metadata)?;
        Ok(logger)
    }
}

impl<W: Write> SampleLogger<W> {
    /// Wrap any writer.
    pub fn new(inner: W, schema: LogSchema) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);
        Self {
            writer,
            schema,
            header_written: false,
            records: 0,
        }
    }

    /// Number of data lines appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Write `#` comment lines. Only allowed before the header.
    pub fn write_metadata(&mut self, metadata: &LogMetadata) -> AppResult<()> {
        if self.header_written {
            return Err(DaqError::Configuration(
                "Metadata must precede the header line".to_string(),
            ));
        }
        self.writer.flush()?;
        let inner = self.writer.get_mut();
        for line in metadata.lines() {
            writeln!(inner, "#{}", line)?;
        }
        inner.flush()?;
        Ok(())
    }

    /// Write the header line once.
    pub fn write_header(&mut self) -> AppResult<()> {
        if self.header_written {
            return Err(DaqError::Configuration(
                "Log header already written".to_string(),
            ));
        }
        self.writer.write_record(self.schema.columns())?;
        self.writer.flush()?;
        self.header_written = true;
        debug!(columns = self.schema.columns().len(), "Log header written");
        Ok(())
    }

    /// Append one data line and flush it.
    ///
    /// # Errors
    /// `FormatMismatch` (nothing written) if the sample does not fit the schema.
    pub fn append(&mut self, sample: &Sample) -> AppResult<()> {
        if !self.header_written {
            return Err(DaqError::Configuration(
                "Log header must be written before data".to_string(),
            ));
        }
        let record = self.schema.record(sample)?;
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        self.records += 1;
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub fn finish(mut self) -> AppResult<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| DaqError::Io(e.into_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::Thresholds;
    use crate::channel_map::ChannelMap;
    use crate::sample::PsuReading;

    fn psu_sample(ts: i64, v: f64, i: f64, p: f64) -> Sample {
        let mut sample = Sample::new(ts);
        sample.psu.push(PsuReading {
            voltage: v,
            current: i,
            power: p,
        });
        sample
    }

    fn text(logger: SampleLogger<Vec<u8>>) -> String {
        String::from_utf8(logger.finish().unwrap()).unwrap()
    }

    #[test]
    fn header_then_line() {
        let mut logger = SampleLogger::new(Vec::new(), LogSchema::new(&ChannelMap::empty(), 1));
        logger.write_header().unwrap();
        logger.append(&psu_sample(100, 5.0, 0.2, 1.0)).unwrap();
        assert_eq!(logger.records(), 1);
        assert_eq!(text(logger), "Timestamp,V0,I0,P0\n100,5.0,0.2,1.0\n");
    }

    #[test]
    fn metadata_precedes_header() {
        let mut thresholds = ThresholdTable::default();
        thresholds.insert("U-plane", Thresholds::new(58.0, 60.0).unwrap());
        let metadata = LogMetadata::new("DAQ970A and PSU data")
            .with_date("20240312_101500")
            .with_identity("psu", "ROHDE&SCHWARZ,HMP4040,123,1.0\n")
            .with_thresholds(&thresholds);

        let mut logger = SampleLogger::new(Vec::new(), LogSchema::new(&ChannelMap::empty(), 1));
        logger.write_metadata(&metadata).unwrap();
        logger.write_header().unwrap();
        let out = text(logger);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#DAQ970A and PSU data");
        assert_eq!(lines[1], "#Date: 20240312_101500");
        assert_eq!(lines[2], "#IDN psu: ROHDE&SCHWARZ,HMP4040,123,1.0");
        assert_eq!(
            lines[3],
            "#Initial Reference temperatures: 58degC < U-plane < 60degC"
        );
        assert_eq!(lines[4], "Timestamp,V0,I0,P0");
    }

    #[test]
    fn header_only_once() {
        let mut logger = SampleLogger::new(Vec::new(), LogSchema::new(&ChannelMap::empty(), 1));
        logger.write_header().unwrap();
        assert!(logger.write_header().is_err());
        assert!(logger.write_metadata(&LogMetadata::new("late")).is_err());
    }

    #[test]
    fn append_requires_header() {
        let mut logger = SampleLogger::new(Vec::new(), LogSchema::new(&ChannelMap::empty(), 1));
        assert!(logger.append(&psu_sample(1, 1.0, 1.0, 1.0)).is_err());
    }

    #[test]
    fn misaligned_sample_writes_nothing() {
        let mut logger = SampleLogger::new(Vec::new(), LogSchema::new(&ChannelMap::empty(), 2));
        logger.write_header().unwrap();
        let err = logger.append(&psu_sample(1, 1.0, 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, DaqError::FormatMismatch { .. }));
        assert_eq!(logger.records(), 0);
        assert_eq!(text(logger), "Timestamp,V0,I0,P0,V1,I1,P1\n");
    }

    #[test]
    fn file_is_flushed_after_each_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_file_path(&dir.path().join("log"), "temp_plotter", "20240312_101500");
        let mut logger = SampleLogger::create(
            &path,
            LogSchema::new(&ChannelMap::empty(), 1),
            &LogMetadata::new("PSU data"),
        )
        .unwrap();
        logger.write_header().unwrap();
        logger.append(&psu_sample(100, 5.0, 0.2, 1.0)).unwrap();

        // Still open: the line must already be on disk.
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.ends_with("100,5.0,0.2,1.0\n"));
        assert!(path.ends_with("log/temp_plotter_20240312_101500.txt"));
    }
}
