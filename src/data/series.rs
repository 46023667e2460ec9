//! Bounded sliding windows behind the live plots.
//!
//! Each plotted quantity owns a [`SeriesBuffer`] of `(timestamp, value)` pairs. Once the
//! buffer holds `capacity` points, every push evicts the oldest one, so a plot always shows
//! the most recent window in insertion order. The [`LiveSeriesStore`] groups the buffers per
//! plot (one per plane plus PSU voltage, current and power) and is fed one sample per tick.

use crate::channel_map::{ChannelMap, Plane};
use crate::error::{AppResult, DaqError};
use crate::sample::Sample;
use std::collections::VecDeque;
use std::fmt;

/// Default window length in points.
pub const DEFAULT_CAPACITY: usize = 120;

/// Fixed-capacity window of `(timestamp, value)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBuffer {
    capacity: usize,
    points: VecDeque<(i64, f64)>,
}

impl SeriesBuffer {
    /// Empty window.
    ///
    /// # Errors
    /// `Configuration` for a zero capacity.
    pub fn new(capacity: usize) -> AppResult<Self> {
        if capacity == 0 {
            return Err(DaqError::Configuration(
                "Series capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            points: VecDeque::with_capacity(capacity),
        })
    }

    /// Append a point, evicting the oldest once full.
    pub fn push(&mut self, timestamp: i64, value: f64) {
        while self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back((timestamp, value));
    }

    /// Points oldest first.
    pub fn render(&self) -> Vec<(i64, f64)> {
        self.points.iter().copied().collect()
    }

    /// Most recent point.
    pub fn latest(&self) -> Option<(i64, f64)> {
        self.points.back().copied()
    }

    /// Points held, at most the capacity.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Quantity group shown in one plot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlotGroup {
    /// Sensors of one plane.
    Plane(Plane),
    /// Output voltages.
    PsuVoltage,
    /// Output currents.
    PsuCurrent,
    /// Output powers.
    PsuPower,
}

impl PlotGroup {
    /// Y axis unit.
    pub fn unit(&self) -> &'static str {
        match self {
            PlotGroup::Plane(plane) => plane.unit(),
            PlotGroup::PsuVoltage => "V",
            PlotGroup::PsuCurrent => "A",
            PlotGroup::PsuPower => "W",
        }
    }
}

impl fmt::Display for PlotGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlotGroup::Plane(Plane::Strain) => f.write_str("Strain"),
            PlotGroup::Plane(plane) => write!(f, "{} plane", plane),
            PlotGroup::PsuVoltage => f.write_str("PSU voltage"),
            PlotGroup::PsuCurrent => f.write_str("PSU current"),
            PlotGroup::PsuPower => f.write_str("PSU power"),
        }
    }
}

/// Named series of one plot.
#[derive(Debug, Clone)]
pub struct Plot {
    group: PlotGroup,
    series: Vec<(String, SeriesBuffer)>,
}

impl Plot {
    pub fn group(&self) -> PlotGroup {
        self.group
    }

    /// Series in legend order.
    pub fn series(&self) -> impl Iterator<Item = (&str, &SeriesBuffer)> {
        self.series
            .iter()
            .map(|(name, buffer)| (name.as_str(), buffer))
    }
}

/// All plot windows of a run.
#[derive(Debug, Clone)]
pub struct LiveSeriesStore {
    plots: Vec<Plot>,
}

impl LiveSeriesStore {
    /// One plot per non-empty plane, plus voltage, current and power plots when
    /// `psu_channels > 0`.
    pub fn new(map: &ChannelMap, psu_channels: usize, capacity: usize) -> AppResult<Self> {
        let mut plots = Vec::new();

        for plane in Plane::ALL {
            let names = map
                .plane_order(plane)
                .iter()
                .filter_map(|id| map.resolve(id).map(|(_, name)| name.to_string()))
                .collect::<Vec<_>>();
            if names.is_empty() {
                continue;
            }
            plots.push(Self::plot(PlotGroup::Plane(plane), names, capacity)?);
        }

        if psu_channels > 0 {
            for (group, prefix) in [
                (PlotGroup::PsuVoltage, "V"),
                (PlotGroup::PsuCurrent, "I"),
                (PlotGroup::PsuPower, "P"),
            ] {
                let names = (0..psu_channels).map(|i| format!("{}{}", prefix, i)).collect();
                plots.push(Self::plot(group, names, capacity)?);
            }
        }

        Ok(Self { plots })
    }

    fn plot(group: PlotGroup, names: Vec<String>, capacity: usize) -> AppResult<Plot> {
        let series = names
            .into_iter()
            .map(|name| Ok((name, SeriesBuffer::new(capacity)?)))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Plot { group, series })
    }

    fn values(sample: &Sample, group: PlotGroup) -> Vec<f64> {
        match group {
            PlotGroup::Plane(plane) => sample.readings(plane).to_vec(),
            PlotGroup::PsuVoltage => sample.psu.iter().map(|r| r.voltage).collect(),
            PlotGroup::PsuCurrent => sample.psu.iter().map(|r| r.current).collect(),
            PlotGroup::PsuPower => sample.psu.iter().map(|r| r.power).collect(),
        }
    }

    /// Push every quantity of `sample` into its window.
    ///
    /// # Errors
    /// `FormatMismatch` if any group has the wrong number of values. No buffer is touched
    /// in that case.
    pub fn ingest(&mut self, sample: &Sample) -> AppResult<()> {
        let mut columns = Vec::with_capacity(self.plots.len());
        for plot in &self.plots {
            let values = Self::values(sample, plot.group);
            if values.len() != plot.series.len() {
                return Err(DaqError::FormatMismatch {
                    group: plot.group.to_string(),
                    expected: plot.series.len(),
                    actual: values.len(),
                });
            }
            columns.push(values);
        }

        for (plot, values) in self.plots.iter_mut().zip(columns) {
            for ((_, buffer), value) in plot.series.iter_mut().zip(values) {
                buffer.push(sample.timestamp, value);
            }
        }
        Ok(())
    }

    pub fn plots(&self) -> &[Plot] {
        &self.plots
    }

    /// Window of one named quantity (`pt33`, `V0`, ...).
    pub fn series(&self, name: &str) -> Option<&SeriesBuffer> {
        self.plots
            .iter()
            .flat_map(|plot| plot.series.iter())
            .find(|(series_name, _)| series_name == name)
            .map(|(_, buffer)| buffer)
    }
}
