//! One poll's worth of readings.

use crate::channel_map::{ChannelMap, Plane};
use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-plane reading sequences, in channel map order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlaneReadings(BTreeMap<Plane, Vec<f64>>);

// A missing plane and an empty plane hold the same readings.
impl PartialEq for PlaneReadings {
    fn eq(&self, other: &Self) -> bool {
        Plane::ALL
            .iter()
            .all(|plane| self.get(*plane) == other.get(*plane))
    }
}

impl PlaneReadings {
    /// Empty sequences for every plane, with capacity reserved for the given sizes.
    pub fn with_sizes(sizes: &BTreeMap<Plane, usize>) -> Self {
        Self(
            Plane::ALL
                .iter()
                .map(|plane| {
                    let capacity = sizes.get(plane).copied().unwrap_or(0);
                    (*plane, Vec::with_capacity(capacity))
                })
                .collect(),
        )
    }

    /// Append a reading to a plane.
    pub fn push(&mut self, plane: Plane, value: f64) {
        self.0.entry(plane).or_default().push(value);
    }

    /// Replace the readings of a plane.
    pub fn set(&mut self, plane: Plane, values: Vec<f64>) {
        self.0.insert(plane, values);
    }

    /// Readings of one plane (empty when the plane has none).
    pub fn get(&self, plane: Plane) -> &[f64] {
        self.0.get(&plane).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate planes in log column order.
    pub fn iter(&self) -> impl Iterator<Item = (Plane, &[f64])> {
        Plane::ALL.into_iter().map(move |plane| (plane, self.get(plane)))
    }
}

/// Voltage, current and power of one power supply output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PsuReading {
    /// Volts.
    pub voltage: f64,
    /// Amperes.
    pub current: f64,
    /// Watts.
    pub power: f64,
}

impl PsuReading {
    /// Reading with power computed as `voltage * current`.
    pub fn from_measured(voltage: f64, current: f64) -> Self {
        Self {
            voltage,
            current,
            power: voltage * current,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Local unix time, whole seconds.
    pub timestamp: i64,
    /// DAQ readings grouped by plane.
    pub planes: PlaneReadings,
    /// PSU outputs, index 0 is the first output.
    pub psu: Vec<PsuReading>,
}

impl Sample {
    /// Sample without any readings yet.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            planes: PlaneReadings::default(),
            psu: Vec::new(),
        }
    }

    /// Readings of one plane.
    pub fn readings(&self, plane: Plane) -> &[f64] {
        self.planes.get(plane)
    }

    /// Check every per-plane length against the channel map and the PSU width.
    ///
    /// # Errors
    /// `FormatMismatch` naming the first group that disagrees. Nothing is truncated or
    /// padded.
    pub fn validate(&self, map: &ChannelMap, psu_channels: usize) -> AppResult<()> {
        for (plane, expected) in map.group_sizes() {
            let actual = self.readings(plane).len();
            if actual != expected {
                return Err(DaqError::FormatMismatch {
                    group: format!("plane {}", plane),
                    expected,
                    actual,
                });
            }
        }
        if self.psu.len() != psu_channels {
            return Err(DaqError::FormatMismatch {
                group: "psu".to_string(),
                expected: psu_channels,
                actual: self.psu.len(),
            });
        }
        Ok(())
    }
}

/// Current local time as whole unix seconds.
pub fn local_timestamp() -> i64 {
    chrono::Local::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_map::ChannelSpec;

    fn small_map() -> ChannelMap {
        ChannelMap::new(vec![
            ChannelSpec::new("201", Plane::U, "pt21"),
            ChannelSpec::new("202", Plane::U, "pt22"),
            ChannelSpec::new("317", Plane::P1s, "pt43"),
        ])
        .unwrap()
    }

    #[test]
    fn valid_sample_passes() {
        let map = small_map();
        let mut sample = Sample::new(100);
        sample.planes = map.regroup(&[20.0, 21.0, 22.0]).unwrap();
        sample.psu.push(PsuReading::from_measured(14.0, 0.5));
        assert!(sample.validate(&map, 1).is_ok());
    }

    #[test]
    fn short_plane_is_a_mismatch() {
        let map = small_map();
        let mut sample = Sample::new(100);
        sample.planes.set(Plane::U, vec![20.0]);
        sample.planes.set(Plane::P1s, vec![22.0]);
        let err = sample.validate(&map, 0).unwrap_err();
        match err {
            DaqError::FormatMismatch {
                group,
                expected,
                actual,
            } => {
                assert_eq!(group, "plane U");
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extra_plane_values_are_a_mismatch() {
        let map = small_map();
        let mut sample = Sample::new(100);
        sample.planes = map.regroup(&[20.0, 21.0, 22.0]).unwrap();
        sample.planes.push(Plane::Strain, 1e-6);
        assert!(sample.validate(&map, 0).is_err());
    }

    #[test]
    fn psu_width_is_checked() {
        let map = ChannelMap::empty();
        let mut sample = Sample::new(100);
        sample.psu.push(PsuReading::from_measured(5.0, 0.2));
        assert!(sample.validate(&map, 2).is_err());
        assert!(sample.validate(&map, 1).is_ok());
    }

    #[test]
    fn computed_power() {
        let reading = PsuReading::from_measured(5.0, 0.2);
        assert!((reading.power - 1.0).abs() < 1e-12);
    }
}
