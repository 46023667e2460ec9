//! Hysteresis heater control.
//!
//! Each heater group drives a set of PSU outputs from the mean of a few reference sensors.
//! The controller only changes state at the band edges:
//!
//! ```text
//! t >= high        -> Off
//! t <= low         -> On
//! low < t < high   -> unchanged
//! ```
//!
//! Thresholds live outside the actuator in a [`ThresholdTable`] that is passed into every
//! evaluation, so an operator can edit them while the loop runs.

use crate::channel_map::{ChannelId, ChannelMap, Plane};
use crate::error::{AppResult, DaqError};
use crate::sample::Sample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Commanded state of a heater group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeaterState {
    /// Outputs off. Safe state at startup.
    #[default]
    Off,
    /// Outputs on.
    On,
}

impl HeaterState {
    /// True for [`HeaterState::On`].
    pub fn is_on(&self) -> bool {
        matches!(self, HeaterState::On)
    }
}

impl fmt::Display for HeaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeaterState::Off => "OFF",
            HeaterState::On => "ON",
        })
    }
}

/// Validated `(low, high)` band, `low < high`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    low: f64,
    high: f64,
}

impl Thresholds {
    /// # Errors
    /// `Configuration` unless both bounds are finite and `low < high`.
    pub fn new(low: f64, high: f64) -> AppResult<Self> {
        if !low.is_finite() || !high.is_finite() {
            return Err(DaqError::Configuration(format!(
                "Thresholds must be finite (low = {}, high = {})",
                low, high
            )));
        }
        if low >= high {
            return Err(DaqError::Configuration(format!(
                "Low threshold {} must be below high threshold {}",
                low, high
            )));
        }
        Ok(Self { low, high })
    }

    /// Lower bound, degC. At or below it the heaters switch on.
    pub fn low(&self) -> f64 {
        self.low
    }

    /// Upper bound, degC. At or above it the heaters switch off.
    pub fn high(&self) -> f64 {
        self.high
    }

    /// Same band with a new lower bound.
    pub fn with_low(&self, low: f64) -> AppResult<Self> {
        Self::new(low, self.high)
    }

    /// Same band with a new upper bound.
    pub fn with_high(&self, high: f64) -> AppResult<Self> {
        Self::new(self.low, high)
    }
}

/// One side of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    /// `low`, `lo`
    Low,
    /// `high`, `hi`
    High,
}

impl FromStr for Bound {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "lo" => Ok(Bound::Low),
            "high" | "hi" => Ok(Bound::High),
            other => Err(DaqError::Parse(format!(
                "Unknown bound '{}', expected 'low' or 'high'",
                other
            ))),
        }
    }
}

/// Next state of a heater group. Pure: equal inputs give equal outputs.
pub fn transition(state: HeaterState, temperature: f64, thresholds: &Thresholds) -> HeaterState {
    if temperature >= thresholds.high {
        HeaterState::Off
    } else if temperature <= thresholds.low {
        HeaterState::On
    } else {
        state
    }
}

/// Thresholds per heater group, keyed by group name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdTable(BTreeMap<String, Thresholds>);

impl ThresholdTable {
    /// Set the band of a group, replacing any previous one.
    pub fn insert(&mut self, group: impl Into<String>, thresholds: Thresholds) {
        self.0.insert(group.into(), thresholds);
    }

    /// Band of a group.
    pub fn get(&self, group: &str) -> Option<&Thresholds> {
        self.0.get(group)
    }

    /// Groups and bands, ordered by group name.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Thresholds)> {
        self.0.iter()
    }

    /// True when no group has a band.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply an operator edit given as text.
    ///
    /// On any error the table is left exactly as it was.
    ///
    /// # Errors
    /// `Parse` for a non-numeric value, `Configuration` for an unknown group or a value that
    /// would break `low < high`.
    pub fn set_bound(&mut self, group: &str, bound: Bound, text: &str) -> AppResult<Thresholds> {
        let current = self.0.get(group).copied().ok_or_else(|| {
            DaqError::Configuration(format!("Unknown heater group '{}'", group))
        })?;
        let value = text
            .trim()
            .parse::<f64>()
            .map_err(|e| DaqError::Parse(format!("threshold '{}': {}", text.trim(), e)))?;
        let updated = match bound {
            Bound::Low => current.with_low(value)?,
            Bound::High => current.with_high(value)?,
        };
        self.0.insert(group.to_string(), updated);
        info!(group, low = updated.low, high = updated.high, "Thresholds updated");
        Ok(updated)
    }
}

/// Heater group bound to its reference sensors.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterGroup {
    name: String,
    references: Vec<(Plane, usize)>,
    outputs: Vec<u8>,
}

impl HeaterGroup {
    /// Resolve reference sensors against the channel map.
    ///
    /// # Errors
    /// `Configuration` for an empty reference set, an unknown channel, a strain gauge used
    /// as reference, or an empty output list.
    pub fn resolve(
        name: &str,
        reference_channels: &[ChannelId],
        outputs: Vec<u8>,
        map: &ChannelMap,
    ) -> AppResult<Self> {
        if reference_channels.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Heater group '{}' has no reference sensors",
                name
            )));
        }
        if outputs.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Heater group '{}' drives no outputs",
                name
            )));
        }
        let references = reference_channels
            .iter()
            .map(|id| {
                let (plane, index) = map.locate(id).ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "Heater group '{}' references unknown channel {}",
                        name, id
                    ))
                })?;
                if !plane.is_temperature() {
                    return Err(DaqError::Configuration(format!(
                        "Heater group '{}' references {} which is not a temperature sensor",
                        name, id
                    )));
                }
                Ok((plane, index))
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            references,
            outputs,
        })
    }

    /// Group name, also the key into the [`ThresholdTable`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// PSU output numbers (1-based) switched by this group.
    pub fn outputs(&self) -> &[u8] {
        &self.outputs
    }

    /// Mean of the reference sensors in `sample`.
    ///
    /// # Errors
    /// `FormatMismatch` if the sample lacks a reference position.
    pub fn reference_temperature(&self, sample: &Sample) -> AppResult<f64> {
        let mut sum = 0.0;
        for (plane, index) in &self.references {
            let readings = sample.readings(*plane);
            let value = readings.get(*index).ok_or_else(|| DaqError::FormatMismatch {
                group: format!("plane {}", plane),
                expected: index + 1,
                actual: readings.len(),
            })?;
            sum += value;
        }
        Ok(sum / self.references.len() as f64)
    }
}

/// Output switching decided for one group in one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationCommand {
    /// Heater group name.
    pub group: String,
    /// PSU outputs (1-based) to switch.
    pub outputs: Vec<u8>,
    /// State to drive the outputs to.
    pub state: HeaterState,
    /// Reference temperature the decision was based on.
    pub reference: f64,
    /// True when the state differs from the previous evaluation.
    pub changed: bool,
}

/// Hysteresis memory of every heater group.
#[derive(Debug, Clone)]
pub struct ThresholdActuator {
    groups: Vec<HeaterGroup>,
    states: Vec<HeaterState>,
}

impl ThresholdActuator {
    /// Every group starts [`HeaterState::Off`].
    pub fn new(groups: Vec<HeaterGroup>) -> Self {
        let states = vec![HeaterState::Off; groups.len()];
        Self { groups, states }
    }

    /// Groups in evaluation order.
    pub fn groups(&self) -> &[HeaterGroup] {
        &self.groups
    }

    /// Decide the state of every group for `sample`.
    ///
    /// A command is returned for every group on every call, changed or not. States are
    /// only updated once every group has been evaluated, so an error leaves all of them
    /// as they were.
    ///
    /// # Errors
    /// `Configuration` if a group has no thresholds, `FormatMismatch` if a reference
    /// reading is missing.
    pub fn evaluate(
        &mut self,
        sample: &Sample,
        thresholds: &ThresholdTable,
    ) -> AppResult<Vec<ActuationCommand>> {
        let mut commands = Vec::with_capacity(self.groups.len());
        for (group, previous) in self.groups.iter().zip(&self.states) {
            let band = thresholds.get(&group.name).ok_or_else(|| {
                DaqError::Configuration(format!("No thresholds for heater group '{}'", group.name))
            })?;
            let reference = group.reference_temperature(sample)?;
            let state = transition(*previous, reference, band);
            debug!(
                group = %group.name,
                reference,
                low = band.low,
                high = band.high,
                previous = %previous,
                state = %state,
                "Heater evaluated"
            );
            commands.push(ActuationCommand {
                group: group.name.clone(),
                outputs: group.outputs.clone(),
                state,
                reference,
                changed: state != *previous,
            });
        }

        for (state, command) in self.states.iter_mut().zip(&commands) {
            *state = command.state;
        }
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_map::ChannelSpec;

    fn band() -> Thresholds {
        Thresholds::new(58.0, 60.0).unwrap()
    }

    #[test]
    fn hysteresis_sequence() {
        let mut state = HeaterState::Off;
        let observed: Vec<HeaterState> = [55.0, 59.0, 61.0, 59.0, 57.0]
            .into_iter()
            .map(|t| {
                state = transition(state, t, &band());
                state
            })
            .collect();
        use HeaterState::{Off, On};
        assert_eq!(observed, vec![On, On, Off, Off, On]);
    }

    #[test]
    fn band_edges_switch() {
        assert_eq!(transition(HeaterState::On, 60.0, &band()), HeaterState::Off);
        assert_eq!(transition(HeaterState::Off, 58.0, &band()), HeaterState::On);
    }

    #[test]
    fn transition_is_idempotent() {
        for state in [HeaterState::Off, HeaterState::On] {
            for t in [50.0, 58.0, 59.0, 60.0, 70.0] {
                let once = transition(state, t, &band());
                assert_eq!(once, transition(state, t, &band()));
                assert_eq!(once, transition(once, t, &band()));
            }
        }
    }

    #[test]
    fn inverted_or_degenerate_band_is_rejected() {
        assert!(Thresholds::new(60.0, 58.0).is_err());
        assert!(Thresholds::new(60.0, 60.0).is_err());
        assert!(Thresholds::new(f64::NAN, 60.0).is_err());
        assert!(band().with_low(61.0).is_err());
    }

    #[test]
    fn bad_edit_keeps_previous_value() {
        let mut table = ThresholdTable::default();
        table.insert("U-plane", band());

        let err = table.set_bound("U-plane", Bound::Low, "fifty").unwrap_err();
        assert!(matches!(err, DaqError::Parse(_)));
        let err = table.set_bound("U-plane", Bound::High, "10").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(table.get("U-plane"), Some(&band()));

        let updated = table.set_bound("U-plane", Bound::High, " 62.5 ").unwrap();
        assert_eq!(updated.high(), 62.5);
        assert!(table.set_bound("Y-plane", Bound::High, "1").is_err());
    }

    fn map() -> ChannelMap {
        ChannelMap::new(vec![
            ChannelSpec::new("211", Plane::U, "pt31"),
            ChannelSpec::new("212", Plane::U, "pt32"),
            ChannelSpec::new("213", Plane::U, "pt33"),
            ChannelSpec::new("301", Plane::Strain, "strain01"),
        ])
        .unwrap()
    }

    fn u_plane() -> HeaterGroup {
        HeaterGroup::resolve("U-plane", &["211".into(), "213".into()], vec![1, 2], &map()).unwrap()
    }

    fn sample(u: [f64; 3]) -> Sample {
        let mut sample = Sample::new(0);
        sample.planes = map().regroup(&[u[0], u[1], u[2], 1e-6]).unwrap();
        sample
    }

    #[test]
    fn reference_is_mean_of_subset() {
        let t = u_plane().reference_temperature(&sample([50.0, 99.0, 54.0])).unwrap();
        assert_eq!(t, 52.0);
    }

    #[test]
    fn unknown_or_strain_reference_is_rejected() {
        assert!(HeaterGroup::resolve("x", &["206".into()], vec![1], &map()).is_err());
        assert!(HeaterGroup::resolve("x", &["301".into()], vec![1], &map()).is_err());
        assert!(HeaterGroup::resolve("x", &[], vec![1], &map()).is_err());
    }

    #[test]
    fn commands_emitted_every_evaluation() {
        let mut actuator = ThresholdActuator::new(vec![u_plane()]);
        let mut table = ThresholdTable::default();
        table.insert("U-plane", band());

        let first = actuator.evaluate(&sample([55.0, 0.0, 55.0]), &table).unwrap();
        assert_eq!(first[0].state, HeaterState::On);
        assert!(first[0].changed);
        assert_eq!(first[0].outputs, vec![1, 2]);

        let second = actuator.evaluate(&sample([59.0, 0.0, 59.0]), &table).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].state, HeaterState::On);
        assert!(!second[0].changed);
    }

    #[test]
    fn missing_thresholds_leave_state_untouched() {
        let mut actuator = ThresholdActuator::new(vec![u_plane()]);
        let table = ThresholdTable::default();
        assert!(actuator.evaluate(&sample([55.0, 0.0, 55.0]), &table).is_err());

        // Inside the band the previous state is kept, so this shows it is still Off.
        let mut table = ThresholdTable::default();
        table.insert("U-plane", band());
        let commands = actuator.evaluate(&sample([59.0, 0.0, 59.0]), &table).unwrap();
        assert_eq!(commands[0].state, HeaterState::Off);
        assert!(!commands[0].changed);
    }
}
