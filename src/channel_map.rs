//! Static channel table of the acquisition unit.
//!
//! The DAQ970A returns one flat vector per scan, in the order of its `ROUT:SCAN` list. The
//! [`ChannelMap`] relates every position of that vector to a physical channel address, a
//! sensor name and the [`Plane`] the sensor belongs to, so that a flat scan can be
//! redistributed into per-plane sequences.
//!
//! The map is validated once at construction. A channel listed twice, or a plane/size
//! mismatch discovered later at poll time, would silently shift every reading after it in
//! the log and in the plots, so both are rejected eagerly.

use crate::error::{AppResult, DaqError};
use crate::sample::PlaneReadings;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Named group of sensors reported and thresholded together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Plane {
    /// U plane temperatures.
    #[serde(rename = "u", alias = "U")]
    U,
    /// Y plane temperatures.
    #[serde(rename = "y", alias = "Y")]
    Y,
    /// External reference temperatures.
    #[serde(rename = "ext", alias = "EXT")]
    Ext,
    /// P1S temperatures.
    #[serde(rename = "p1s", alias = "P1S")]
    P1s,
    /// Strain gauges.
    #[serde(rename = "strain", alias = "STRAIN")]
    Strain,
}

impl Plane {
    /// All planes in log column order.
    pub const ALL: [Plane; 5] = [Plane::U, Plane::Y, Plane::Ext, Plane::P1s, Plane::Strain];

    /// Label used in logs and plot titles.
    pub fn as_str(&self) -> &'static str {
        match self {
            Plane::U => "U",
            Plane::Y => "Y",
            Plane::Ext => "EXT",
            Plane::P1s => "P1S",
            Plane::Strain => "STRAIN",
        }
    }

    /// Measurement unit of every sensor in the plane.
    pub fn unit(&self) -> &'static str {
        match self {
            Plane::Strain => "eps",
            _ => "degC",
        }
    }

    /// True for RTD planes, false for strain.
    pub fn is_temperature(&self) -> bool {
        !matches!(self, Plane::Strain)
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plane {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "u" => Ok(Plane::U),
            "y" => Ok(Plane::Y),
            "ext" => Ok(Plane::Ext),
            "p1s" => Ok(Plane::P1s),
            "strain" => Ok(Plane::Strain),
            other => Err(DaqError::Configuration(format!(
                "Unknown plane '{}'. Must be one of: u, y, ext, p1s, strain",
                other
            ))),
        }
    }
}

/// Instrument channel address, e.g. `"201"` (slot 2, channel 01).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap an address string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One row of the channel table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Instrument address.
    pub id: ChannelId,
    /// Group the sensor is reported in.
    pub plane: Plane,
    /// Sensor name used as log column and plot legend.
    pub name: String,
}

impl ChannelSpec {
    /// Build a row.
    pub fn new(id: impl Into<String>, plane: Plane, name: impl Into<String>) -> Self {
        Self {
            id: ChannelId::new(id),
            plane,
            name: name.into(),
        }
    }
}

/// Sensor wiring of the QLCS TVAC campaign, in `ROUT:SCAN` order.
const QLCS_TVAC_TABLE: &[(&str, Plane, &str)] = &[
    ("101", Plane::Y, "pt01"),
    ("102", Plane::Y, "pt02"),
    ("103", Plane::Y, "pt03"),
    ("104", Plane::Y, "pt04"),
    ("105", Plane::Ext, "pt05"),
    ("106", Plane::Y, "pt06"),
    ("107", Plane::Y, "pt07"),
    ("108", Plane::Y, "pt08"),
    ("109", Plane::Y, "pt09"),
    ("110", Plane::Y, "pt10"),
    ("111", Plane::Y, "pt11"),
    ("112", Plane::Y, "pt12"),
    ("113", Plane::Y, "pt13"),
    ("114", Plane::Y, "pt14"),
    ("115", Plane::Y, "pt15"),
    ("116", Plane::Y, "pt16"),
    ("117", Plane::Y, "pt17"),
    ("118", Plane::Y, "pt18"),
    ("119", Plane::Y, "pt19"),
    ("120", Plane::Y, "pt20"),
    ("201", Plane::U, "pt21"),
    ("202", Plane::U, "pt22"),
    ("203", Plane::U, "pt23"),
    ("204", Plane::U, "pt24"),
    ("205", Plane::U, "pt25"),
    // 206 (pt26) is not wired.
    ("207", Plane::U, "pt27"),
    ("208", Plane::U, "pt28"),
    ("209", Plane::U, "pt29"),
    ("210", Plane::Ext, "pt30"),
    ("211", Plane::U, "pt31"),
    ("212", Plane::U, "pt32"),
    ("213", Plane::U, "pt33"),
    ("214", Plane::U, "pt34"),
    ("215", Plane::U, "pt35"),
    ("216", Plane::U, "pt36"),
    ("217", Plane::U, "pt37"),
    ("218", Plane::Ext, "pt38"),
    ("219", Plane::U, "pt39"),
    ("220", Plane::Ext, "pt40"),
    ("301", Plane::Strain, "strain01"),
    ("302", Plane::Strain, "strain02"),
    ("303", Plane::Strain, "strain03"),
    ("304", Plane::Strain, "strain04"),
    ("305", Plane::Strain, "strain05"),
    ("306", Plane::Strain, "strain06"),
    ("307", Plane::Strain, "strain07"),
    ("308", Plane::Strain, "strain08"),
    ("309", Plane::Strain, "strain09"),
    ("311", Plane::Strain, "strain10"),
    ("312", Plane::Strain, "strain11"),
    ("313", Plane::Strain, "strain12"),
    ("314", Plane::Strain, "strain13"),
    ("315", Plane::Ext, "pt41"),
    ("316", Plane::Ext, "pt42"),
    ("317", Plane::P1s, "pt43"),
    ("318", Plane::P1s, "pt44"),
    ("319", Plane::P1s, "pt45"),
];

/// Rows of the built-in QLCS TVAC channel table.
pub fn qlcs_tvac_channels() -> Vec<ChannelSpec> {
    QLCS_TVAC_TABLE
        .iter()
        .map(|(id, plane, name)| ChannelSpec::new(*id, *plane, *name))
        .collect()
}

#[derive(Debug, Clone)]
struct Slot {
    plane: Plane,
    name: String,
    /// Position of the channel inside its plane.
    index: usize,
}

/// Validated, read-only channel table.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    scan_order: Vec<ChannelId>,
    slots: HashMap<ChannelId, Slot>,
    planes: BTreeMap<Plane, Vec<ChannelId>>,
}

impl ChannelMap {
    /// Build a map whose scan order is the order of `specs`.
    ///
    /// # Errors
    /// `Configuration` if a channel appears twice or a sensor name is empty.
    pub fn new(specs: Vec<ChannelSpec>) -> AppResult<Self> {
        let mut scan_order = Vec::with_capacity(specs.len());
        let mut slots: HashMap<ChannelId, Slot> = HashMap::with_capacity(specs.len());
        let mut planes: BTreeMap<Plane, Vec<ChannelId>> =
            Plane::ALL.iter().map(|plane| (*plane, Vec::new())).collect();
        let mut names: HashSet<String> = HashSet::new();

        for spec in specs {
            if spec.id.as_str().trim().is_empty() {
                return Err(DaqError::Configuration("Empty channel id".to_string()));
            }
            if spec.name.trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Channel {} has an empty sensor name",
                    spec.id
                )));
            }
            if let Some(existing) = slots.get(&spec.id) {
                return Err(DaqError::Configuration(format!(
                    "Channel {} mapped twice (planes {} and {})",
                    spec.id, existing.plane, spec.plane
                )));
            }
            if !names.insert(spec.name.clone()) {
                return Err(DaqError::Configuration(format!(
                    "Sensor name '{}' used by more than one channel",
                    spec.name
                )));
            }

            let members = planes.entry(spec.plane).or_default();
            let slot = Slot {
                plane: spec.plane,
                name: spec.name,
                index: members.len(),
            };
            members.push(spec.id.clone());
            scan_order.push(spec.id.clone());
            slots.insert(spec.id, slot);
        }

        Ok(Self {
            scan_order,
            slots,
            planes,
        })
    }

    /// Build a map from separate scan-order, plane and name tables.
    ///
    /// Every scanned channel must have a plane and a name, and every mapped channel must be
    /// scanned.
    pub fn from_tables(
        scan_order: &[ChannelId],
        planes: &HashMap<ChannelId, Plane>,
        names: &HashMap<ChannelId, String>,
    ) -> AppResult<Self> {
        for id in planes.keys().chain(names.keys()) {
            if !scan_order.contains(id) {
                return Err(DaqError::Configuration(format!(
                    "Channel {} is mapped but not part of the scan list",
                    id
                )));
            }
        }

        let specs = scan_order
            .iter()
            .map(|id| {
                let plane = planes.get(id).copied().ok_or_else(|| {
                    DaqError::Configuration(format!("Channel {} has no plane", id))
                })?;
                let name = names.get(id).cloned().ok_or_else(|| {
                    DaqError::Configuration(format!("Channel {} has no sensor name", id))
                })?;
                Ok(ChannelSpec {
                    id: id.clone(),
                    plane,
                    name,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Self::new(specs)
    }

    /// Built-in QLCS TVAC wiring.
    pub fn qlcs_tvac() -> AppResult<Self> {
        Self::new(qlcs_tvac_channels())
    }

    /// Map with no channels (PSU-only logging).
    pub fn empty() -> Self {
        Self {
            scan_order: Vec::new(),
            slots: HashMap::new(),
            planes: Plane::ALL.iter().map(|plane| (*plane, Vec::new())).collect(),
        }
    }

    /// Plane and sensor name of a channel.
    pub fn resolve(&self, id: &ChannelId) -> Option<(Plane, &str)> {
        self.slots
            .get(id)
            .map(|slot| (slot.plane, slot.name.as_str()))
    }

    /// Plane and position inside the plane of a channel.
    pub fn locate(&self, id: &ChannelId) -> Option<(Plane, usize)> {
        self.slots.get(id).map(|slot| (slot.plane, slot.index))
    }

    /// Channels of one plane, in scan order.
    pub fn plane_order(&self, plane: Plane) -> &[ChannelId] {
        self.planes.get(&plane).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of channels per plane (every plane present, possibly zero).
    pub fn group_sizes(&self) -> BTreeMap<Plane, usize> {
        self.planes
            .iter()
            .map(|(plane, members)| (*plane, members.len()))
            .collect()
    }

    /// Number of channels in one plane.
    pub fn group_size(&self, plane: Plane) -> usize {
        self.plane_order(plane).len()
    }

    /// Channels in scan order.
    pub fn scan_order(&self) -> &[ChannelId] {
        &self.scan_order
    }

    /// Number of scanned channels.
    pub fn len(&self) -> usize {
        self.scan_order.len()
    }

    /// True when nothing is scanned.
    pub fn is_empty(&self) -> bool {
        self.scan_order.is_empty()
    }

    /// Sensor names in log column order (U, Y, EXT, P1S, STRAIN).
    pub fn column_names(&self) -> Vec<String> {
        Plane::ALL
            .iter()
            .flat_map(|plane| self.plane_order(*plane))
            .filter_map(|id| self.slots.get(id).map(|slot| slot.name.clone()))
            .collect()
    }

    /// Units in scan order.
    pub fn units(&self) -> Vec<&'static str> {
        self.scan_order
            .iter()
            .filter_map(|id| self.slots.get(id).map(|slot| slot.plane.unit()))
            .collect()
    }

    /// Redistribute one flat scan into per-plane sequences.
    ///
    /// # Errors
    /// `FormatMismatch` when the scan length differs from the number of mapped channels.
    pub fn regroup(&self, flat: &[f64]) -> AppResult<PlaneReadings> {
        if flat.len() != self.scan_order.len() {
            return Err(DaqError::FormatMismatch {
                group: "scan".to_string(),
                expected: self.scan_order.len(),
                actual: flat.len(),
            });
        }

        let mut readings = PlaneReadings::with_sizes(&self.group_sizes());
        for (id, value) in self.scan_order.iter().zip(flat) {
            if let Some(slot) = self.slots.get(id) {
                readings.push(slot.plane, *value);
            }
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qlcs_table_sizes() {
        let map = ChannelMap::qlcs_tvac().unwrap();
        let sizes = map.group_sizes();
        assert_eq!(sizes[&Plane::U], 16);
        assert_eq!(sizes[&Plane::Y], 19);
        assert_eq!(sizes[&Plane::Ext], 6);
        assert_eq!(sizes[&Plane::P1s], 3);
        assert_eq!(sizes[&Plane::Strain], 13);
        assert_eq!(map.len(), 57);
    }

    #[test]
    fn sizes_add_up_to_scan_length() {
        let map = ChannelMap::qlcs_tvac().unwrap();
        let total: usize = map.group_sizes().values().sum();
        let concatenated: usize = Plane::ALL
            .iter()
            .map(|plane| map.plane_order(*plane).len())
            .sum();
        assert_eq!(total, map.len());
        assert_eq!(concatenated, map.scan_order().len());
        assert_eq!(map.column_names().len(), map.len());
    }

    #[test]
    fn units_follow_scan_order() {
        let map = ChannelMap::qlcs_tvac().unwrap();
        let units = map.units();
        assert_eq!(units.len(), map.len());
        assert_eq!(units.iter().filter(|u| **u == "eps").count(), 13);
        assert_eq!(units[0], "degC");
    }

    #[test]
    fn resolve_and_locate() {
        let map = ChannelMap::qlcs_tvac().unwrap();
        assert_eq!(map.resolve(&"213".into()), Some((Plane::U, "pt33")));
        assert_eq!(map.locate(&"211".into()), Some((Plane::U, 8)));
        assert_eq!(map.locate(&"213".into()), Some((Plane::U, 10)));
        assert_eq!(map.resolve(&"206".into()), None);
    }

    #[test]
    fn plane_order_follows_scan_order() {
        let map = ChannelMap::qlcs_tvac().unwrap();
        let ext: Vec<&str> = map
            .plane_order(Plane::Ext)
            .iter()
            .map(ChannelId::as_str)
            .collect();
        assert_eq!(ext, vec!["105", "210", "218", "220", "315", "316"]);
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let err = ChannelMap::new(vec![
            ChannelSpec::new("101", Plane::U, "a"),
            ChannelSpec::new("101", Plane::Y, "b"),
        ])
        .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn unmapped_channel_is_rejected() {
        let scan = vec![ChannelId::new("101"), ChannelId::new("102")];
        let planes = HashMap::from([(ChannelId::new("101"), Plane::U)]);
        let names = HashMap::from([
            (ChannelId::new("101"), "a".to_string()),
            (ChannelId::new("102"), "b".to_string()),
        ]);
        let err = ChannelMap::from_tables(&scan, &planes, &names).unwrap_err();
        assert!(err.to_string().contains("102"));
    }

    #[test]
    fn mapped_but_not_scanned_is_rejected() {
        let scan = vec![ChannelId::new("101")];
        let planes = HashMap::from([
            (ChannelId::new("101"), Plane::U),
            (ChannelId::new("199"), Plane::U),
        ]);
        let names = HashMap::from([(ChannelId::new("101"), "a".to_string())]);
        assert!(ChannelMap::from_tables(&scan, &planes, &names).is_err());
    }

    #[test]
    fn regroup_keeps_relative_order() {
        let map = ChannelMap::new(vec![
            ChannelSpec::new("101", Plane::Y, "y0"),
            ChannelSpec::new("102", Plane::U, "u0"),
            ChannelSpec::new("103", Plane::Y, "y1"),
            ChannelSpec::new("104", Plane::Strain, "s0"),
        ])
        .unwrap();
        let grouped = map.regroup(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(grouped.get(Plane::Y), &[1.0, 3.0]);
        assert_eq!(grouped.get(Plane::U), &[2.0]);
        assert_eq!(grouped.get(Plane::Strain), &[4.0]);
        assert!(grouped.get(Plane::P1s).is_empty());
    }

    #[test]
    fn regroup_rejects_short_scan() {
        let map = ChannelMap::qlcs_tvac().unwrap();
        let err = map.regroup(&[0.0; 56]).unwrap_err();
        assert!(matches!(
            err,
            DaqError::FormatMismatch {
                expected: 57,
                actual: 56,
                ..
            }
        ));
    }

    #[test]
    fn plane_parses_case_insensitively() {
        assert_eq!("P1S".parse::<Plane>().unwrap(), Plane::P1s);
        assert_eq!("ext".parse::<Plane>().unwrap(), Plane::Ext);
        assert!("z".parse::<Plane>().is_err());
    }
}
