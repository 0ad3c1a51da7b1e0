//! Merged view of every dataset fetched so far.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DatasetKind;

/// Instantaneous meter reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Running total in kWh
    pub accumulate: f64,
    /// Current power draw in W
    pub instant: f64,
}

/// One closed period of a historical series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalReading {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Energy over the period in Wh
    pub value: f64,
}

/// Historical consumption or generation series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSeries {
    #[serde(default)]
    pub accumulated: Option<f64>,
    #[serde(default, alias = "accumulated-co2")]
    pub accumulated_co2: Option<f64>,
    #[serde(default)]
    pub historical: Vec<HistoricalReading>,
}

/// Power demand peak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerDemandPeak {
    pub dt: DateTime<Utc>,
    /// Peak power in W
    pub value: f64,
}

/// Last known value of every dataset.
///
/// Fields that were never fetched keep their default (empty) shape, so a
/// serialized snapshot always carries every key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub measure_accumulated: Option<f64>,
    pub measure_instant: Option<f64>,
    pub historical_consumption: HistoricalSeries,
    pub historical_generation: HistoricalSeries,
    pub historical_power_demand: Vec<PowerDemandPeak>,
}

impl Snapshot {
    /// Replace the fields owned by the patch's dataset, leaving the rest.
    pub fn merge(&mut self, patch: SnapshotPatch) {
        match patch {
            SnapshotPatch::Measure(measure) => {
                self.measure_accumulated = Some(measure.accumulate);
                self.measure_instant = Some(measure.instant);
            }
            SnapshotPatch::HistoricalConsumption(series) => self.historical_consumption = series,
            SnapshotPatch::HistoricalGeneration(series) => self.historical_generation = series,
            SnapshotPatch::HistoricalPowerDemand(peaks) => self.historical_power_demand = peaks,
        }
    }
}

/// Fields produced by one successful dataset fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotPatch {
    Measure(Measure),
    HistoricalConsumption(HistoricalSeries),
    HistoricalGeneration(HistoricalSeries),
    HistoricalPowerDemand(Vec<PowerDemandPeak>),
}

impl SnapshotPatch {
    /// Dataset this patch belongs to.
    pub fn kind(&self) -> DatasetKind {
        match self {
            Self::Measure(_) => DatasetKind::MEASURE,
            Self::HistoricalConsumption(_) => DatasetKind::HISTORICAL_CONSUMPTION,
            Self::HistoricalGeneration(_) => DatasetKind::HISTORICAL_GENERATION,
            Self::HistoricalPowerDemand(_) => DatasetKind::HISTORICAL_POWER_DEMAND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(hour: u32, value: f64) -> HistoricalReading {
        HistoricalReading {
            start: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 1, hour + 1, 0, 0).unwrap(),
            value,
        }
    }

    #[test]
    fn test_default_serializes_every_key() {
        let value = serde_json::to_value(Snapshot::default()).unwrap();
        let object = value.as_object().unwrap();

        for key in [
            "measure_accumulated",
            "measure_instant",
            "historical_consumption",
            "historical_generation",
            "historical_power_demand",
        ] {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert_eq!(value["historical_consumption"]["historical"], serde_json::json!([]));
        assert!(value["measure_accumulated"].is_null());
    }

    #[test]
    fn test_merge_only_touches_patch_fields() {
        let mut snapshot = Snapshot::default();
        snapshot.merge(SnapshotPatch::Measure(Measure {
            accumulate: 1234.5,
            instant: 300.0,
        }));
        snapshot.merge(SnapshotPatch::HistoricalConsumption(HistoricalSeries {
            accumulated: Some(10.0),
            accumulated_co2: None,
            historical: vec![reading(1, 250.0)],
        }));

        assert_eq!(snapshot.measure_accumulated, Some(1234.5));
        assert_eq!(snapshot.historical_consumption.historical.len(), 1);
        assert!(snapshot.historical_generation.historical.is_empty());

        snapshot.merge(SnapshotPatch::Measure(Measure {
            accumulate: 1235.0,
            instant: 120.0,
        }));
        assert_eq!(snapshot.measure_instant, Some(120.0));
        assert_eq!(snapshot.historical_consumption.accumulated, Some(10.0));
    }

    #[test]
    fn test_series_accepts_dashed_co2_key() {
        let series: HistoricalSeries =
            serde_json::from_str(r#"{"accumulated": 3.5, "accumulated-co2": 0.7}"#).unwrap();
        assert_eq!(series.accumulated_co2, Some(0.7));
        assert!(series.historical.is_empty());
    }

    #[test]
    fn test_patch_kind() {
        let patch = SnapshotPatch::HistoricalPowerDemand(vec![]);
        assert_eq!(patch.kind(), DatasetKind::HISTORICAL_POWER_DEMAND);
    }
}
