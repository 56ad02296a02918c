use serde::{Deserialize, Serialize};

use crate::timing::LapRecord;

/// A lap to compare against, usually the session best.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceLap {
    pub lap_index: u32,
    pub lap_time_ms: u64,
    cumulative_ms: Vec<u64>,
}

impl ReferenceLap {
    pub fn from_record(record: &LapRecord) -> Self {
        Self {
            lap_index: record.lap_index,
            lap_time_ms: record.lap_time_ms,
            cumulative_ms: record.cumulative_splits_ms(),
        }
    }

    /// Difference between the live lap time at a boundary and the reference at the same
    /// boundary. Negative means ahead.
    pub fn delta_at(&self, sector_index: usize, lap_elapsed_ms: u64) -> Option<i64> {
        let reference = *self.cumulative_ms.get(sector_index)?;
        Some(lap_elapsed_ms as i64 - reference as i64)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LapDelta {
    pub lap_index: u32,
    pub reference_lap_index: u32,
    pub lap_delta_ms: i64,
    /// Per-split difference; empty when the laps have different sector layouts
    pub sector_deltas_ms: Vec<i64>,
}

impl LapDelta {
    pub fn between(reference: &LapRecord, lap: &LapRecord) -> Self {
        let sector_deltas_ms =
            if reference.sector_splits_ms.len() == lap.sector_splits_ms.len() {
                lap.sector_splits_ms
                    .iter()
                    .zip(&reference.sector_splits_ms)
                    .map(|(split, reference)| *split as i64 - *reference as i64)
                    .collect()
            } else {
                Vec::new()
            };

        Self {
            lap_index: lap.lap_index,
            reference_lap_index: reference.lap_index,
            lap_delta_ms: lap.lap_time_ms as i64 - reference.lap_time_ms as i64,
            sector_deltas_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lap(lap_index: u32, splits: &[u64]) -> LapRecord {
        LapRecord {
            lap_index,
            started_at_ms: 0,
            finished_at_ms: splits.iter().sum(),
            lap_time_ms: splits.iter().sum(),
            sector_splits_ms: splits.to_vec(),
            backfilled_sectors: vec![],
            distance_m: 0.0,
            max_speed_mps: 0.0,
            state_changes: vec![],
        }
    }

    #[test]
    fn test_live_delta_against_reference() {
        let reference = ReferenceLap::from_record(&lap(2, &[30_000, 62_000]));
        assert_eq!(reference.delta_at(0, 29_400), Some(-600));
        assert_eq!(reference.delta_at(1, 93_250), Some(1_250));
        assert_eq!(reference.delta_at(2, 93_250), None);
    }

    #[test]
    fn test_lap_delta() {
        let best = lap(2, &[30_000, 40_000, 22_000]);
        let other = lap(5, &[30_500, 39_000, 23_000]);
        let delta = LapDelta::between(&best, &other);

        assert_eq!(delta.lap_delta_ms, 500);
        assert_eq!(delta.sector_deltas_ms, vec![500, -1_000, 1_000]);
        assert_eq!(delta.reference_lap_index, 2);

        let different_layout = lap(6, &[92_000]);
        assert!(LapDelta::between(&best, &different_layout).sector_deltas_ms.is_empty());
    }
}
