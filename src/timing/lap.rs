use log::warn;
use serde::{Deserialize, Serialize};

use crate::trajectory::DrivingStateChange;

/// A finished lap. Never modified after creation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LapRecord {
    /// 1-based position of the lap within its session
    pub lap_index: u32,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub lap_time_ms: u64,
    /// One split per sector boundary plus the final segment to the finish line
    pub sector_splits_ms: Vec<u64>,
    /// Splits that were never measured and hold the final split as a stand-in
    #[serde(default)]
    pub backfilled_sectors: Vec<usize>,
    #[serde(default)]
    pub distance_m: f64,
    #[serde(default)]
    pub max_speed_mps: f64,
    /// Compacted driving-state run for the lap
    #[serde(default)]
    pub state_changes: Vec<DrivingStateChange>,
}

impl LapRecord {
    /// True when every split was measured from an actual crossing.
    pub fn is_complete(&self) -> bool {
        self.backfilled_sectors.is_empty()
    }

    pub fn is_backfilled(&self, sector_index: usize) -> bool {
        self.backfilled_sectors.contains(&sector_index)
    }

    /// Lap time at the end of each split.
    pub fn cumulative_splits_ms(&self) -> Vec<u64> {
        self.sector_splits_ms
            .iter()
            .scan(0u64, |total, split| {
                *total += split;
                Some(*total)
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SectorTiming {
    pub line_id: String,
    pub split_ms: u64,
}

/// Splits assembled when the finish line fires.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedLap {
    pub started_at_ms: u64,
    pub lap_time_ms: u64,
    pub sector_splits_ms: Vec<u64>,
    pub backfilled_sectors: Vec<usize>,
}

/// Split bookkeeping for the lap in progress.
#[derive(Debug, Default)]
pub struct LapClock {
    lap_start_ms: Option<u64>,
    last_boundary_ms: Option<u64>,
    sector_timings: Vec<SectorTiming>,
}

impl LapClock {
    pub fn start(&mut self, t_ms: u64) {
        self.lap_start_ms = Some(t_ms);
        self.last_boundary_ms = None;
        self.sector_timings.clear();
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_running(&self) -> bool {
        self.lap_start_ms.is_some()
    }

    pub fn lap_start_ms(&self) -> Option<u64> {
        self.lap_start_ms
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> Option<u64> {
        self.lap_start_ms.map(|start| now_ms.saturating_sub(start))
    }

    pub fn sector_timings(&self) -> &[SectorTiming] {
        &self.sector_timings
    }

    pub fn has_split(&self, line_id: &str) -> bool {
        self.sector_timings.iter().any(|s| s.line_id == line_id)
    }

    /// Record a sector boundary. Returns the split, or `None` when no lap is running or the line
    /// already has a split this lap.
    pub fn mark_sector(&mut self, line_id: &str, t_ms: u64) -> Option<u64> {
        let lap_start = self.lap_start_ms?;
        if self.has_split(line_id) {
            return None;
        }
        let split_ms = t_ms.saturating_sub(self.last_boundary_ms.unwrap_or(lap_start));
        self.sector_timings.push(SectorTiming {
            line_id: line_id.to_string(),
            split_ms,
        });
        self.last_boundary_ms = Some(t_ms);
        Some(split_ms)
    }

    /// Close the lap at `t_ms` and lay the splits out in `sector_order`, followed by the final
    /// segment. Sectors without a split get the final split's value and are reported as
    /// backfilled.
    pub fn finish(&mut self, t_ms: u64, sector_order: &[String]) -> Option<FinishedLap> {
        let started_at_ms = self.lap_start_ms?;
        let final_split_ms = t_ms.saturating_sub(self.last_boundary_ms.unwrap_or(started_at_ms));

        let mut backfilled_sectors = Vec::new();
        let mut sector_splits_ms: Vec<u64> = sector_order
            .iter()
            .enumerate()
            .map(|(index, line_id)| {
                match self.sector_timings.iter().find(|s| &s.line_id == line_id) {
                    Some(timing) => timing.split_ms,
                    None => {
                        backfilled_sectors.push(index);
                        final_split_ms
                    }
                }
            })
            .collect();
        sector_splits_ms.push(final_split_ms);

        if !backfilled_sectors.is_empty() {
            warn!(
                "Lap finished without crossing sector boundaries {:?}, using the final split of {}ms in their place",
                backfilled_sectors, final_split_ms
            );
        }

        self.clear();
        Some(FinishedLap {
            started_at_ms,
            lap_time_ms: t_ms.saturating_sub(started_at_ms),
            sector_splits_ms,
            backfilled_sectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sectors(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("s{}", i + 1)).collect()
    }

    #[test]
    fn test_splits_follow_boundaries() {
        let mut clock = LapClock::default();
        clock.start(10_000);
        assert_eq!(clock.mark_sector("s1", 40_000), Some(30_000));
        let lap = clock.finish(102_000, &sectors(1)).unwrap();

        assert_eq!(lap.lap_time_ms, 92_000);
        assert_eq!(lap.sector_splits_ms, vec![30_000, 62_000]);
        assert!(lap.backfilled_sectors.is_empty());
        assert!(!clock.is_running());
    }

    #[test]
    fn test_duplicate_sector_is_ignored() {
        let mut clock = LapClock::default();
        clock.start(0);
        assert_eq!(clock.mark_sector("s1", 30_000), Some(30_000));
        assert_eq!(clock.mark_sector("s1", 31_000), None);
        assert_eq!(clock.sector_timings().len(), 1);
    }

    #[test]
    fn test_sector_without_lap_is_ignored() {
        let mut clock = LapClock::default();
        assert_eq!(clock.mark_sector("s1", 30_000), None);
        assert!(clock.finish(60_000, &sectors(1)).is_none());
    }

    #[test]
    fn test_missing_sector_is_backfilled() {
        let mut clock = LapClock::default();
        clock.start(0);
        clock.mark_sector("s1", 20_000);
        let lap = clock.finish(90_000, &sectors(2)).unwrap();

        assert_eq!(lap.sector_splits_ms, vec![20_000, 70_000, 70_000]);
        assert_eq!(lap.backfilled_sectors, vec![1]);
    }

    #[test]
    fn test_cumulative_splits() {
        let record = LapRecord {
            lap_index: 1,
            started_at_ms: 0,
            finished_at_ms: 92_000,
            lap_time_ms: 92_000,
            sector_splits_ms: vec![30_000, 40_000, 22_000],
            backfilled_sectors: vec![],
            distance_m: 0.0,
            max_speed_mps: 0.0,
            state_changes: vec![],
        };
        assert_eq!(record.cumulative_splits_ms(), vec![30_000, 70_000, 92_000]);
        assert!(record.is_complete());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_splits_cover_the_lap(
            start in 0u64..1_000_000_000,
            gaps in proptest::collection::vec(1u64..120_000, 1..8),
        ) {
            let order = sectors(gaps.len() - 1);
            let mut clock = LapClock::default();
            clock.start(start);

            let mut t = start;
            for (line_id, gap) in order.iter().zip(&gaps) {
                t += gap;
                clock.mark_sector(line_id, t);
            }
            t += gaps[gaps.len() - 1];

            let lap = clock.finish(t, &order).unwrap();
            prop_assert_eq!(lap.sector_splits_ms.len(), order.len() + 1);
            prop_assert_eq!(lap.sector_splits_ms.iter().sum::<u64>(), lap.lap_time_ms);
            prop_assert_eq!(lap.sector_splits_ms, gaps);
        }
    }
}
