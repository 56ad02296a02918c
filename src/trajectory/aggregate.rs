use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::timing::LapRecord;

/// Session-level statistics over completed laps.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SessionSummary {
    pub lap_count: usize,
    pub best_lap_ms: Option<u64>,
    pub best_lap_index: Option<u32>,
    pub last_lap_ms: Option<u64>,
    pub average_lap_ms: Option<u64>,
    /// Fastest measured split per sector index, `None` where no lap measured that sector
    pub best_sectors_ms: Vec<Option<u64>>,
    /// Sum of the best splits, the theoretical lap the driver has shown in pieces
    pub optimal_lap_ms: Option<u64>,
    pub total_distance_m: f64,
}

/// Minimum measured split per sector index across laps. Backfilled splits do not count.
pub fn best_sector_times(laps: &[LapRecord]) -> Vec<Option<u64>> {
    let sector_count = laps
        .iter()
        .map(|lap| lap.sector_splits_ms.len())
        .max()
        .unwrap_or(0);

    (0..sector_count)
        .map(|index| {
            laps.iter()
                .filter(|lap| !lap.is_backfilled(index))
                .filter_map(|lap| lap.sector_splits_ms.get(index).copied())
                .min()
        })
        .collect()
}

pub fn optimal_lap_time(laps: &[LapRecord]) -> Option<u64> {
    let best = best_sector_times(laps);
    if best.is_empty() {
        return None;
    }
    best.into_iter().sum()
}

pub fn best_lap(laps: &[LapRecord]) -> Option<&LapRecord> {
    laps.iter().min_by_key(|lap| (lap.lap_time_ms, lap.lap_index))
}

pub fn summarize(laps: &[LapRecord]) -> SessionSummary {
    let best = best_lap(laps);
    let average_lap_ms = if laps.is_empty() {
        None
    } else {
        Some(laps.iter().map(|lap| lap.lap_time_ms).sum::<u64>() / laps.len() as u64)
    };

    SessionSummary {
        lap_count: laps.len(),
        best_lap_ms: best.map(|lap| lap.lap_time_ms),
        best_lap_index: best.map(|lap| lap.lap_index),
        last_lap_ms: laps.last().map(|lap| lap.lap_time_ms),
        average_lap_ms,
        best_sectors_ms: best_sector_times(laps),
        optimal_lap_ms: optimal_lap_time(laps),
        total_distance_m: laps.iter().map(|lap| lap.distance_m).sum(),
    }
}

/// Laps ordered fastest first, for leaderboards.
pub fn ranked(laps: &[LapRecord]) -> Vec<&LapRecord> {
    laps.iter()
        .sorted_by_key(|lap| (lap.lap_time_ms, lap.lap_index))
        .collect()
}
