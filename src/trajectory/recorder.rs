use std::collections::BTreeMap;

use itertools::Itertools;
use log::debug;

use crate::geometry::path_length_m;

use super::{ChangeKind, DrivingStateChange, LapTrajectory, TrajectoryPoint};

/// Keeps the full trajectory and the compacted state-change run for every lap of a session.
#[derive(Debug, Default)]
pub struct TrajectoryRecorder {
    active: Option<LapTrajectory>,
    completed: BTreeMap<u32, LapTrajectory>,
}

impl TrajectoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a lap. Anything still open is discarded.
    pub fn begin_lap(&mut self, lap_index: u32, marker: DrivingStateChange) {
        if let Some(stale) = self.active.take() {
            debug!("Discarding unfinished trajectory for lap {}", stale.lap_index);
        }
        self.active = Some(LapTrajectory {
            lap_index,
            points: Vec::new(),
            state_changes: vec![marker],
        });
    }

    pub fn record(&mut self, point: TrajectoryPoint) {
        let Some(lap) = self.active.as_mut() else {
            return;
        };
        let last_state = lap.state_changes.last().map(|c| c.driving_state);
        if last_state != Some(point.driving_state) {
            lap.state_changes
                .push(DrivingStateChange::at_point(ChangeKind::StateChange, &point));
        }
        lap.points.push(point);
    }

    /// Close the active lap and keep it under its index.
    pub fn end_lap(&mut self, marker: DrivingStateChange) -> Option<&LapTrajectory> {
        let mut lap = self.active.take()?;
        lap.state_changes.push(marker);
        let lap_index = lap.lap_index;
        debug!(
            "Lap {} trajectory closed: {} points, {} state changes",
            lap_index,
            lap.points.len(),
            lap.state_changes.len()
        );
        self.completed.insert(lap_index, lap);
        self.completed.get(&lap_index)
    }

    pub fn discard_active(&mut self) {
        self.active = None;
    }

    pub fn clear(&mut self) {
        self.active = None;
        self.completed.clear();
    }

    pub fn active_lap_index(&self) -> Option<u32> {
        self.active.as_ref().map(|lap| lap.lap_index)
    }

    fn lap(&self, lap_index: u32) -> Option<&LapTrajectory> {
        self.completed
            .get(&lap_index)
            .or(self.active.as_ref().filter(|lap| lap.lap_index == lap_index))
    }

    pub fn trajectory(&self, lap_index: u32) -> Option<&[TrajectoryPoint]> {
        self.lap(lap_index).map(|lap| lap.points.as_slice())
    }

    pub fn state_changes(&self, lap_index: u32) -> Option<&[DrivingStateChange]> {
        self.lap(lap_index).map(|lap| lap.state_changes.as_slice())
    }

    pub fn completed_laps(&self) -> impl Iterator<Item = &LapTrajectory> {
        self.completed.values()
    }

    /// Haversine length of the recorded trajectory of every completed lap.
    pub fn total_distance_m(&self) -> f64 {
        self.completed_laps()
            .map(|lap| path_length_m(lap.points.iter().map(|p| p.position())))
            .sum()
    }
}

/// Highest recorded speed, zero for an empty trajectory.
pub fn max_speed_mps(points: &[TrajectoryPoint]) -> f64 {
    points
        .iter()
        .map(|p| p.speed_mps)
        .filter(|s| s.is_finite())
        .fold(0., f64::max)
}

/// Number of transitions between driving states, ignoring lap markers.
pub fn state_change_count(changes: &[DrivingStateChange]) -> usize {
    changes
        .iter()
        .filter(|c| c.kind == ChangeKind::StateChange)
        .dedup_by(|a, b| a.driving_state == b.driving_state)
        .count()
}
