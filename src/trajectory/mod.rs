// Per-lap trajectories and session statistics

pub mod aggregate;
pub mod delta;
pub mod recorder;

use serde::{Deserialize, Serialize};

use crate::geometry::LatLon;
use crate::timing::classifier::{AccelerationReading, DrivingState};

pub use aggregate::SessionSummary;
pub use delta::{LapDelta, ReferenceLap};
pub use recorder::TrajectoryRecorder;

/// One fused sample recorded while a lap is active, stamped with the driving state at the time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct TrajectoryPoint {
    pub lat: f64,
    pub lon: f64,
    pub timestamp_ms: u64,
    pub speed_mps: f64,
    pub accuracy_m: f64,
    pub driving_state: DrivingState,
    pub longitudinal_g: f64,
    pub lateral_g: f64,
}

impl TrajectoryPoint {
    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    LapStart,
    StateChange,
    LapEnd,
}

/// Compacted trajectory entry, recorded only when something changes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DrivingStateChange {
    pub kind: ChangeKind,
    pub timestamp_ms: u64,
    pub lat: f64,
    pub lon: f64,
    pub speed_mps: f64,
    pub driving_state: DrivingState,
    pub longitudinal_g: f64,
    pub lateral_g: f64,
}

impl DrivingStateChange {
    pub fn at_point(kind: ChangeKind, point: &TrajectoryPoint) -> Self {
        Self {
            kind,
            timestamp_ms: point.timestamp_ms,
            lat: point.lat,
            lon: point.lon,
            speed_mps: point.speed_mps,
            driving_state: point.driving_state,
            longitudinal_g: point.longitudinal_g,
            lateral_g: point.lateral_g,
        }
    }

    pub fn at_crossing(
        kind: ChangeKind,
        timestamp_ms: u64,
        position: LatLon,
        speed_mps: f64,
        reading: &AccelerationReading,
    ) -> Self {
        Self {
            kind,
            timestamp_ms,
            lat: position.lat,
            lon: position.lon,
            speed_mps,
            driving_state: reading.state,
            longitudinal_g: reading.longitudinal_g,
            lateral_g: reading.lateral_g,
        }
    }
}

/// Everything recorded for one lap.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct LapTrajectory {
    pub lap_index: u32,
    pub points: Vec<TrajectoryPoint>,
    pub state_changes: Vec<DrivingStateChange>,
}
