// Timing pipeline: samples in, lap and sector events out

pub mod classifier;
pub mod collector;
pub mod crossing;
pub mod lap;
pub mod lifecycle;
pub mod source;

use serde::{Deserialize, Serialize};

use crate::geometry::LatLon;
pub use lap::LapRecord;

/// A position fix from either the anchor (raw GPS) or the fused stream.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct PositionSample {
    pub lat: f64,
    pub lon: f64,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

impl PositionSample {
    pub fn new(lat: f64, lon: f64, timestamp_ms: u64) -> Self {
        Self {
            lat,
            lon,
            timestamp_ms,
            speed_mps: None,
            accuracy_m: None,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = Some(accuracy_m);
        self
    }

    pub fn position(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Low-rate raw GPS fixes
    Anchor,
    /// High-rate fused position and speed estimates
    Fused,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Accelerometer reading in G with an optional gyroscope reading in rad/s, both in the device
/// frame.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct InertialSample {
    pub timestamp_ms: u64,
    pub accel: Vector3,
    #[serde(default)]
    pub gyro: Option<Vector3>,
}

/// Samples as a host records or forwards them, tagged by stream.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum SampleRecord {
    Anchor(PositionSample),
    Fused(PositionSample),
    Inertial(InertialSample),
}

/// Distance from the current position to one timing line, for approach displays.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LineProximity {
    pub line_id: String,
    pub label: String,
    pub distance_m: f64,
    pub armed: bool,
}

/// Everything the engine tells its host about timing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimingEvent {
    LapStarted {
        lap_index: u32,
        t_ms: u64,
    },
    SectorSplit {
        lap_index: u32,
        /// Zero-based; the last index is the segment that ends on the finish line
        sector_index: usize,
        sector_id: String,
        split_ms: u64,
        lap_elapsed_ms: u64,
        /// Time gained (negative) or lost against the reference lap at this boundary
        #[serde(default)]
        delta_ms: Option<i64>,
    },
    LapFinished {
        record: LapRecord,
        new_best: bool,
    },
    ProximityUpdate {
        lines: Vec<LineProximity>,
    },
}
