use std::fmt::Display;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use simple_moving_average::{SMA, SumTreeSMA};
use uom::si::{
    acceleration::standard_gravity,
    f64::{Acceleration, Time, Velocity},
    time::millisecond,
    velocity::meter_per_second,
};

use crate::config::ClassifierConfig;

use super::{InertialSample, Vector3};

/// Number of classifier ticks averaged before thresholding.
pub const DEFAULT_WINDOW_SIZE: usize = 5;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DrivingState {
    Braking,
    Accelerating,
    Coasting,
    #[default]
    Unknown,
}

impl Display for DrivingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrivingState::Braking => write!(f, "Braking"),
            DrivingState::Accelerating => write!(f, "Accelerating"),
            DrivingState::Coasting => write!(f, "Coasting"),
            DrivingState::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAxis {
    X,
    Y,
    Z,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisSpec {
    pub axis: DeviceAxis,
    #[serde(default)]
    pub inverted: bool,
}

impl AxisSpec {
    pub fn new(axis: DeviceAxis, inverted: bool) -> Self {
        Self { axis, inverted }
    }

    fn pick(&self, v: &Vector3) -> f64 {
        let value = match self.axis {
            DeviceAxis::X => v.x,
            DeviceAxis::Y => v.y,
            DeviceAxis::Z => v.z,
        };
        if self.inverted { -value } else { value }
    }
}

/// Which device axis points forward, sideways and up once the device is mounted.
///
/// The default matches a phone standing upright in a windscreen mount with the screen facing the
/// driver: forward is out of the back of the phone (-Z), lateral is +X and vertical is +Y. Any
/// other mounting has to supply its own mapping.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisMapping {
    pub longitudinal: AxisSpec,
    pub lateral: AxisSpec,
    pub vertical: AxisSpec,
}

impl Default for AxisMapping {
    fn default() -> Self {
        Self {
            longitudinal: AxisSpec::new(DeviceAxis::Z, true),
            lateral: AxisSpec::new(DeviceAxis::X, false),
            vertical: AxisSpec::new(DeviceAxis::Y, false),
        }
    }
}

impl AxisMapping {
    /// Returns (longitudinal, lateral, vertical)
    pub fn to_vehicle(&self, v: &Vector3) -> (f64, f64, f64) {
        (
            self.longitudinal.pick(v),
            self.lateral.pick(v),
            self.vertical.pick(v),
        )
    }
}

/// Latest classifier output. All G values are zero until calibration completes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct AccelerationReading {
    pub state: DrivingState,
    pub longitudinal_g: f64,
    pub lateral_g: f64,
    pub vertical_g: f64,
    #[serde(default)]
    pub yaw_rate_rps: f64,
}

#[derive(Clone, Copy, Debug)]
struct SpeedSample {
    speed_mps: f64,
    timestamp_ms: u64,
}

/// Turns raw accelerometer samples into a braking / accelerating / coasting label.
///
/// Samples are low-pass filtered as they arrive. The first `calibration_ms` of samples after
/// [`DrivingStateClassifier::start`] establish the gravity offset; afterwards the compensated
/// vector is mapped onto vehicle axes and classified once per tick with hysteresis, optionally
/// overridden by the acceleration implied by consecutive GPS speeds.
pub struct DrivingStateClassifier<const WINDOW_SIZE: usize> {
    config: ClassifierConfig,
    calibration_start_ms: Option<u64>,
    started: bool,
    filtered: Option<Vector3>,
    gravity_offset: Option<Vector3>,
    filtered_yaw_rate: f64,
    last_tick_ms: u64,
    longitudinal_window: SumTreeSMA<f64, f64, WINDOW_SIZE>,
    lateral_window: SumTreeSMA<f64, f64, WINDOW_SIZE>,
    previous_speed: Option<SpeedSample>,
    latest_speed: Option<SpeedSample>,
    reading: AccelerationReading,
}

pub type DefaultClassifier = DrivingStateClassifier<DEFAULT_WINDOW_SIZE>;

impl<const WINDOW_SIZE: usize> DrivingStateClassifier<WINDOW_SIZE> {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            calibration_start_ms: None,
            started: false,
            filtered: None,
            gravity_offset: None,
            filtered_yaw_rate: 0.,
            last_tick_ms: 0,
            longitudinal_window: SumTreeSMA::new(),
            lateral_window: SumTreeSMA::new(),
            previous_speed: None,
            latest_speed: None,
            reading: AccelerationReading::default(),
        }
    }

    /// Begin a calibration run. The warm-up is measured from the first inertial sample received
    /// afterwards.
    pub fn start(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
        self.started = true;
    }

    pub fn stop(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }

    pub fn is_calibrated(&self) -> bool {
        self.gravity_offset.is_some()
    }

    pub fn gravity_offset(&self) -> Option<Vector3> {
        self.gravity_offset
    }

    pub fn current_acceleration(&self) -> AccelerationReading {
        if !self.is_calibrated() {
            return AccelerationReading::default();
        }
        self.reading
    }

    pub fn current_state(&self) -> DrivingState {
        self.current_acceleration().state
    }

    /// Feed a GPS speed used to cross-check the inertial verdict.
    pub fn observe_speed(&mut self, speed_mps: f64, timestamp_ms: u64) {
        if !speed_mps.is_finite() {
            return;
        }
        if let Some(latest) = self.latest_speed
            && timestamp_ms <= latest.timestamp_ms
        {
            return;
        }
        self.previous_speed = self.latest_speed;
        self.latest_speed = Some(SpeedSample {
            speed_mps,
            timestamp_ms,
        });
    }

    pub fn process_sample(&mut self, sample: &InertialSample) {
        if !self.started {
            return;
        }

        let alpha = self.config.filter_alpha;
        let filtered = match self.filtered {
            None => sample.accel,
            Some(f) => Vector3::new(
                alpha * sample.accel.x + (1. - alpha) * f.x,
                alpha * sample.accel.y + (1. - alpha) * f.y,
                alpha * sample.accel.z + (1. - alpha) * f.z,
            ),
        };
        self.filtered = Some(filtered);

        if let Some(gyro) = sample.gyro {
            let (_, _, yaw) = self.config.axis_mapping.to_vehicle(&gyro);
            self.filtered_yaw_rate = alpha * yaw + (1. - alpha) * self.filtered_yaw_rate;
        }

        let Some(offset) = self.gravity_offset else {
            let calibration_start = *self.calibration_start_ms.get_or_insert(sample.timestamp_ms);
            if sample.timestamp_ms.saturating_sub(calibration_start) >= self.config.calibration_ms {
                self.gravity_offset = Some(filtered);
                self.last_tick_ms = sample.timestamp_ms;
                self.reading.state = DrivingState::Coasting;
                info!(
                    "Accelerometer calibrated, gravity offset ({:.3}, {:.3}, {:.3})",
                    filtered.x, filtered.y, filtered.z
                );
            }
            return;
        };

        if sample.timestamp_ms.saturating_sub(self.last_tick_ms) < self.config.tick_interval_ms {
            return;
        }
        self.last_tick_ms = sample.timestamp_ms;
        self.tick(filtered, offset, sample.timestamp_ms);
    }

    fn tick(&mut self, filtered: Vector3, offset: Vector3, now_ms: u64) {
        let compensated = Vector3::new(
            filtered.x - offset.x,
            filtered.y - offset.y,
            filtered.z - offset.z,
        );
        let (longitudinal, lateral, vertical) = self.config.axis_mapping.to_vehicle(&compensated);
        self.longitudinal_window.add_sample(longitudinal);
        self.lateral_window.add_sample(lateral);

        let longitudinal_g = self.longitudinal_window.get_average();
        let inertial_state = self.classify(longitudinal_g);
        let state = match self.gps_acceleration_g(now_ms) {
            Some(gps_g) => self.cross_check(inertial_state, gps_g),
            None => inertial_state,
        };

        if state != self.reading.state {
            debug!(
                "Driving state {} -> {} at {:.3}G",
                self.reading.state, state, longitudinal_g
            );
        }
        self.reading = AccelerationReading {
            state,
            longitudinal_g,
            lateral_g: self.lateral_window.get_average(),
            vertical_g: vertical,
            yaw_rate_rps: self.filtered_yaw_rate,
        };
    }

    fn classify(&self, longitudinal_g: f64) -> DrivingState {
        if longitudinal_g < self.config.braking_threshold_g {
            DrivingState::Braking
        } else if longitudinal_g > self.config.accel_threshold_g {
            DrivingState::Accelerating
        } else if longitudinal_g.abs() <= self.config.coast_deadband_g {
            DrivingState::Coasting
        } else {
            self.reading.state
        }
    }

    fn gps_acceleration_g(&self, now_ms: u64) -> Option<f64> {
        let (previous, latest) = (self.previous_speed?, self.latest_speed?);
        if now_ms.saturating_sub(previous.timestamp_ms) > self.config.gps_max_age_ms {
            return None;
        }
        let elapsed = Time::new::<millisecond>(
            latest.timestamp_ms.saturating_sub(previous.timestamp_ms) as f64,
        );
        let speed_change = Velocity::new::<meter_per_second>(latest.speed_mps)
            - Velocity::new::<meter_per_second>(previous.speed_mps);
        let acceleration: Acceleration = speed_change / elapsed;
        Some(acceleration.get::<standard_gravity>())
    }

    fn cross_check(&self, inertial: DrivingState, gps_g: f64) -> DrivingState {
        let threshold = self.config.gps_override_g;
        match inertial {
            DrivingState::Accelerating if gps_g <= -threshold => {
                debug!("GPS shows {:.2}G deceleration, overriding accelerating", gps_g);
                DrivingState::Braking
            }
            DrivingState::Braking if gps_g >= threshold => {
                debug!("GPS shows {:.2}G acceleration, overriding braking", gps_g);
                DrivingState::Accelerating
            }
            state => state,
        }
    }
}
