use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::TimingError;
use crate::timing::classifier::AxisMapping;

const CONFIG_FILE_NAME: &str = "config.json";
const APP_DIR_NAME: &str = "trackday";

pub const REFRESH_RATE_MS: u64 = 100;
pub const EVENT_LOG_DEPTH: usize = 1024;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Start lines tolerate slow rolling and grid starts, so they debounce the longest
    pub start_debounce_ms: u64,
    pub sector_debounce_ms: u64,
    pub finish_debounce_ms: u64,
    /// Distance a disarmed line must be left behind before it can fire again
    pub rearm_distance_m: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            start_debounce_ms: 5_000,
            sector_debounce_ms: 2_000,
            finish_debounce_ms: 2_000,
            rearm_distance_m: 20.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Delay before sector lines re-arm when a finish immediately restarts the next lap
    pub settle_delay_ms: u64,
    /// Position samples reporting a worse accuracy are discarded
    pub max_accuracy_m: f64,
    /// Anchor samples take over crossing detection when the fused stream is silent this long
    pub fused_stale_after_ms: u64,
    /// Decorate sector splits with the delta to the session's best lap
    pub delta_to_best: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 50,
            max_accuracy_m: 20.0,
            fused_stale_after_ms: 2_000,
            delta_to_best: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Warm-up while the vehicle is assumed stationary, in sample time
    pub calibration_ms: u64,
    pub tick_interval_ms: u64,
    /// Weight of the newest sample in the exponential low-pass filter
    pub filter_alpha: f64,
    pub braking_threshold_g: f64,
    pub accel_threshold_g: f64,
    pub coast_deadband_g: f64,
    /// GPS-derived acceleration beyond this overrides a contradicting inertial verdict
    pub gps_override_g: f64,
    pub gps_max_age_ms: u64,
    pub axis_mapping: AxisMapping,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            calibration_ms: 2_000,
            tick_interval_ms: 100,
            filter_alpha: 0.3,
            braking_threshold_g: -0.15,
            accel_threshold_g: 0.10,
            coast_deadband_g: 0.05,
            gps_override_g: 0.25,
            gps_max_age_ms: 2_500,
            axis_mapping: AxisMapping::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub lifecycle: LifecycleConfig,
    pub classifier: ClassifierConfig,
    /// Interval of the live elapsed-time tick
    pub refresh_rate_ms: u64,
    /// Capacity of the event log queue
    pub event_log_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            classifier: ClassifierConfig::default(),
            refresh_rate_ms: REFRESH_RATE_MS,
            event_log_depth: EVENT_LOG_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn local_config_path() -> Result<PathBuf, TimingError> {
        Ok(dirs::config_dir()
            .ok_or(TimingError::NoConfigDir)?
            .join(APP_DIR_NAME)
            .join(CONFIG_FILE_NAME))
    }

    /// Load the user's config file, `None` when it has never been saved.
    pub fn from_local_file() -> Result<Option<Self>, TimingError> {
        let config_path = Self::local_config_path()?;
        if config_path.exists() {
            Self::from_file(&config_path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, TimingError> {
        let file =
            std::fs::File::open(path).map_err(|e| TimingError::ConfigIOError { source: e })?;
        serde_json::from_reader(file).map_err(|e| TimingError::ConfigSerializeError { source: e })
    }

    pub fn save(&self) -> Result<(), TimingError> {
        self.save_to(&Self::local_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), TimingError> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| TimingError::ConfigIOError { source: e })?;
        }

        let file =
            std::fs::File::create(path).map_err(|e| TimingError::ConfigIOError { source: e })?;
        serde_json::to_writer_pretty(file, self)
            .map_err(|e| TimingError::ConfigSerializeError { source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "detector": { "rearm_distance_m": 35.0 } }"#).unwrap();
        assert_eq!(config.detector.rearm_distance_m, 35.0);
        assert_eq!(config.detector.start_debounce_ms, 5_000);
        assert_eq!(config.lifecycle, LifecycleConfig::default());
        assert_eq!(config.refresh_rate_ms, REFRESH_RATE_MS);
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE_NAME);

        let mut config = EngineConfig::default();
        config.lifecycle.max_accuracy_m = 8.0;
        config.classifier.filter_alpha = 0.5;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(TimingError::ConfigSerializeError { .. })
        ));
    }
}
