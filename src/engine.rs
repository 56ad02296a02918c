// Host-facing timing engine
//
// Owns the session, the lap lifecycle and the driving-state classifier. All mutation goes through
// `&mut self`; hosts that receive samples on several threads hand them to the event loop in
// `timing::collector`, which owns the engine.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::TimingError;
use crate::storage::SessionStorage;
use crate::timing::classifier::{AccelerationReading, DefaultClassifier};
use crate::timing::lifecycle::LapLifecycle;
use crate::timing::{
    InertialSample, LapRecord, PositionSample, SampleRecord, StreamKind, TimingEvent,
};
use crate::track::Track;
use crate::trajectory::aggregate::summarize;
use crate::trajectory::{DrivingStateChange, SessionSummary, TrajectoryPoint};

/// Finalized form of a session, handed to storage when the session ends.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub track_name: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub laps: Vec<LapRecord>,
    pub summary: SessionSummary,
}

struct ActiveSession {
    session_id: String,
    track: Track,
    started_at_ms: u64,
    lifecycle: LapLifecycle,
    last_fused: Option<PositionSample>,
    last_anchor: Option<PositionSample>,
}

pub struct TimingEngine {
    config: EngineConfig,
    session: Option<ActiveSession>,
    classifier: DefaultClassifier,
    storage: Option<Box<dyn SessionStorage + Send>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn session_id_for(track: &Track, started_at_ms: u64) -> String {
    let name: String = track
        .name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{name}-{started_at_ms}")
}

impl TimingEngine {
    pub fn new(config: EngineConfig) -> Self {
        let classifier = DefaultClassifier::new(config.classifier.clone());
        Self {
            config,
            session: None,
            classifier,
            storage: None,
        }
    }

    /// Persist finished laps and sessions through `storage`.
    pub fn with_storage(mut self, storage: Box<dyn SessionStorage + Send>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> Option<&(dyn SessionStorage + Send)> {
        self.storage.as_deref()
    }

    pub fn is_session_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn track(&self) -> Option<&Track> {
        self.session.as_ref().map(|s| &s.track)
    }

    /// Validate the track and start timing. Fails on invalid geometry or when a session is
    /// already running.
    pub fn start_session(&mut self, track: Track) -> Result<String, TimingError> {
        if let Some(active) = &self.session {
            return Err(TimingError::SessionAlreadyActive {
                track_name: active.track.name.clone(),
            });
        }

        let geometry = track.geometry()?;
        let started_at_ms = now_ms();
        let session_id = session_id_for(&track, started_at_ms);
        info!(
            "Starting session {} on {} with {} sector lines",
            session_id,
            track.name,
            track.sectors.len()
        );

        self.classifier.start();
        self.session = Some(ActiveSession {
            session_id: session_id.clone(),
            started_at_ms,
            lifecycle: LapLifecycle::new(
                geometry,
                self.config.detector.clone(),
                self.config.lifecycle.clone(),
            ),
            track,
            last_fused: None,
            last_anchor: None,
        });
        Ok(session_id)
    }

    /// Stop timing. The lap in progress is discarded; completed laps are summarized and saved.
    /// The session is over even when saving fails, and the record travels back inside
    /// `TimingError::SessionSaveFailed`.
    pub fn end_session(&mut self) -> Result<SessionRecord, TimingError> {
        let mut session = self.session.take().ok_or(TimingError::NoActiveSession)?;
        session.lifecycle.abort_lap();
        self.classifier.stop();

        let laps = session.lifecycle.laps().to_vec();
        let record = SessionRecord {
            session_id: session.session_id,
            track_name: session.track.name,
            started_at_ms: session.started_at_ms,
            ended_at_ms: now_ms(),
            summary: summarize(&laps),
            laps,
        };
        info!(
            "Session {} ended with {} laps",
            record.session_id,
            record.laps.len()
        );

        if let Some(storage) = self.storage.as_mut()
            && let Err(e) = storage.save_session(&record)
        {
            error!("Could not save session {}: {}", record.session_id, e);
            return Err(TimingError::SessionSaveFailed {
                record: Box::new(record),
                source: Box::new(e),
            });
        }
        Ok(record)
    }

    /// Throw away every lap and start over on the same track.
    pub fn reset_session(&mut self) -> Result<String, TimingError> {
        let session = self.session.as_mut().ok_or(TimingError::NoActiveSession)?;
        session.lifecycle.reset();
        session.last_fused = None;
        session.last_anchor = None;
        session.started_at_ms = now_ms();
        session.session_id = session_id_for(&session.track, session.started_at_ms);
        info!("Session reset, now {}", session.session_id);
        Ok(session.session_id.clone())
    }

    /// Replace the timing lines mid-session. The lap in progress is discarded and all lines
    /// re-armed; completed laps are kept.
    pub fn set_track(&mut self, track: Track) -> Result<(), TimingError> {
        let session = self.session.as_mut().ok_or(TimingError::NoActiveSession)?;
        let geometry = track.geometry()?;
        session
            .lifecycle
            .set_geometry(geometry, self.config.detector.clone());
        session.last_fused = None;
        session.last_anchor = None;
        info!("Track changed to {}", track.name);
        session.track = track;
        Ok(())
    }

    pub fn process_sample(&mut self, record: SampleRecord) -> Vec<TimingEvent> {
        match record {
            SampleRecord::Anchor(sample) => self.push_position(StreamKind::Anchor, sample),
            SampleRecord::Fused(sample) => self.push_position(StreamKind::Fused, sample),
            SampleRecord::Inertial(sample) => {
                self.push_inertial(&sample);
                Vec::new()
            }
        }
    }

    pub fn push_inertial(&mut self, sample: &InertialSample) {
        self.classifier.process_sample(sample);
    }

    /// Feed one position sample. Fused samples drive timing and the trajectory. Anchor samples
    /// refresh proximity and only drive timing while the fused stream is stale.
    pub fn push_position(&mut self, stream: StreamKind, sample: PositionSample) -> Vec<TimingEvent> {
        let Some(session) = self.session.as_mut() else {
            debug!("No active session, dropping {:?} sample", stream);
            return Vec::new();
        };
        if !sample.position().is_valid() {
            warn!(
                "Dropping {:?} sample with invalid coordinates ({}, {})",
                stream, sample.lat, sample.lon
            );
            return Vec::new();
        }
        if let Some(accuracy) = sample.accuracy_m
            && !(accuracy.is_finite() && accuracy <= self.config.lifecycle.max_accuracy_m)
        {
            debug!(
                "Dropping {:?} sample at {}ms, accuracy {:.1}m",
                stream, sample.timestamp_ms, accuracy
            );
            return Vec::new();
        }

        let stale_after_ms = self.config.lifecycle.fused_stale_after_ms;
        let events = match stream {
            StreamKind::Fused => {
                let reading = self.classifier.current_acceleration();
                let previous = session.last_fused.replace(sample).filter(|prev| {
                    sample.timestamp_ms.saturating_sub(prev.timestamp_ms) <= stale_after_ms
                });
                match previous {
                    Some(prev) => session
                        .lifecycle
                        .process_pair(&prev, &sample, &reading, true),
                    None => Vec::new(),
                }
            }
            StreamKind::Anchor => {
                if let Some(speed) = sample.speed_mps {
                    self.classifier.observe_speed(speed, sample.timestamp_ms);
                }
                let reading = self.classifier.current_acceleration();
                let fused_stale = session.last_fused.is_none_or(|fused| {
                    sample.timestamp_ms.saturating_sub(fused.timestamp_ms) > stale_after_ms
                });
                let previous = session.last_anchor.replace(sample);
                let mut events = match previous {
                    Some(prev) if fused_stale => session
                        .lifecycle
                        .process_pair(&prev, &sample, &reading, false),
                    _ => Vec::new(),
                };
                events.push(TimingEvent::ProximityUpdate {
                    lines: session.lifecycle.proximity(sample.position()),
                });
                events
            }
        };

        if let Some(storage) = self.storage.as_mut() {
            for event in &events {
                if let TimingEvent::LapFinished { record, .. } = event
                    && let Err(e) = storage.append_lap(&session.session_id, record)
                {
                    warn!("Could not journal lap {}: {}", record.lap_index, e);
                }
            }
        }
        events
    }

    pub fn current_acceleration(&self) -> AccelerationReading {
        self.classifier.current_acceleration()
    }

    pub fn is_lap_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.lifecycle.is_lap_active())
    }

    pub fn current_lap_index(&self) -> Option<u32> {
        self.session
            .as_ref()
            .filter(|s| s.lifecycle.is_lap_active())
            .map(|s| s.lifecycle.current_lap_index())
    }

    pub fn lap_start_ms(&self) -> Option<u64> {
        self.session.as_ref()?.lifecycle.lap_start_ms()
    }

    /// Elapsed time of the lap in progress at `now_ms`, for display only.
    pub fn lap_elapsed_ms(&self, now_ms: u64) -> Option<u64> {
        self.session.as_ref()?.lifecycle.lap_elapsed_ms(now_ms)
    }

    pub fn laps(&self) -> &[LapRecord] {
        self.session
            .as_ref()
            .map(|s| s.lifecycle.laps())
            .unwrap_or_default()
    }

    pub fn best_lap_ms(&self) -> Option<u64> {
        self.session.as_ref()?.lifecycle.best_lap_ms()
    }

    pub fn last_lap_ms(&self) -> Option<u64> {
        self.session.as_ref()?.lifecycle.last_lap_ms()
    }

    pub fn trajectory(&self, lap_index: u32) -> Option<&[TrajectoryPoint]> {
        self.session
            .as_ref()?
            .lifecycle
            .recorder()
            .trajectory(lap_index)
    }

    pub fn compacted_state_changes(&self, lap_index: u32) -> Option<&[DrivingStateChange]> {
        self.session
            .as_ref()?
            .lifecycle
            .recorder()
            .state_changes(lap_index)
    }

    pub fn session_summary(&self) -> SessionSummary {
        summarize(self.laps())
    }
}
