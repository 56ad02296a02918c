use log::{debug, info, warn};

use crate::config::{DetectorConfig, LifecycleConfig};
use crate::geometry::{LatLon, path_length_m};
use crate::track::{LineRole, TrackGeometry};
use crate::trajectory::recorder::max_speed_mps;
use crate::trajectory::{
    ChangeKind, DrivingStateChange, ReferenceLap, TrajectoryPoint, TrajectoryRecorder,
};

use super::classifier::AccelerationReading;
use super::crossing::{CrossingDetector, LineCrossing};
use super::lap::{LapClock, LapRecord};
use super::{LineProximity, PositionSample, TimingEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LapPhase {
    NoLap,
    LapActive,
    /// A finish is being recorded; other crossings are ignored until it completes
    Finishing,
}

/// Sequences start, sector and finish crossings into laps.
///
/// Owns the crossing detector, the split bookkeeping of the lap in progress, and the trajectory
/// recorder. Every completed lap is kept as an immutable [`LapRecord`].
pub struct LapLifecycle {
    detector: CrossingDetector,
    clock: LapClock,
    recorder: TrajectoryRecorder,
    phase: LapPhase,
    lap_index: u32,
    laps: Vec<LapRecord>,
    best_lap_ms: Option<u64>,
    last_lap_ms: Option<u64>,
    reference: Option<ReferenceLap>,
    sector_ids: Vec<String>,
    config: LifecycleConfig,
}

impl LapLifecycle {
    pub fn new(
        geometry: TrackGeometry,
        detector_config: DetectorConfig,
        config: LifecycleConfig,
    ) -> Self {
        let sector_ids = geometry.sector_ids();
        Self {
            detector: CrossingDetector::new(geometry, detector_config),
            clock: LapClock::default(),
            recorder: TrajectoryRecorder::new(),
            phase: LapPhase::NoLap,
            lap_index: 0,
            laps: Vec::new(),
            best_lap_ms: None,
            last_lap_ms: None,
            reference: None,
            sector_ids,
            config,
        }
    }

    pub fn phase(&self) -> LapPhase {
        self.phase
    }

    pub fn is_lap_active(&self) -> bool {
        self.phase == LapPhase::LapActive
    }

    /// Index of the lap in progress, or of the last lap started.
    pub fn current_lap_index(&self) -> u32 {
        self.lap_index
    }

    pub fn lap_start_ms(&self) -> Option<u64> {
        self.clock.lap_start_ms()
    }

    pub fn lap_elapsed_ms(&self, now_ms: u64) -> Option<u64> {
        self.clock.elapsed_ms(now_ms)
    }

    pub fn laps(&self) -> &[LapRecord] {
        &self.laps
    }

    pub fn best_lap_ms(&self) -> Option<u64> {
        self.best_lap_ms
    }

    pub fn last_lap_ms(&self) -> Option<u64> {
        self.last_lap_ms
    }

    pub fn detector(&self) -> &CrossingDetector {
        &self.detector
    }

    pub fn recorder(&self) -> &TrajectoryRecorder {
        &self.recorder
    }

    pub fn proximity(&self, position: LatLon) -> Vec<LineProximity> {
        self.detector.proximity(position)
    }

    /// Process two consecutive samples from one stream.
    ///
    /// Arming is refreshed first. Without a lap only the start line is tested. With a lap the
    /// finish line goes first, and when it fires the sector lines are not tested for this pair.
    /// The current sample is added to the lap trajectory when `record_point` is set.
    pub fn process_pair(
        &mut self,
        prev: &PositionSample,
        cur: &PositionSample,
        reading: &AccelerationReading,
        record_point: bool,
    ) -> Vec<TimingEvent> {
        let mut events = Vec::new();
        self.detector.update_arming(cur.position(), cur.timestamp_ms);

        match self.phase {
            LapPhase::NoLap => {
                if let Some(crossing) = self.detector.try_fire(LineRole::Start, prev, cur) {
                    let speed = crossing_speed(prev, cur, crossing.fraction);
                    events.push(self.start_lap(&crossing, speed, reading));
                }
            }
            LapPhase::LapActive => {
                if let Some(crossing) = self.detector.try_fire(LineRole::Finish, prev, cur) {
                    let speed = crossing_speed(prev, cur, crossing.fraction);
                    events.extend(self.finish_lap(&crossing, speed, reading));
                } else {
                    for index in 0..self.sector_ids.len() {
                        if let Some(crossing) =
                            self.detector.try_fire(LineRole::Sector(index), prev, cur)
                        {
                            events.extend(self.mark_sector_crossing(
                                &crossing.line_id,
                                index,
                                crossing.t_ms,
                            ));
                        }
                    }
                }
            }
            LapPhase::Finishing => {
                debug!("Finish in progress, skipping samples at {}ms", cur.timestamp_ms);
            }
        }

        if record_point && self.phase == LapPhase::LapActive {
            self.recorder.record(TrajectoryPoint {
                lat: cur.lat,
                lon: cur.lon,
                timestamp_ms: cur.timestamp_ms,
                speed_mps: cur.speed_mps.unwrap_or(0.),
                accuracy_m: cur.accuracy_m.unwrap_or(0.),
                driving_state: reading.state,
                longitudinal_g: reading.longitudinal_g,
                lateral_g: reading.lateral_g,
            });
        }
        events
    }

    pub fn start_lap(
        &mut self,
        crossing: &LineCrossing,
        speed_mps: f64,
        reading: &AccelerationReading,
    ) -> TimingEvent {
        self.begin_lap(crossing, speed_mps, reading, None)
    }

    fn begin_lap(
        &mut self,
        crossing: &LineCrossing,
        speed_mps: f64,
        reading: &AccelerationReading,
        rearm_not_before_ms: Option<u64>,
    ) -> TimingEvent {
        self.lap_index += 1;
        self.clock.start(crossing.t_ms);
        self.detector.rearm_sectors(rearm_not_before_ms);
        self.recorder.begin_lap(
            self.lap_index,
            DrivingStateChange::at_crossing(
                ChangeKind::LapStart,
                crossing.t_ms,
                crossing.position,
                speed_mps,
                reading,
            ),
        );
        self.phase = LapPhase::LapActive;
        info!("Lap {} started at {}ms", self.lap_index, crossing.t_ms);

        TimingEvent::LapStarted {
            lap_index: self.lap_index,
            t_ms: crossing.t_ms,
        }
    }

    /// Record a sector boundary. A line that already has a split in this lap is ignored.
    pub fn mark_sector_crossing(
        &mut self,
        line_id: &str,
        sector_index: usize,
        t_ms: u64,
    ) -> Option<TimingEvent> {
        if self.phase != LapPhase::LapActive {
            return None;
        }
        let Some(split_ms) = self.clock.mark_sector(line_id, t_ms) else {
            debug!("Sector {} already timed in lap {}", line_id, self.lap_index);
            return None;
        };
        let lap_elapsed_ms = self.clock.elapsed_ms(t_ms).unwrap_or(split_ms);
        info!(
            "Lap {} sector {} split {}ms (elapsed {}ms)",
            self.lap_index,
            sector_index + 1,
            split_ms,
            lap_elapsed_ms
        );

        Some(TimingEvent::SectorSplit {
            lap_index: self.lap_index,
            sector_index,
            sector_id: line_id.to_string(),
            split_ms,
            lap_elapsed_ms,
            delta_ms: self.delta_at(sector_index, lap_elapsed_ms),
        })
    }

    fn delta_at(&self, sector_index: usize, lap_elapsed_ms: u64) -> Option<i64> {
        if !self.config.delta_to_best {
            return None;
        }
        self.reference
            .as_ref()
            .and_then(|reference| reference.delta_at(sector_index, lap_elapsed_ms))
    }

    /// Close the lap in progress. Ignored unless a lap is active and no other finish is being
    /// recorded. When start and finish share a line the next lap starts at the same instant.
    pub fn finish_lap(
        &mut self,
        crossing: &LineCrossing,
        speed_mps: f64,
        reading: &AccelerationReading,
    ) -> Vec<TimingEvent> {
        if self.phase != LapPhase::LapActive {
            debug!(
                "Ignoring finish at {}ms, lap phase is {:?}",
                crossing.t_ms, self.phase
            );
            return Vec::new();
        }
        self.phase = LapPhase::Finishing;

        let Some(finished) = self.clock.finish(crossing.t_ms, &self.sector_ids) else {
            warn!("Finish fired without a lap start, ignoring");
            self.phase = LapPhase::NoLap;
            return Vec::new();
        };

        let end_marker = DrivingStateChange::at_crossing(
            ChangeKind::LapEnd,
            crossing.t_ms,
            crossing.position,
            speed_mps,
            reading,
        );
        let (distance_m, max_speed, state_changes) = match self.recorder.end_lap(end_marker) {
            Some(trajectory) => (
                path_length_m(trajectory.points.iter().map(|p| p.position())),
                max_speed_mps(&trajectory.points),
                trajectory.state_changes.clone(),
            ),
            None => (0., 0., Vec::new()),
        };

        let record = LapRecord {
            lap_index: self.lap_index,
            started_at_ms: finished.started_at_ms,
            finished_at_ms: crossing.t_ms,
            lap_time_ms: finished.lap_time_ms,
            sector_splits_ms: finished.sector_splits_ms,
            backfilled_sectors: finished.backfilled_sectors,
            distance_m,
            max_speed_mps: max_speed,
            state_changes,
        };

        let final_index = self.sector_ids.len();
        let final_split = TimingEvent::SectorSplit {
            lap_index: record.lap_index,
            sector_index: final_index,
            sector_id: crossing.line_id.clone(),
            split_ms: record.sector_splits_ms[final_index],
            lap_elapsed_ms: record.lap_time_ms,
            delta_ms: self.delta_at(final_index, record.lap_time_ms),
        };

        let new_best = self
            .best_lap_ms
            .is_none_or(|best| record.lap_time_ms < best);
        if new_best {
            self.best_lap_ms = Some(record.lap_time_ms);
            if record.is_complete() {
                self.reference = Some(ReferenceLap::from_record(&record));
            }
        }
        self.last_lap_ms = Some(record.lap_time_ms);
        info!(
            "Lap {} finished in {}ms, splits {:?}{}",
            record.lap_index,
            record.lap_time_ms,
            record.sector_splits_ms,
            if new_best { " (best)" } else { "" }
        );
        self.laps.push(record.clone());

        let mut events = vec![final_split, TimingEvent::LapFinished { record, new_best }];
        if self.detector.geometry().start_is_finish {
            let settle_until = crossing.t_ms.saturating_add(self.config.settle_delay_ms);
            events.push(self.begin_lap(crossing, speed_mps, reading, Some(settle_until)));
        } else {
            self.phase = LapPhase::NoLap;
        }
        events
    }

    /// Drop the lap in progress without recording it.
    pub fn abort_lap(&mut self) {
        if self.phase != LapPhase::NoLap {
            info!("Discarding lap {} in progress", self.lap_index);
        }
        self.clock.clear();
        self.recorder.discard_active();
        self.phase = LapPhase::NoLap;
    }

    /// Swap the timing lines. The lap in progress is discarded and every line re-armed.
    /// Completed laps stay, but the best lap and delta reference start over on the new layout.
    pub fn set_geometry(&mut self, geometry: TrackGeometry, detector_config: DetectorConfig) {
        self.abort_lap();
        self.best_lap_ms = None;
        self.reference = None;
        self.sector_ids = geometry.sector_ids();
        self.detector = CrossingDetector::new(geometry, detector_config);
    }

    /// Forget every lap and arming state.
    pub fn reset(&mut self) {
        self.abort_lap();
        self.detector.reset();
        self.recorder.clear();
        self.laps.clear();
        self.lap_index = 0;
        self.best_lap_ms = None;
        self.last_lap_ms = None;
        self.reference = None;
    }
}

fn crossing_speed(prev: &PositionSample, cur: &PositionSample, fraction: f64) -> f64 {
    match (prev.speed_mps, cur.speed_mps) {
        (Some(a), Some(b)) => a + (b - a) * fraction,
        (Some(speed), None) | (None, Some(speed)) => speed,
        (None, None) => 0.,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{LocalPoint, unproject_local};
    use crate::track::{TimingLine, Track};

    const BASE: LatLon = LatLon {
        lat: 49.3278,
        lon: 8.5657,
    };

    fn at(north_m: f64) -> LatLon {
        unproject_local(BASE, LocalPoint { x: 0.0, y: north_m })
    }

    fn sample(north_m: f64, t_ms: u64) -> PositionSample {
        let p = at(north_m);
        PositionSample::new(p.lat, p.lon, t_ms).with_speed(40.0)
    }

    fn line_at(id: &str, north_m: f64) -> TimingLine {
        TimingLine::new(id, at(north_m), at(north_m - 5.0), at(north_m + 5.0), 15.0)
    }

    fn sprint() -> LapLifecycle {
        let track = Track {
            name: "Hockenheim".to_string(),
            start_line: line_at("start", 0.0),
            finish_line: Some(line_at("finish", 2_000.0)),
            sectors: vec![line_at("s1", 1_000.0)],
        };
        LapLifecycle::new(
            track.geometry().unwrap(),
            DetectorConfig::default(),
            LifecycleConfig::default(),
        )
    }

    fn crossing(line_id: &str, role: LineRole, t_ms: u64) -> LineCrossing {
        LineCrossing {
            line_id: line_id.to_string(),
            role,
            t_ms,
            position: BASE,
            fraction: 0.5,
        }
    }

    #[test]
    fn test_finish_without_lap_is_ignored() {
        let mut lifecycle = sprint();
        let events = lifecycle.finish_lap(
            &crossing("finish", LineRole::Finish, 5_000),
            0.0,
            &AccelerationReading::default(),
        );
        assert!(events.is_empty());
        assert!(lifecycle.laps().is_empty());
        assert_eq!(lifecycle.phase(), LapPhase::NoLap);
    }

    #[test]
    fn test_second_finish_is_ignored() {
        let mut lifecycle = sprint();
        let reading = AccelerationReading::default();
        lifecycle.start_lap(&crossing("start", LineRole::Start, 0), 0.0, &reading);
        let first = lifecycle.finish_lap(&crossing("finish", LineRole::Finish, 60_000), 0.0, &reading);
        let second = lifecycle.finish_lap(&crossing("finish", LineRole::Finish, 60_010), 0.0, &reading);

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(lifecycle.laps().len(), 1);
    }

    #[test]
    fn test_sector_is_idempotent() {
        let mut lifecycle = sprint();
        let reading = AccelerationReading::default();
        lifecycle.start_lap(&crossing("start", LineRole::Start, 1_000), 0.0, &reading);

        let split = lifecycle.mark_sector_crossing("s1", 0, 31_000);
        assert!(matches!(
            split,
            Some(TimingEvent::SectorSplit { split_ms: 30_000, lap_elapsed_ms: 30_000, .. })
        ));
        assert!(lifecycle.mark_sector_crossing("s1", 0, 33_000).is_none());
    }

    #[test]
    fn test_samples_drive_a_full_lap() {
        let mut lifecycle = sprint();
        let reading = AccelerationReading::default();
        let path = [
            sample(-10.0, 0),
            sample(10.0, 1_000),
            sample(500.0, 15_000),
            sample(990.0, 30_500),
            sample(1_010.0, 31_500),
            sample(1_500.0, 50_000),
            sample(1_990.0, 92_500),
            sample(2_010.0, 93_500),
        ];

        let events: Vec<TimingEvent> = path
            .windows(2)
            .flat_map(|pair| lifecycle.process_pair(&pair[0], &pair[1], &reading, true))
            .collect();

        assert!(matches!(events[0], TimingEvent::LapStarted { lap_index: 1, t_ms: 500 }));
        let record = lifecycle.laps()[0].clone();
        assert_eq!(record.lap_time_ms, 92_500);
        assert_eq!(record.sector_splits_ms, vec![30_500, 62_000]);
        assert_eq!(lifecycle.phase(), LapPhase::NoLap);
        assert_eq!(lifecycle.best_lap_ms(), Some(92_500));

        // every sample after the start crossing up to the finish is on the trajectory
        assert_eq!(lifecycle.recorder().trajectory(1).unwrap().len(), 6);
        assert!(record.distance_m > 1_900.0);
        assert!(matches!(
            events.last(),
            Some(TimingEvent::LapFinished { new_best: true, .. })
        ));
    }

    #[test]
    fn test_new_layout_does_not_compare_against_old_reference() {
        let mut lifecycle = sprint();
        let reading = AccelerationReading::default();
        lifecycle.start_lap(&crossing("start", LineRole::Start, 0), 0.0, &reading);
        lifecycle.mark_sector_crossing("s1", 0, 30_000);
        lifecycle.finish_lap(&crossing("finish", LineRole::Finish, 92_000), 0.0, &reading);
        assert_eq!(lifecycle.best_lap_ms(), Some(92_000));

        let no_sectors = Track {
            name: "Hockenheim Short".to_string(),
            start_line: line_at("start", 0.0),
            finish_line: Some(line_at("finish", 2_000.0)),
            sectors: vec![],
        };
        lifecycle.set_geometry(no_sectors.geometry().unwrap(), DetectorConfig::default());
        assert_eq!(lifecycle.best_lap_ms(), None);
        assert_eq!(lifecycle.laps().len(), 1);

        lifecycle.start_lap(&crossing("start", LineRole::Start, 100_000), 0.0, &reading);
        let events =
            lifecycle.finish_lap(&crossing("finish", LineRole::Finish, 195_000), 0.0, &reading);
        assert!(matches!(
            events[0],
            TimingEvent::SectorSplit { sector_index: 0, split_ms: 95_000, delta_ms: None, .. }
        ));
        assert!(matches!(
            events[1],
            TimingEvent::LapFinished { new_best: true, .. }
        ));
        assert_eq!(lifecycle.best_lap_ms(), Some(95_000));
    }

    #[test]
    fn test_shared_line_restart_near_clock_limit() {
        let track = Track {
            name: "Oval".to_string(),
            start_line: line_at("sf", 0.0),
            finish_line: None,
            sectors: vec![],
        };
        let mut lifecycle = LapLifecycle::new(
            track.geometry().unwrap(),
            DetectorConfig::default(),
            LifecycleConfig::default(),
        );
        let reading = AccelerationReading::default();
        lifecycle.start_lap(&crossing("sf", LineRole::Start, u64::MAX - 60_000), 0.0, &reading);
        let events =
            lifecycle.finish_lap(&crossing("sf", LineRole::Finish, u64::MAX - 10), 0.0, &reading);

        assert!(matches!(
            events.last(),
            Some(TimingEvent::LapStarted { lap_index: 2, .. })
        ));
        assert_eq!(lifecycle.laps()[0].lap_time_ms, 59_990);
        assert!(lifecycle.is_lap_active());
    }

    #[test]
    fn test_abort_discards_partial_lap() {
        let mut lifecycle = sprint();
        let reading = AccelerationReading::default();
        lifecycle.process_pair(&sample(-10.0, 0), &sample(10.0, 1_000), &reading, true);
        assert!(lifecycle.is_lap_active());

        lifecycle.abort_lap();
        assert!(!lifecycle.is_lap_active());
        assert!(lifecycle.recorder().trajectory(1).is_none());
        assert!(lifecycle.laps().is_empty());
    }
}
