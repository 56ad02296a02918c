use std::collections::HashMap;

use log::debug;

use crate::config::DetectorConfig;
use crate::geometry::{
    LatLon, LineSegment, distance_point_to_segment_m, interpolate, intersection_param_t,
    segments_intersect,
};
use crate::track::{ComputedLine, LineRole, TrackGeometry};

use super::{LineProximity, PositionSample};

/// Interpolated time at which the path `p1 -> p2` crosses the line, or `None` when it does not.
/// The result always lies in `[t_prev, t_cur]`.
pub fn calculate_crossing_time(
    t_prev: u64,
    t_cur: u64,
    p1: LatLon,
    p2: LatLon,
    line_start: LatLon,
    line_end: LatLon,
) -> Option<u64> {
    crossing_fraction(p1, p2, line_start, line_end).map(|t| interpolate_time(t_prev, t_cur, t))
}

fn crossing_fraction(p1: LatLon, p2: LatLon, line_start: LatLon, line_end: LatLon) -> Option<f64> {
    if !segments_intersect(p1, p2, line_start, line_end) {
        return None;
    }
    intersection_param_t(p1, p2, line_start, line_end)
}

fn interpolate_time(t_prev: u64, t_cur: u64, fraction: f64) -> u64 {
    // out-of-order samples collapse to a zero-length interval
    let elapsed = t_cur.saturating_sub(t_prev);
    let offset = (fraction.clamp(0.0, 1.0) * elapsed as f64).round() as u64;
    t_prev + offset.min(elapsed)
}

/// Arming bookkeeping for one physical line.
#[derive(Clone, Debug, PartialEq)]
pub struct LineArmingState {
    pub armed: bool,
    pub last_crossing_ms: Option<u64>,
    /// Pending timed re-arm, set while a restarted lap settles
    pub rearm_not_before_ms: Option<u64>,
}

impl Default for LineArmingState {
    fn default() -> Self {
        Self {
            armed: true,
            last_crossing_ms: None,
            rearm_not_before_ms: None,
        }
    }
}

/// A line that fired.
#[derive(Clone, Debug, PartialEq)]
pub struct LineCrossing {
    pub line_id: String,
    pub role: LineRole,
    pub t_ms: u64,
    /// Interpolated position where the path met the line
    pub position: LatLon,
    /// Fraction of the sample pair at which the crossing happened
    pub fraction: f64,
}

/// Tracks which timing lines are ready to fire and turns sample pairs into crossings.
///
/// A line fires at most once per pass: firing disarms it, and it only re-arms after a sample
/// reports a distance to the line of at least `rearm_distance_m`. Accepted crossings must also be
/// more than the role's debounce window apart.
pub struct CrossingDetector {
    geometry: TrackGeometry,
    states: HashMap<String, LineArmingState>,
    config: DetectorConfig,
}

impl CrossingDetector {
    pub fn new(geometry: TrackGeometry, config: DetectorConfig) -> Self {
        let states = geometry
            .line_ids()
            .into_iter()
            .map(|id| (id.to_string(), LineArmingState::default()))
            .collect();
        Self {
            geometry,
            states,
            config,
        }
    }

    pub fn geometry(&self) -> &TrackGeometry {
        &self.geometry
    }

    /// Arm every line and forget previous crossings.
    pub fn reset(&mut self) {
        for state in self.states.values_mut() {
            *state = LineArmingState::default();
        }
    }

    pub fn arming_state(&self, line_id: &str) -> Option<&LineArmingState> {
        self.states.get(line_id)
    }

    pub fn is_armed(&self, line_id: &str) -> bool {
        self.states.get(line_id).is_some_and(|s| s.armed)
    }

    fn debounce_ms(&self, role: LineRole) -> u64 {
        match role {
            LineRole::Start => self.config.start_debounce_ms,
            LineRole::Finish => self.config.finish_debounce_ms,
            LineRole::Sector(_) => self.config.sector_debounce_ms,
        }
    }

    fn line(&self, role: LineRole) -> Option<&ComputedLine> {
        match role {
            LineRole::Start => Some(&self.geometry.start),
            LineRole::Finish => Some(&self.geometry.finish),
            LineRole::Sector(index) => self.geometry.sectors.get(index),
        }
    }

    /// Re-arm disarmed lines the position has moved far enough away from. Runs on every sample,
    /// before any crossing test.
    pub fn update_arming(&mut self, position: LatLon, t_ms: u64) {
        let rearm_distance_m = self.config.rearm_distance_m;
        for line in self.geometry.display_lines() {
            let Some(state) = self.states.get_mut(&line.id) else {
                continue;
            };
            if let Some(not_before) = state.rearm_not_before_ms {
                if t_ms >= not_before {
                    state.armed = true;
                    state.rearm_not_before_ms = None;
                    debug!("{} re-armed after settle delay", line.label);
                }
                continue;
            }
            if state.armed {
                continue;
            }
            let distance =
                distance_point_to_segment_m(position, line.segment.start, line.segment.end);
            if distance >= rearm_distance_m {
                state.armed = true;
                debug!("{} re-armed at {:.1}m", line.label, distance);
            }
        }
        if self.geometry.start_is_finish && self.geometry.start.id != self.geometry.finish.id {
            // both roles describe one physical line, keep their states identical
            if let Some(start) = self.states.get(&self.geometry.start.id).cloned() {
                self.states.insert(self.geometry.finish.id.clone(), start);
            }
        }
    }

    /// Test one role against the sample pair and fire it when armed and outside its debounce
    /// window.
    pub fn try_fire(
        &mut self,
        role: LineRole,
        prev: &PositionSample,
        cur: &PositionSample,
    ) -> Option<LineCrossing> {
        let debounce_ms = self.debounce_ms(role);
        let line = self.line(role)?;
        let state = self.states.get(&line.id)?;
        if !state.armed {
            return None;
        }

        let (p1, p2) = (prev.position(), cur.position());
        let fraction = crossing_fraction(p1, p2, line.segment.start, line.segment.end)?;
        let t_ms = interpolate_time(prev.timestamp_ms, cur.timestamp_ms, fraction);

        if let Some(last) = state.last_crossing_ms
            && t_ms.saturating_sub(last) <= debounce_ms
        {
            debug!(
                "Ignoring {} crossing at {}ms, within {}ms of the previous one",
                line.label, t_ms, debounce_ms
            );
            return None;
        }

        let crossing = LineCrossing {
            line_id: line.id.clone(),
            role,
            t_ms,
            position: interpolate(p1, p2, fraction),
            fraction,
        };
        self.disarm(&crossing.line_id, t_ms);
        Some(crossing)
    }

    fn disarm(&mut self, line_id: &str, t_ms: u64) {
        let mut ids = vec![line_id.to_string()];
        if self.geometry.start_is_finish {
            if line_id == self.geometry.start.id {
                ids.push(self.geometry.finish.id.clone());
            } else if line_id == self.geometry.finish.id {
                ids.push(self.geometry.start.id.clone());
            }
        }
        for id in ids {
            if let Some(state) = self.states.get_mut(&id) {
                state.armed = false;
                state.last_crossing_ms = Some(t_ms);
                state.rearm_not_before_ms = None;
            }
        }
    }

    /// Re-arm all sector lines, immediately or once samples reach `not_before_ms`.
    pub fn rearm_sectors(&mut self, not_before_ms: Option<u64>) {
        for sector in &self.geometry.sectors {
            if let Some(state) = self.states.get_mut(&sector.id) {
                match not_before_ms {
                    Some(at) => {
                        state.armed = false;
                        state.rearm_not_before_ms = Some(at);
                    }
                    None => {
                        state.armed = true;
                        state.rearm_not_before_ms = None;
                    }
                }
            }
        }
    }

    pub fn proximity(&self, position: LatLon) -> Vec<LineProximity> {
        self.geometry
            .display_lines()
            .into_iter()
            .map(|line| LineProximity {
                line_id: line.id.clone(),
                label: line.label.clone(),
                distance_m: distance_to(position, &line.segment),
                armed: self.is_armed(&line.id),
            })
            .collect()
    }
}

fn distance_to(position: LatLon, segment: &LineSegment) -> f64 {
    distance_point_to_segment_m(position, segment.start, segment.end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{LocalPoint, unproject_local};
    use crate::track::{TimingLine, Track};
    use proptest::prelude::*;

    const BASE: LatLon = LatLon {
        lat: 52.0786,
        lon: -1.0169,
    };

    fn at(east_m: f64, north_m: f64) -> LatLon {
        unproject_local(BASE, LocalPoint { x: east_m, y: north_m })
    }

    fn sample(north_m: f64, t_ms: u64) -> PositionSample {
        let p = at(0.0, north_m);
        PositionSample::new(p.lat, p.lon, t_ms)
    }

    fn line_at(id: &str, north_m: f64) -> TimingLine {
        TimingLine::new(
            id,
            at(0.0, north_m),
            at(0.0, north_m - 5.0),
            at(0.0, north_m + 5.0),
            15.0,
        )
    }

    fn detector(finish: Option<TimingLine>) -> CrossingDetector {
        let track = Track {
            name: "Silverstone".to_string(),
            start_line: line_at("start", 0.0),
            finish_line: finish,
            sectors: vec![line_at("s1", 500.0)],
        };
        CrossingDetector::new(track.geometry().unwrap(), DetectorConfig::default())
    }

    #[test]
    fn test_crossing_time_is_interpolated() {
        let line_start = at(-10.0, 0.0);
        let line_end = at(10.0, 0.0);
        let t = calculate_crossing_time(1_000, 2_000, at(0.0, -2.5), at(0.0, 7.5), line_start, line_end);
        assert_eq!(t, Some(1_250));

        let missed = calculate_crossing_time(1_000, 2_000, at(0.0, 1.0), at(0.0, 7.5), line_start, line_end);
        assert_eq!(missed, None);
    }

    #[test]
    fn test_regressing_timestamps_clamp_to_previous() {
        let t = calculate_crossing_time(2_000, 1_000, at(0.0, -5.0), at(0.0, 5.0), at(-10.0, 0.0), at(10.0, 0.0));
        assert_eq!(t, Some(2_000));
    }

    #[test]
    fn test_fire_disarms_until_rearm_distance() {
        let mut detector = detector(Some(line_at("finish", 1000.0)));
        let crossing = detector
            .try_fire(LineRole::Start, &sample(-5.0, 0), &sample(5.0, 1_000))
            .unwrap();
        assert_eq!(crossing.t_ms, 500);
        assert!(!detector.is_armed("start"));

        // jitter back and forth across the line while still close to it
        detector.update_arming(at(0.0, -5.0), 10_000);
        assert!(detector
            .try_fire(LineRole::Start, &sample(5.0, 9_000), &sample(-5.0, 10_000))
            .is_none());

        detector.update_arming(at(0.0, 30.0), 20_000);
        assert!(detector.is_armed("start"));
    }

    #[test]
    fn test_debounce_rejects_quick_second_crossing() {
        let mut detector = detector(Some(line_at("finish", 1000.0)));
        detector
            .try_fire(LineRole::Sector(0), &sample(495.0, 0), &sample(505.0, 1_000))
            .unwrap();
        detector.update_arming(at(0.0, 600.0), 1_200);
        assert!(detector.is_armed("s1"));

        // far enough to re-arm, but the second pass is inside the sector debounce window
        let second = detector.try_fire(LineRole::Sector(0), &sample(505.0, 1_300), &sample(495.0, 1_700));
        assert!(second.is_none());
        assert!(detector.is_armed("s1"));
    }

    #[test]
    fn test_shared_start_finish_is_coupled() {
        let mut detector = detector(Some(line_at("finish", 0.0)));
        assert!(detector.geometry().start_is_finish);

        detector
            .try_fire(LineRole::Start, &sample(-5.0, 0), &sample(5.0, 1_000))
            .unwrap();
        assert!(!detector.is_armed("start"));
        assert!(!detector.is_armed("finish"));
        assert_eq!(
            detector.arming_state("finish").unwrap().last_crossing_ms,
            Some(500)
        );

        detector.update_arming(at(0.0, 400.0), 30_000);
        assert!(detector.is_armed("start") && detector.is_armed("finish"));
    }

    #[test]
    fn test_timed_sector_rearm() {
        let mut detector = detector(None);
        detector.rearm_sectors(Some(1_050));
        assert!(!detector.is_armed("s1"));
        detector.update_arming(at(0.0, 499.0), 1_040);
        assert!(!detector.is_armed("s1"));
        detector.update_arming(at(0.0, 499.0), 1_050);
        assert!(detector.is_armed("s1"));
    }

    #[test]
    fn test_proximity_lists_shared_line_once() {
        let detector = detector(None);
        let proximity = detector.proximity(at(0.0, 100.0));
        assert_eq!(proximity.len(), 2);
        assert_eq!(proximity[0].label, "Start/Finish");
        assert!((proximity[0].distance_m - 100.0).abs() < 0.01);
        assert!((proximity[1].distance_m - 400.0).abs() < 0.01);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_crossing_time_within_sample_interval(
            t_prev in 0u64..1_000_000_000,
            dt in 0u64..60_000,
            y1 in -50.0..50.0f64,
            y2 in -50.0..50.0f64,
            x1 in -8.0..8.0f64,
            x2 in -8.0..8.0f64,
        ) {
            let t_cur = t_prev + dt;
            if let Some(t) = calculate_crossing_time(
                t_prev, t_cur, at(x1, y1), at(x2, y2), at(-10.0, 0.0), at(10.0, 0.0),
            ) {
                prop_assert!(t >= t_prev && t <= t_cur);
            }
        }

        #[test]
        fn prop_no_refire_before_rearm(
            jitter in proptest::collection::vec(-15.0..15.0f64, 2..40),
        ) {
            let mut detector = detector(Some(line_at("finish", 1000.0)));
            detector.try_fire(LineRole::Start, &sample(-5.0, 0), &sample(5.0, 1_000)).unwrap();

            // every jittery sample stays inside the rearm distance, so nothing may fire
            let mut prev = sample(5.0, 1_000);
            for (i, north) in jitter.into_iter().enumerate() {
                let cur = sample(north, 10_000 + i as u64 * 10_000);
                detector.update_arming(cur.position(), cur.timestamp_ms);
                prop_assert!(detector.try_fire(LineRole::Start, &prev, &cur).is_none());
                prev = cur;
            }
        }

        #[test]
        fn prop_debounce_allows_single_fire(gap in 0u64..=5_000) {
            let mut detector = detector(Some(line_at("finish", 1000.0)));
            let mut fired = 0;
            if detector.try_fire(LineRole::Start, &sample(-5.0, 0), &sample(5.0, 1_000)).is_some() {
                fired += 1;
            }
            // re-arm by distance, then cross again within the start debounce window
            detector.update_arming(at(0.0, 200.0), 500 + gap / 2);
            let back = sample(-5.0, 500 + gap);
            if detector.try_fire(LineRole::Start, &sample(5.0, 500 + gap / 2), &back).is_some() {
                fired += 1;
            }
            prop_assert_eq!(fired, 1);
        }
    }
}
