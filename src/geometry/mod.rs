// Planar geometry helpers for timing lines
//
// All computations run in a local east/north plane produced by an equirectangular projection
// around a reference point. This is accurate to a few centimeters over track-scale distances and
// is not meant to be used across continents.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::errors::TimingError;

/// Mean earth radius used for both the local projection and haversine distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Direction points closer than this are considered identical.
const MIN_DIRECTION_LENGTH_M: f64 = 1e-3;

/// Cross products smaller than this (in m²) are treated as parallel segments.
const PARALLEL_EPSILON: f64 = 1e-12;

/// Slack allowed on the intersection parameters to absorb projection rounding.
const PARAM_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Meters east (`x`) and north (`y`) of a projection reference.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalPoint {
    pub x: f64,
    pub y: f64,
}

impl LocalPoint {
    fn sub(self, other: LocalPoint) -> LocalPoint {
        LocalPoint {
            x: self.x - other.x,
            y: self.y - other.y,
        }
    }

    fn cross(self, other: LocalPoint) -> f64 {
        self.x * other.y - self.y * other.x
    }

    fn dot(self, other: LocalPoint) -> f64 {
        self.x * other.x + self.y * other.y
    }

    fn length(self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// A timing line materialized as two lat/lon endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    pub start: LatLon,
    pub end: LatLon,
}

impl LineSegment {
    pub fn midpoint(&self) -> LatLon {
        interpolate(self.start, self.end, 0.5)
    }

    pub fn length_m(&self) -> f64 {
        let reference = self.midpoint();
        project_local(reference, self.end)
            .sub(project_local(reference, self.start))
            .length()
    }

    /// Returns true when both segments describe the same physical line, in either direction.
    pub fn same_line_as(&self, other: &LineSegment) -> bool {
        const TOLERANCE_DEG: f64 = 1e-9;
        let close = |a: LatLon, b: LatLon| {
            (a.lat - b.lat).abs() < TOLERANCE_DEG && (a.lon - b.lon).abs() < TOLERANCE_DEG
        };
        (close(self.start, other.start) && close(self.end, other.end))
            || (close(self.start, other.end) && close(self.end, other.start))
    }
}

pub fn project_local(reference: LatLon, point: LatLon) -> LocalPoint {
    let scale = reference.lat.to_radians().cos();
    LocalPoint {
        x: (point.lon - reference.lon).to_radians() * EARTH_RADIUS_M * scale,
        y: (point.lat - reference.lat).to_radians() * EARTH_RADIUS_M,
    }
}

pub fn unproject_local(reference: LatLon, point: LocalPoint) -> LatLon {
    let scale = reference.lat.to_radians().cos();
    LatLon {
        lat: reference.lat + (point.y / EARTH_RADIUS_M).to_degrees(),
        lon: reference.lon + (point.x / (EARTH_RADIUS_M * scale)).to_degrees(),
    }
}

/// Builds a segment through `center`, perpendicular to the direction `dir_p1 -> dir_p2`,
/// extending `half_width_m` to each side.
pub fn compute_perpendicular_segment(
    center: LatLon,
    dir_p1: LatLon,
    dir_p2: LatLon,
    half_width_m: f64,
) -> Result<LineSegment, TimingError> {
    if !half_width_m.is_finite() || half_width_m <= 0.0 {
        return Err(TimingError::DegenerateGeometry {
            reason: format!("half width must be positive, got {half_width_m}"),
        });
    }

    let direction = project_local(center, dir_p2).sub(project_local(center, dir_p1));
    let length = direction.length();
    if dir_p1 == dir_p2 || !length.is_finite() || length < MIN_DIRECTION_LENGTH_M {
        return Err(TimingError::DegenerateGeometry {
            reason: "direction points are identical".to_string(),
        });
    }

    let perpendicular = LocalPoint {
        x: -direction.y / length,
        y: direction.x / length,
    };
    let start = LocalPoint {
        x: perpendicular.x * half_width_m,
        y: perpendicular.y * half_width_m,
    };
    let end = LocalPoint {
        x: -perpendicular.x * half_width_m,
        y: -perpendicular.y * half_width_m,
    };

    Ok(LineSegment {
        start: unproject_local(center, start),
        end: unproject_local(center, end),
    })
}

/// Distance from `p` to the closest point of segment `a-b`, in meters.
pub fn distance_point_to_segment_m(p: LatLon, a: LatLon, b: LatLon) -> f64 {
    let point = project_local(a, p);
    let segment = project_local(a, b);
    let length_sq = segment.dot(segment);
    if length_sq == 0.0 {
        return point.length();
    }
    let t = (point.dot(segment) / length_sq).clamp(0.0, 1.0);
    let closest = LocalPoint {
        x: segment.x * t,
        y: segment.y * t,
    };
    point.sub(closest).length()
}

// The projection reference only depends on the set of points, never on their order, so the
// predicates below give identical answers when the two segments are swapped.
fn shared_reference(points: [LatLon; 4]) -> LatLon {
    LatLon {
        lat: points.iter().map(|p| p.lat).fold(f64::INFINITY, f64::min),
        lon: points.iter().map(|p| p.lon).fold(f64::INFINITY, f64::min),
    }
}

fn orientation(a: LocalPoint, b: LocalPoint, c: LocalPoint) -> f64 {
    b.sub(a).cross(c.sub(a))
}

pub fn segments_intersect(p1: LatLon, p2: LatLon, q1: LatLon, q2: LatLon) -> bool {
    let reference = shared_reference([p1, p2, q1, q2]);
    let [p1, p2, q1, q2] = [p1, p2, q1, q2].map(|p| project_local(reference, p));

    let o1 = orientation(p1, p2, q1);
    let o2 = orientation(p1, p2, q2);
    let o3 = orientation(q1, q2, p1);
    let o4 = orientation(q1, q2, p2);

    // collinear passes are ambiguous for timing and never count as a crossing
    if o1 == 0.0 && o2 == 0.0 && o3 == 0.0 && o4 == 0.0 {
        return false;
    }

    o1 * o2 <= 0.0 && o3 * o4 <= 0.0
}

/// Position of the intersection along `p1 -> p2` in `[0, 1]`, or `None` when the segments are
/// parallel, coincident, or do not meet.
pub fn intersection_param_t(p1: LatLon, p2: LatLon, q1: LatLon, q2: LatLon) -> Option<f64> {
    let reference = shared_reference([p1, p2, q1, q2]);
    let [p1, p2, q1, q2] = [p1, p2, q1, q2].map(|p| project_local(reference, p));

    let r = p2.sub(p1);
    let s = q2.sub(q1);
    let denominator = r.cross(s);
    if denominator.abs() < PARALLEL_EPSILON {
        return None;
    }

    let offset = q1.sub(p1);
    let t = offset.cross(s) / denominator;
    let u = offset.cross(r) / denominator;
    let in_range = |v: f64| (-PARAM_EPSILON..=1.0 + PARAM_EPSILON).contains(&v);
    if in_range(t) && in_range(u) {
        Some(t.clamp(0.0, 1.0))
    } else {
        None
    }
}

pub fn interpolate(a: LatLon, b: LatLon, t: f64) -> LatLon {
    LatLon {
        lat: a.lat + (b.lat - a.lat) * t,
        lon: a.lon + (b.lon - a.lon) * t,
    }
}

/// Great-circle distance in meters.
pub fn haversine_distance_m(a: LatLon, b: LatLon) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Sum of haversine distances between consecutive points.
pub fn path_length_m(points: impl IntoIterator<Item = LatLon>) -> f64 {
    points
        .into_iter()
        .tuple_windows()
        .map(|(a, b)| haversine_distance_m(a, b))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LAGUNA_SECA: LatLon = LatLon {
        lat: 36.584,
        lon: -121.753,
    };

    fn offset(base: LatLon, east_m: f64, north_m: f64) -> LatLon {
        unproject_local(base, LocalPoint { x: east_m, y: north_m })
    }

    #[test]
    fn test_projection_roundtrip() {
        let point = offset(LAGUNA_SECA, 250.0, -120.0);
        let local = project_local(LAGUNA_SECA, point);
        assert!((local.x - 250.0).abs() < 1e-6);
        assert!((local.y + 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_perpendicular_segment_for_northbound_track() {
        let dir_p1 = offset(LAGUNA_SECA, 0.0, -10.0);
        let dir_p2 = offset(LAGUNA_SECA, 0.0, 10.0);
        let segment = compute_perpendicular_segment(LAGUNA_SECA, dir_p1, dir_p2, 12.0).unwrap();

        let start = project_local(LAGUNA_SECA, segment.start);
        let end = project_local(LAGUNA_SECA, segment.end);
        assert!((start.x + 12.0).abs() < 1e-6, "start should lie west: {start:?}");
        assert!((end.x - 12.0).abs() < 1e-6, "end should lie east: {end:?}");
        assert!(start.y.abs() < 1e-6 && end.y.abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_segment_is_rejected() {
        let result = compute_perpendicular_segment(LAGUNA_SECA, LAGUNA_SECA, LAGUNA_SECA, 10.0);
        assert!(matches!(result, Err(TimingError::DegenerateGeometry { .. })));

        let dir_p2 = offset(LAGUNA_SECA, 0.0, 10.0);
        for half_width in [0.0, -3.0, f64::NAN] {
            let result = compute_perpendicular_segment(LAGUNA_SECA, LAGUNA_SECA, dir_p2, half_width);
            assert!(matches!(result, Err(TimingError::DegenerateGeometry { .. })));
        }
    }

    #[test]
    fn test_distance_is_clamped_to_segment() {
        let a = offset(LAGUNA_SECA, -10.0, 0.0);
        let b = offset(LAGUNA_SECA, 10.0, 0.0);

        let above = offset(LAGUNA_SECA, 3.0, 7.0);
        assert!((distance_point_to_segment_m(above, a, b) - 7.0).abs() < 1e-3);

        // beyond the east end the distance is measured to the endpoint, not the infinite line
        let beyond = offset(LAGUNA_SECA, 13.0, 4.0);
        assert!((distance_point_to_segment_m(beyond, a, b) - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_intersection_parameter() {
        let p1 = offset(LAGUNA_SECA, 0.0, -10.0);
        let p2 = offset(LAGUNA_SECA, 0.0, 30.0);
        let q1 = offset(LAGUNA_SECA, -5.0, 0.0);
        let q2 = offset(LAGUNA_SECA, 5.0, 0.0);

        assert!(segments_intersect(p1, p2, q1, q2));
        let t = intersection_param_t(p1, p2, q1, q2).unwrap();
        assert!((t - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_parallel_and_collinear_segments_do_not_cross() {
        let p1 = offset(LAGUNA_SECA, 0.0, 0.0);
        let p2 = offset(LAGUNA_SECA, 10.0, 0.0);
        let parallel_1 = offset(LAGUNA_SECA, 0.0, 1.0);
        let parallel_2 = offset(LAGUNA_SECA, 10.0, 1.0);
        assert!(!segments_intersect(p1, p2, parallel_1, parallel_2));
        assert_eq!(intersection_param_t(p1, p2, parallel_1, parallel_2), None);

        let overlapping = offset(LAGUNA_SECA, 5.0, 0.0);
        let overlapping_end = offset(LAGUNA_SECA, 15.0, 0.0);
        assert_eq!(intersection_param_t(p1, p2, overlapping, overlapping_end), None);
    }

    #[test]
    fn test_haversine_and_path_length() {
        let north = offset(LAGUNA_SECA, 0.0, 1000.0);
        let distance = haversine_distance_m(LAGUNA_SECA, north);
        assert!((distance - 1000.0).abs() < 0.5);

        let path = [LAGUNA_SECA, north, LAGUNA_SECA];
        assert!((path_length_m(path) - 2.0 * distance).abs() < 1e-6);
        assert_eq!(path_length_m([LAGUNA_SECA]), 0.0);
    }

    fn local_point() -> impl Strategy<Value = (f64, f64)> {
        (-500.0..500.0f64, -500.0..500.0f64)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_perpendicular_segment_is_centered(
            lat in -60.0..60.0f64,
            lon in -179.0..179.0f64,
            (x1, y1) in local_point(),
            (dx, dy) in local_point(),
            half_width in 0.5..50.0f64,
        ) {
            prop_assume!(dx.hypot(dy) > 1.0);
            let center = LatLon::new(lat, lon);
            let dir_p1 = offset(center, x1, y1);
            let dir_p2 = offset(center, x1 + dx, y1 + dy);

            let segment = compute_perpendicular_segment(center, dir_p1, dir_p2, half_width).unwrap();
            let midpoint = project_local(center, segment.midpoint());
            prop_assert!(midpoint.length() < 1e-3, "midpoint drifted {:?}", midpoint);
            prop_assert!((segment.length_m() - 2.0 * half_width).abs() < 1e-3 * half_width.max(1.0));
        }

        #[test]
        fn prop_segments_intersect_is_symmetric(
            (x1, y1) in local_point(),
            (x2, y2) in local_point(),
            (x3, y3) in local_point(),
            (x4, y4) in local_point(),
        ) {
            let p1 = offset(LAGUNA_SECA, x1, y1);
            let p2 = offset(LAGUNA_SECA, x2, y2);
            let q1 = offset(LAGUNA_SECA, x3, y3);
            let q2 = offset(LAGUNA_SECA, x4, y4);
            prop_assert_eq!(segments_intersect(p1, p2, q1, q2), segments_intersect(q1, q2, p1, p2));
        }

        #[test]
        fn prop_intersection_param_is_bounded(
            (x1, y1) in local_point(),
            (x2, y2) in local_point(),
            (x3, y3) in local_point(),
            (x4, y4) in local_point(),
        ) {
            let p1 = offset(LAGUNA_SECA, x1, y1);
            let p2 = offset(LAGUNA_SECA, x2, y2);
            let q1 = offset(LAGUNA_SECA, x3, y3);
            let q2 = offset(LAGUNA_SECA, x4, y4);
            if let Some(t) = intersection_param_t(p1, p2, q1, q2) {
                prop_assert!((0.0..=1.0).contains(&t));
            }
        }
    }
}
