// Track and timing line definitions

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::TimingError;
use crate::geometry::{LatLon, LineSegment, compute_perpendicular_segment};

/// A timing line as the host defines it: a point on the track centerline plus two points that
/// give the local direction of travel. The physical line is perpendicular to that direction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TimingLine {
    /// Identifier, unique within a track
    pub id: String,
    /// Point on the centerline the line passes through
    pub center: LatLon,
    /// First point describing the direction of travel
    pub direction_p1: LatLon,
    /// Second point describing the direction of travel
    pub direction_p2: LatLon,
    /// Distance from the centerline to each end of the line
    pub half_width_m: f64,
}

impl TimingLine {
    pub fn new(
        id: impl Into<String>,
        center: LatLon,
        direction_p1: LatLon,
        direction_p2: LatLon,
        half_width_m: f64,
    ) -> Self {
        Self {
            id: id.into(),
            center,
            direction_p1,
            direction_p2,
            half_width_m,
        }
    }

    /// Materialize the line as a segment
    pub fn segment(&self) -> Result<LineSegment, TimingError> {
        compute_perpendicular_segment(
            self.center,
            self.direction_p1,
            self.direction_p2,
            self.half_width_m,
        )
        .map_err(|e| match e {
            TimingError::DegenerateGeometry { reason } => TimingError::DegenerateGeometry {
                reason: format!("line {}: {reason}", self.id),
            },
            other => other,
        })
    }
}

/// A racetrack layout: start line, optional finish line and the internal sector boundaries in
/// the order a lap crosses them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Track {
    /// Human-readable track name (e.g., "Laguna Seca")
    pub name: String,
    pub start_line: TimingLine,
    /// When absent the start line also acts as the finish line
    #[serde(default)]
    pub finish_line: Option<TimingLine>,
    /// Internal sector boundaries only, in lap order
    #[serde(default)]
    pub sectors: Vec<TimingLine>,
}

impl Track {
    /// Number of splits every finished lap carries
    pub fn split_count(&self) -> usize {
        self.sectors.len() + 1
    }

    /// Validate line ids and compute the segments for every line.
    pub fn geometry(&self) -> Result<TrackGeometry, TimingError> {
        if !self.start_line.center.is_valid() {
            return Err(TimingError::InvalidTrack {
                reason: format!("start line {} has invalid coordinates", self.start_line.id),
            });
        }

        let mut ids = HashSet::new();
        ids.insert(self.start_line.id.as_str());
        for line in &self.sectors {
            if !ids.insert(line.id.as_str()) {
                return Err(TimingError::InvalidTrack {
                    reason: format!("duplicate timing line id: {}", line.id),
                });
            }
        }
        if let Some(finish) = &self.finish_line
            && finish.id != self.start_line.id
            && !ids.insert(finish.id.as_str())
        {
            return Err(TimingError::InvalidTrack {
                reason: format!("duplicate timing line id: {}", finish.id),
            });
        }

        let start_segment = self.start_line.segment()?;
        let (finish_id, finish_segment) = match &self.finish_line {
            Some(finish) if finish.id != self.start_line.id => {
                (finish.id.clone(), finish.segment()?)
            }
            Some(finish) => {
                // reusing the start id only makes sense for the same physical line
                if !finish.segment()?.same_line_as(&start_segment) {
                    return Err(TimingError::InvalidTrack {
                        reason: format!(
                            "finish line reuses start line id {} at a different position",
                            finish.id
                        ),
                    });
                }
                (self.start_line.id.clone(), start_segment)
            }
            None => (self.start_line.id.clone(), start_segment),
        };
        let start_is_finish =
            finish_id == self.start_line.id || finish_segment.same_line_as(&start_segment);

        let (start_label, finish_label) = if start_is_finish {
            ("Start/Finish", "Start/Finish")
        } else {
            ("Start", "Finish")
        };

        let sectors = self
            .sectors
            .iter()
            .enumerate()
            .map(|(index, line)| {
                Ok(ComputedLine {
                    id: line.id.clone(),
                    role: LineRole::Sector(index),
                    label: format!("Sector {}", index + 1),
                    segment: line.segment()?,
                })
            })
            .collect::<Result<Vec<_>, TimingError>>()?;

        Ok(TrackGeometry {
            start: ComputedLine {
                id: self.start_line.id.clone(),
                role: LineRole::Start,
                label: start_label.to_string(),
                segment: start_segment,
            },
            finish: ComputedLine {
                id: finish_id,
                role: LineRole::Finish,
                label: finish_label.to_string(),
                segment: finish_segment,
            },
            sectors,
            start_is_finish,
        })
    }
}

/// Logical role a line plays in the lap.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LineRole {
    Start,
    Finish,
    /// Internal boundary, zero-based position in lap order
    Sector(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComputedLine {
    pub id: String,
    pub role: LineRole,
    pub label: String,
    pub segment: LineSegment,
}

/// Segments for every role of a track, computed once per session or track change.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackGeometry {
    pub start: ComputedLine,
    pub finish: ComputedLine,
    pub sectors: Vec<ComputedLine>,
    /// Start and finish are the same physical line
    pub start_is_finish: bool,
}

impl TrackGeometry {
    /// Every distinct physical line id, start first, sectors in lap order, finish last.
    pub fn line_ids(&self) -> Vec<&str> {
        let mut ids = vec![self.start.id.as_str()];
        ids.extend(self.sectors.iter().map(|s| s.id.as_str()));
        if self.finish.id != self.start.id {
            ids.push(self.finish.id.as_str());
        }
        ids
    }

    /// Lines shown in proximity displays; a shared start/finish line appears once.
    pub fn display_lines(&self) -> Vec<&ComputedLine> {
        let mut lines = vec![&self.start];
        lines.extend(self.sectors.iter());
        if self.finish.id != self.start.id {
            lines.push(&self.finish);
        }
        lines
    }

    pub fn sector_ids(&self) -> Vec<String> {
        self.sectors.iter().map(|s| s.id.clone()).collect()
    }
}
