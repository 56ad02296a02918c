// Track definitions
// A track is a set of timing lines; the geometry of each line is computed once per session

pub mod types;

// Re-export commonly used types
pub use types::{ComputedLine, LineRole, TimingLine, Track, TrackGeometry};
