// Library interface for trackday
// This allows integration tests and benchmarks to access internal modules

pub mod config;
pub mod engine;
pub mod errors;
pub mod geometry;
pub mod storage;
pub mod timing;
pub mod track;
pub mod trajectory;
pub mod writer;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{SessionRecord, TimingEngine};
pub use errors::TimingError;
pub use geometry::LatLon;
pub use storage::{FileBasedStorage, MemoryStorage, SessionStorage, TrackStorage};
pub use timing::collector::{EngineInput, TimingOutput};
pub use timing::{LapRecord, PositionSample, SampleRecord, StreamKind, TimingEvent};
pub use track::{TimingLine, Track};
pub use trajectory::SessionSummary;
