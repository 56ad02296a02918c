// Error types for trackday

use crate::engine::SessionRecord;
use crate::timing::collector::{EngineInput, TimingOutput};
use snafu::Snafu;
use std::{io, sync::mpsc::SendError};

#[derive(Debug, Snafu)]
pub enum TimingError {
    // Track geometry errors
    #[snafu(display("Degenerate timing line geometry: {reason}"))]
    DegenerateGeometry { reason: String },
    #[snafu(display("Invalid track configuration: {reason}"))]
    InvalidTrack { reason: String },

    // Session lifecycle errors
    #[snafu(display("No timing session is active"))]
    NoActiveSession,
    #[snafu(display("A timing session is already active for track {track_name}"))]
    SessionAlreadyActive { track_name: String },
    #[snafu(display("Session {} ended but could not be saved", record.session_id))]
    SessionSaveFailed {
        record: Box<SessionRecord>,
        source: Box<TimingError>,
    },

    // Errors while moving samples and events between threads
    #[snafu(display("Sample source error: {description}"))]
    SampleSourceError { description: String },
    #[snafu(display("Error sending input to the timing engine"))]
    EngineInputError { source: Box<SendError<EngineInput>> },
    #[snafu(display("Error broadcasting timing output"))]
    OutputBroadcastError {
        source: Box<SendError<TimingOutput>>,
    },
    #[snafu(display("Timing engine thread stopped unexpectedly"))]
    EngineThreadPanicked,

    // Errors for the event log writer
    #[snafu(display("Error writing event log"))]
    WriterError { source: io::Error },

    // Config management errors
    #[snafu(display("Could not find application data directory"))]
    NoConfigDir,
    #[snafu(display("Error reading or writing config file"))]
    ConfigIOError { source: io::Error },
    #[snafu(display("Error serializing config file"))]
    ConfigSerializeError { source: serde_json::Error },

    // Storage errors
    #[snafu(display("Storage IO error: {operation}"))]
    StorageIOError { operation: String, source: io::Error },
    #[snafu(display("Storage serialization error: {operation}"))]
    StorageSerializeError {
        operation: String,
        source: serde_json::Error,
    },

    // Input file errors
    #[snafu(display("Invalid input file: {path}"))]
    InvalidInputFile { path: String },
}

impl From<SendError<TimingOutput>> for TimingError {
    fn from(value: SendError<TimingOutput>) -> Self {
        TimingError::OutputBroadcastError {
            source: Box::new(value),
        }
    }
}

impl From<SendError<EngineInput>> for TimingError {
    fn from(value: SendError<EngineInput>) -> Self {
        TimingError::EngineInputError {
            source: Box::new(value),
        }
    }
}
