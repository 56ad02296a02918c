use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::engine::{SessionRecord, TimingEngine};
use crate::errors::TimingError;
use crate::track::Track;

use super::{InertialSample, PositionSample, SampleRecord, StreamKind, TimingEvent};

/// Messages a host sends into the engine loop.
#[derive(Debug)]
pub enum EngineInput {
    Position(StreamKind, PositionSample),
    Inertial(InertialSample),
    StartSession(Box<Track>),
    SetTrack(Box<Track>),
    EndSession,
    ResetSession,
    Shutdown,
}

impl From<SampleRecord> for EngineInput {
    fn from(record: SampleRecord) -> Self {
        match record {
            SampleRecord::Anchor(sample) => EngineInput::Position(StreamKind::Anchor, sample),
            SampleRecord::Fused(sample) => EngineInput::Position(StreamKind::Fused, sample),
            SampleRecord::Inertial(sample) => EngineInput::Inertial(sample),
        }
    }
}

/// Everything the loop broadcasts, in the order it happened.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum TimingOutput {
    Event(TimingEvent),
    /// Live lap clock for displays; carries no timing authority
    ElapsedTick {
        lap_index: u32,
        elapsed_ms: u64,
    },
    SessionStarted {
        session_id: String,
    },
    SessionEnded(Box<SessionRecord>),
    Error {
        message: String,
    },
}

/// Sample-clock time of the most recent position fix and the wall clock when it arrived.
#[derive(Clone, Copy)]
struct SampleClock {
    timestamp_ms: u64,
    received: Instant,
}

impl SampleClock {
    fn now_ms(&self) -> u64 {
        self.timestamp_ms
            .saturating_add(self.received.elapsed().as_millis() as u64)
    }
}

fn handle_input(
    engine: &mut TimingEngine,
    input: EngineInput,
    clock: &mut Option<SampleClock>,
) -> Vec<TimingOutput> {
    let result = match input {
        EngineInput::Position(stream, sample) => {
            *clock = Some(SampleClock {
                timestamp_ms: sample.timestamp_ms,
                received: Instant::now(),
            });
            Ok(engine
                .push_position(stream, sample)
                .into_iter()
                .map(TimingOutput::Event)
                .collect())
        }
        EngineInput::Inertial(sample) => {
            engine.push_inertial(&sample);
            Ok(Vec::new())
        }
        EngineInput::StartSession(track) => engine
            .start_session(*track)
            .map(|session_id| vec![TimingOutput::SessionStarted { session_id }]),
        EngineInput::SetTrack(track) => engine.set_track(*track).map(|_| Vec::new()),
        EngineInput::EndSession => {
            *clock = None;
            match engine.end_session() {
                Ok(record) => Ok(vec![TimingOutput::SessionEnded(Box::new(record))]),
                Err(TimingError::SessionSaveFailed { record, source }) => {
                    error!("Session ended without being saved: {}", source);
                    Ok(vec![
                        TimingOutput::SessionEnded(record),
                        TimingOutput::Error {
                            message: source.to_string(),
                        },
                    ])
                }
                Err(e) => Err(e),
            }
        }
        EngineInput::ResetSession => engine
            .reset_session()
            .map(|session_id| vec![TimingOutput::SessionStarted { session_id }]),
        EngineInput::Shutdown => Ok(Vec::new()),
    };

    result.unwrap_or_else(|e| {
        error!("Timing engine rejected input: {}", e);
        vec![TimingOutput::Error {
            message: e.to_string(),
        }]
    })
}

fn emit(
    output: TimingOutput,
    outputs: &Sender<TimingOutput>,
    event_log: Option<&SyncSender<TimingOutput>>,
) -> Result<(), TimingError> {
    if let Some(log_sender) = event_log {
        match log_sender.try_send(output.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!("Event log queue is full, dropping {:?}", dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Event log writer is gone, output not logged");
            }
        }
    }

    outputs.send(output).map_err(|e| {
        error!("Could not send timing output: {}", e);
        TimingError::from(e)
    })
}

/// Serialized engine loop. Owns `engine` until the input channel closes or `Shutdown` arrives,
/// then hands it back. An elapsed tick is broadcast every `refresh_rate_ms` while a lap runs.
pub fn run_engine(
    mut engine: TimingEngine,
    inputs: Receiver<EngineInput>,
    outputs: Sender<TimingOutput>,
    event_log: Option<SyncSender<TimingOutput>>,
) -> Result<TimingEngine, TimingError> {
    let refresh_rate = Duration::from_millis(engine.config().refresh_rate_ms.max(1));
    let mut next_tick = Instant::now() + refresh_rate;
    let mut clock: Option<SampleClock> = None;

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match inputs.recv_timeout(timeout) {
            Ok(EngineInput::Shutdown) => {
                info!("Timing engine shutting down");
                break;
            }
            Ok(input) => {
                for output in handle_input(&mut engine, input, &mut clock) {
                    emit(output, &outputs, event_log.as_ref())?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("Timing engine inputs closed");
                break;
            }
        }

        if Instant::now() >= next_tick {
            next_tick = Instant::now() + refresh_rate;
            if let Some(clock) = clock
                && let (Some(lap_index), Some(elapsed_ms)) = (
                    engine.current_lap_index(),
                    engine.lap_elapsed_ms(clock.now_ms()),
                )
            {
                emit(
                    TimingOutput::ElapsedTick {
                        lap_index,
                        elapsed_ms,
                    },
                    &outputs,
                    event_log.as_ref(),
                )?;
            }
        }
    }

    Ok(engine)
}

pub struct EngineHandle {
    pub inputs: Sender<EngineInput>,
    pub outputs: Receiver<TimingOutput>,
    join: JoinHandle<Result<TimingEngine, TimingError>>,
}

impl EngineHandle {
    /// Wait for the loop to stop and take the engine back.
    pub fn join(self) -> Result<TimingEngine, TimingError> {
        drop(self.inputs);
        self.join
            .join()
            .map_err(|_| TimingError::EngineThreadPanicked)?
    }
}

/// Move `engine` onto its own thread behind `run_engine`.
pub fn spawn_engine(
    engine: TimingEngine,
    event_log: Option<SyncSender<TimingOutput>>,
) -> EngineHandle {
    let (input_tx, input_rx) = mpsc::channel::<EngineInput>();
    let (output_tx, output_rx) = mpsc::channel::<TimingOutput>();
    let join = thread::spawn(move || run_engine(engine, input_rx, output_tx, event_log));
    EngineHandle {
        inputs: input_tx,
        outputs: output_rx,
        join,
    }
}
