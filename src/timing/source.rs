use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc::Sender;

use log::{debug, error, info};
use serde_jsonlines::JsonLinesReader;

use crate::errors::TimingError;

use super::SampleRecord;
use super::collector::EngineInput;

/// Owned producer of position and inertial samples.
///
/// # Lifecycle
///
/// 1. Call `start()` to open the underlying device or file
/// 2. Call `next_sample()` until it returns `Ok(None)`
/// 3. Call `stop()` to release the source; a stopped source yields no more samples
pub trait SampleSource {
    fn start(&mut self) -> Result<(), TimingError>;

    /// The next sample, or `None` once the source is exhausted or stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the source was never started or a record cannot be decoded.
    fn next_sample(&mut self) -> Result<Option<SampleRecord>, TimingError>;

    fn stop(&mut self);
}

/// Replays `SampleRecord`s from a JSON Lines stream, one record per line.
pub struct JsonLinesSource<R: BufRead> {
    reader: Option<JsonLinesReader<R>>,
    pending: Option<R>,
    line_no: usize,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: None,
            pending: Some(reader),
            line_no: 0,
        }
    }
}

impl JsonLinesSource<BufReader<File>> {
    pub fn from_file(path: &Path) -> Result<Self, TimingError> {
        let file = File::open(path).map_err(|e| {
            error!("Could not open sample file {:?}: {}", path, e);
            TimingError::InvalidInputFile {
                path: format!("{:?}", path),
            }
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> SampleSource for JsonLinesSource<R> {
    fn start(&mut self) -> Result<(), TimingError> {
        if let Some(reader) = self.pending.take() {
            self.reader = Some(JsonLinesReader::new(reader));
        }
        Ok(())
    }

    fn next_sample(&mut self) -> Result<Option<SampleRecord>, TimingError> {
        let Some(reader) = self.reader.as_mut() else {
            if self.pending.is_some() {
                return Err(TimingError::SampleSourceError {
                    description: "Source was not started".to_string(),
                });
            }
            return Ok(None);
        };

        self.line_no += 1;
        reader
            .read::<SampleRecord>()
            .map_err(|e| TimingError::SampleSourceError {
                description: format!("Could not read sample on line {}: {}", self.line_no, e),
            })
    }

    fn stop(&mut self) {
        self.reader = None;
        self.pending = None;
    }
}

/// Replays samples from memory.
#[derive(Default)]
pub struct VecSource {
    samples: Vec<SampleRecord>,
    cursor: usize,
    started: bool,
}

impl VecSource {
    pub fn from_samples(samples: Vec<SampleRecord>) -> Self {
        Self {
            samples,
            cursor: 0,
            started: false,
        }
    }
}

impl SampleSource for VecSource {
    fn start(&mut self) -> Result<(), TimingError> {
        self.started = true;
        Ok(())
    }

    fn next_sample(&mut self) -> Result<Option<SampleRecord>, TimingError> {
        if !self.started {
            return Ok(None);
        }
        let sample = self.samples.get(self.cursor).copied();
        self.cursor += 1;
        Ok(sample)
    }

    fn stop(&mut self) {
        self.started = false;
    }
}

/// Drain `source` into the engine loop. Returns the number of samples forwarded.
pub fn pump(
    mut source: impl SampleSource,
    inputs: &Sender<EngineInput>,
) -> Result<usize, TimingError> {
    source.start()?;
    let mut forwarded = 0;
    let result = loop {
        match source.next_sample() {
            Ok(Some(sample)) => {
                if let Err(e) = inputs.send(EngineInput::from(sample)) {
                    break Err(TimingError::from(e));
                }
                forwarded += 1;
            }
            Ok(None) => break Ok(forwarded),
            Err(e) => break Err(e),
        }
    };
    source.stop();

    match &result {
        Ok(count) => info!("Sample source exhausted after {} samples", count),
        Err(e) => debug!("Sample source stopped early: {}", e),
    }
    result
}
