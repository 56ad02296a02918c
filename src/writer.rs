use std::{
    fs::File,
    io::BufWriter,
    path::Path,
    sync::mpsc::{self, Receiver, SyncSender},
};

use log::{error, info};
use serde_jsonlines::JsonLinesWriter;

use crate::{TimingError, timing::collector::TimingOutput};

/// Bounded queue between the engine loop and `write_events`.
pub fn event_log_channel(depth: usize) -> (SyncSender<TimingOutput>, Receiver<TimingOutput>) {
    mpsc::sync_channel(depth.max(1))
}

/// Drain `receiver` into a JSON Lines file until every sender is gone.
pub fn write_events(file: &Path, receiver: Receiver<TimingOutput>) -> Result<(), TimingError> {
    let events_file = File::create(file).map_err(|e| TimingError::WriterError { source: e })?;
    let mut writer = JsonLinesWriter::new(BufWriter::new(events_file));
    let mut written = 0usize;
    for output in &receiver {
        match writer.write(&output) {
            Ok(()) => written += 1,
            Err(e) => error!("Error while writing event to log file: {}", e),
        }
    }
    writer
        .flush()
        .map_err(|e| TimingError::WriterError { source: e })?;
    info!("Wrote {} events to {:?}", written, file);
    Ok(())
}
