use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    thread,
};

use clap::{Parser, Subcommand};
use itertools::Itertools;
use log::{error, info, warn};
use uom::si::f64::Velocity;
use uom::si::velocity::{kilometer_per_hour, meter_per_second};

use trackday::{
    EngineConfig, EngineInput, FileBasedStorage, LapRecord, SessionStorage, SessionSummary,
    TimingEngine, TimingError, TimingEvent, TimingOutput, Track, TrackStorage,
    timing::collector::spawn_engine,
    timing::source::{JsonLinesSource, pump},
    trajectory::LapDelta,
    trajectory::aggregate::{best_lap, ranked, summarize},
    trajectory::recorder::state_change_count,
    writer,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Directory for sessions and tracks, defaults to the platform data directory
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Time a session from recorded or piped samples
    Run {
        #[arg(short, long)]
        track: PathBuf,

        /// JSON Lines samples, read from stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Write every engine output to a JSON Lines event log
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List stored sessions
    Sessions,
    /// Print the summary of a stored session
    Summary {
        #[arg(long)]
        session: String,
    },
    /// List stored tracks
    Tracks,
}

fn open_storage(storage: Option<&Path>) -> Result<FileBasedStorage, TimingError> {
    match storage {
        Some(path) => FileBasedStorage::new(path.to_path_buf()),
        None => FileBasedStorage::new_default(),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, TimingError> {
    match path {
        Some(path) => EngineConfig::from_file(path),
        None => Ok(EngineConfig::from_local_file()
            .unwrap_or_else(|e| {
                warn!("Ignoring unreadable config file: {}", e);
                None
            })
            .unwrap_or_default()),
    }
}

fn load_track(path: &Path) -> Result<Track, TimingError> {
    let invalid = || TimingError::InvalidInputFile {
        path: format!("{:?}", path),
    };
    let file = File::open(path).map_err(|e| {
        error!("Could not open track file: {}", e);
        invalid()
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| {
        error!("Could not parse track file: {}", e);
        invalid()
    })
}

fn format_lap_time(ms: u64) -> String {
    format!("{}:{:02}.{:03}", ms / 60_000, (ms / 1_000) % 60, ms % 1_000)
}

fn print_lap(record: &LapRecord, new_best: bool) {
    let splits = record
        .sector_splits_ms
        .iter()
        .enumerate()
        .map(|(i, split)| {
            let marker = if record.is_backfilled(i) { "*" } else { "" };
            format!("{}{}", format_lap_time(*split), marker)
        })
        .join(" | ");
    let top_speed = Velocity::new::<meter_per_second>(record.max_speed_mps);
    println!(
        "Lap {:>3}  {}{}  [{}]  {:.0} km/h  {} state changes",
        record.lap_index,
        format_lap_time(record.lap_time_ms),
        if new_best { " (best)" } else { "" },
        splits,
        top_speed.get::<kilometer_per_hour>(),
        state_change_count(&record.state_changes)
    );
}

fn print_summary(summary: &SessionSummary) {
    let time_or_dash = |ms: Option<u64>| ms.map(format_lap_time).unwrap_or_else(|| "-".into());
    println!("Laps:     {}", summary.lap_count);
    println!("Best:     {}", time_or_dash(summary.best_lap_ms));
    println!("Average:  {}", time_or_dash(summary.average_lap_ms));
    println!("Optimal:  {}", time_or_dash(summary.optimal_lap_ms));
    println!(
        "Sectors:  {}",
        summary
            .best_sectors_ms
            .iter()
            .map(|ms| time_or_dash(*ms))
            .join(" | ")
    );
    println!("Distance: {:.2} km", summary.total_distance_m / 1_000.0);
}

fn run(
    track_path: &Path,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    config_path: Option<&Path>,
    storage: Option<&Path>,
) -> Result<(), TimingError> {
    let config = load_config(config_path)?;
    let track = load_track(track_path)?;
    let mut storage = open_storage(storage)?;
    storage.save_track(&track)?;

    // with an output file the engine loop also feeds a bounded queue drained by the writer thread
    let (event_log, writer_thread) = match output {
        Some(output_file) => {
            let (log_tx, log_rx) = writer::event_log_channel(config.event_log_depth);
            let handle = thread::spawn(move || writer::write_events(&output_file, log_rx));
            (Some(log_tx), Some(handle))
        }
        None => (None, None),
    };

    let engine = TimingEngine::new(config).with_storage(Box::new(storage));
    let handle = spawn_engine(engine, event_log);
    handle
        .inputs
        .send(EngineInput::StartSession(Box::new(track)))?;

    let interrupt_inputs = handle.inputs.clone();
    ctrlc::set_handler(move || {
        println!("Exiting...");
        let _ = interrupt_inputs.send(EngineInput::EndSession);
        let _ = interrupt_inputs.send(EngineInput::Shutdown);
    })
    .map_err(|e| TimingError::SampleSourceError {
        description: format!("Could not set Ctrl-C handler: {}", e),
    })?;

    let pump_inputs = handle.inputs.clone();
    let pump_thread = thread::spawn(move || {
        let result = match input {
            Some(path) => JsonLinesSource::from_file(&path).and_then(|s| pump(s, &pump_inputs)),
            None => pump(JsonLinesSource::new(io::stdin().lock()), &pump_inputs),
        };
        let _ = pump_inputs.send(EngineInput::EndSession);
        let _ = pump_inputs.send(EngineInput::Shutdown);
        result
    });

    for output in handle.outputs.iter() {
        match output {
            TimingOutput::SessionStarted { session_id } => println!("Session {}", session_id),
            TimingOutput::Event(TimingEvent::LapFinished { record, new_best }) => {
                print_lap(&record, new_best)
            }
            TimingOutput::SessionEnded(record) => {
                println!();
                print_summary(&record.summary);
            }
            TimingOutput::Error { message } => eprintln!("{}", message),
            _ => {}
        }
    }

    handle.join()?;
    // an interrupted run may leave the pump blocked on stdin
    if pump_thread.is_finished() {
        match pump_thread.join() {
            Ok(Ok(samples)) => info!("Processed {} samples", samples),
            Ok(Err(e)) => eprintln!("Input stopped early: {}", e),
            Err(_) => return Err(TimingError::EngineThreadPanicked),
        }
    }
    if let Some(writer_thread) = writer_thread {
        writer_thread
            .join()
            .map_err(|_| TimingError::EngineThreadPanicked)??;
    }
    Ok(())
}

fn sessions(storage: Option<&Path>) -> Result<(), TimingError> {
    for session_id in open_storage(storage)?.list_sessions()? {
        println!("{}", session_id);
    }
    Ok(())
}

fn summary(session_id: &str, storage: Option<&Path>) -> Result<(), TimingError> {
    let storage = open_storage(storage)?;
    let (laps, summary) = match storage.load_session(session_id)? {
        Some(record) => (record.laps, record.summary),
        None => {
            // sessions that never ended only have their lap journal
            let laps = storage.journaled_laps(session_id)?;
            if laps.is_empty() {
                return Err(TimingError::InvalidInputFile {
                    path: session_id.to_string(),
                });
            }
            let summary = summarize(&laps);
            (laps, summary)
        }
    };

    let best = best_lap(&laps);
    for lap in &laps {
        print_lap(lap, best.is_some_and(|b| b.lap_index == lap.lap_index));
    }

    if let Some(best) = best {
        println!();
        for lap in ranked(&laps).into_iter().skip(1) {
            let delta = LapDelta::between(best, lap);
            println!(
                "Lap {:>3}  {:+.3}s  [{}]",
                lap.lap_index,
                delta.lap_delta_ms as f64 / 1_000.0,
                delta
                    .sector_deltas_ms
                    .iter()
                    .map(|d| format!("{:+.3}", *d as f64 / 1_000.0))
                    .join(" | ")
            );
        }
    }
    println!();
    print_summary(&summary);
    Ok(())
}

fn tracks(storage: Option<&Path>) -> Result<(), TimingError> {
    for track_name in open_storage(storage)?.list_tracks()? {
        println!("{}", track_name);
    }
    Ok(())
}

fn main() {
    #[cfg(debug_assertions)]
    colog::init();

    let cli = Args::parse();
    let storage = cli.storage.as_deref();
    let result = match cli.command {
        Commands::Run {
            track,
            input,
            output,
            config,
        } => run(&track, input, output, config.as_deref(), storage),
        Commands::Sessions => sessions(storage),
        Commands::Summary { session } => summary(&session, storage),
        Commands::Tracks => tracks(storage),
    };

    if let Err(e) = result {
        error!("{:?}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
