// Integration tests for session persistence through the file-based storage
//
// Runs real sessions through the engine, then reopens the storage directory the way a later
// process would.

use tempfile::TempDir;

use trackday::geometry::{LocalPoint, unproject_local};
use trackday::{
    EngineConfig, FileBasedStorage, LatLon, PositionSample, SessionStorage, StreamKind,
    TimingEngine, TimingLine, Track, TrackStorage,
};

const BASE: LatLon = LatLon {
    lat: 45.6156,
    lon: 9.2811,
};

fn at(north_m: f64) -> LatLon {
    unproject_local(BASE, LocalPoint { x: 0.0, y: north_m })
}

fn fix(north_m: f64, t_ms: u64) -> PositionSample {
    let p = at(north_m);
    PositionSample::new(p.lat, p.lon, t_ms).with_speed(60.0)
}

fn line_at(id: &str, north_m: f64) -> TimingLine {
    TimingLine::new(id, at(north_m), at(north_m - 5.0), at(north_m + 5.0), 12.0)
}

fn monza_sprint() -> Track {
    Track {
        name: "Monza Sprint".to_string(),
        start_line: line_at("start", 0.0),
        finish_line: Some(line_at("finish", 1_200.0)),
        sectors: vec![line_at("s1", 600.0)],
    }
}

/// One straight-line run from start to finish at 60 m/s, sampled every second.
fn run_lap(engine: &mut TimingEngine, t0_ms: u64) {
    for step in 0..=22u64 {
        let north_m = -30.0 + step as f64 * 60.0;
        engine.push_position(StreamKind::Fused, fix(north_m, t0_ms + step * 1_000));
    }
}

#[test]
fn test_session_survives_reopening_storage() {
    let temp_dir = TempDir::new().unwrap();
    let storage = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();
    let mut engine = TimingEngine::new(EngineConfig::default()).with_storage(Box::new(storage));

    let session_id = engine.start_session(monza_sprint()).unwrap();
    run_lap(&mut engine, 0);
    assert_eq!(engine.laps().len(), 1);

    // while the session runs only the lap journal exists
    let reader = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();
    assert!(reader.load_session(&session_id).unwrap().is_none());
    let journaled = reader.journaled_laps(&session_id).unwrap();
    assert_eq!(journaled, engine.laps().to_vec());

    let record = engine.end_session().unwrap();

    let reopened = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();
    assert_eq!(reopened.list_sessions().unwrap(), vec![session_id.clone()]);
    let stored = reopened.load_session(&session_id).unwrap().unwrap();
    assert_eq!(stored, record);
    assert_eq!(stored.summary.lap_count, 1);
    assert_eq!(stored.laps[0].lap_time_ms, 20_000);
    assert_eq!(stored.laps[0].sector_splits_ms, vec![10_000, 10_000]);
    assert!(reopened.journaled_laps(&session_id).unwrap().is_empty());
}

#[test]
fn test_delete_session_removes_record_and_journal() {
    let temp_dir = TempDir::new().unwrap();
    let storage = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();
    let mut engine = TimingEngine::new(EngineConfig::default()).with_storage(Box::new(storage));

    let first = engine.start_session(monza_sprint()).unwrap();
    run_lap(&mut engine, 0);
    engine.end_session().unwrap();

    let mut storage = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();
    storage.delete_session(&first).unwrap();
    assert!(storage.list_sessions().unwrap().is_empty());
    assert!(storage.load_session(&first).unwrap().is_none());
}

#[test]
fn test_tracks_are_stored_by_normalized_name() {
    let temp_dir = TempDir::new().unwrap();
    let mut storage = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();

    storage.save_track(&monza_sprint()).unwrap();
    assert!(temp_dir.path().join("tracks").join("monza_sprint.json").exists());

    let reopened = FileBasedStorage::new(temp_dir.path().to_path_buf()).unwrap();
    assert_eq!(reopened.list_tracks().unwrap(), vec!["monza_sprint".to_string()]);
    let track = reopened.load_track("Monza Sprint").unwrap().unwrap();
    assert_eq!(track, monza_sprint());
    assert_eq!(track.split_count(), 2);
}
