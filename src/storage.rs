// Storage port for sessions and tracks

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::engine::SessionRecord;
use crate::errors::TimingError;
use crate::timing::LapRecord;
use crate::track::Track;

const SESSIONS_DIR: &str = "sessions";
const TRACKS_DIR: &str = "tracks";
const LAP_JOURNAL_SUFFIX: &str = ".laps.jsonl";

/// Where finished sessions go. The engine only hands records over; the format is up to the
/// implementation.
pub trait SessionStorage {
    /// Save a finalized session, replacing any earlier copy
    fn save_session(&mut self, record: &SessionRecord) -> Result<(), TimingError>;

    fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TimingError>;

    /// List stored session ids
    fn list_sessions(&self) -> Result<Vec<String>, TimingError>;

    fn delete_session(&mut self, session_id: &str) -> Result<(), TimingError>;

    /// Journal a lap of a session that is still running
    fn append_lap(&mut self, session_id: &str, lap: &LapRecord) -> Result<(), TimingError>;

    /// Laps journaled for a session that never got saved
    fn journaled_laps(&self, session_id: &str) -> Result<Vec<LapRecord>, TimingError>;
}

pub trait TrackStorage {
    fn save_track(&mut self, track: &Track) -> Result<(), TimingError>;

    fn load_track(&self, track_name: &str) -> Result<Option<Track>, TimingError>;

    fn list_tracks(&self) -> Result<Vec<String>, TimingError>;

    fn delete_track(&mut self, track_name: &str) -> Result<(), TimingError>;
}

/// Normalize names for consistent file naming
fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn io_error(operation: &str, source: std::io::Error) -> TimingError {
    TimingError::StorageIOError {
        operation: operation.to_string(),
        source,
    }
}

fn serialize_error(operation: &str, source: serde_json::Error) -> TimingError {
    TimingError::StorageSerializeError {
        operation: operation.to_string(),
        source,
    }
}

/// JSON documents under a base directory: `sessions/<id>.json`, a JSON Lines lap journal per
/// running session, and `tracks/<name>.json`.
pub struct FileBasedStorage {
    storage_path: PathBuf,
    /// In-memory cache of loaded sessions
    cache: HashMap<String, SessionRecord>,
}

impl FileBasedStorage {
    pub fn new(storage_path: PathBuf) -> Result<Self, TimingError> {
        for dir in [SESSIONS_DIR, TRACKS_DIR] {
            let path = storage_path.join(dir);
            if !path.exists() {
                fs::create_dir_all(&path).map_err(|e| io_error("create storage directory", e))?;
            }
        }

        Ok(Self {
            storage_path,
            cache: HashMap::new(),
        })
    }

    /// Create storage in the default application data directory
    pub fn new_default() -> Result<Self, TimingError> {
        Self::new(Self::default_storage_path()?)
    }

    pub fn default_storage_path() -> Result<PathBuf, TimingError> {
        let app_data_dir = dirs::data_dir().ok_or(TimingError::NoConfigDir)?;
        Ok(app_data_dir.join("trackday"))
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.storage_path
            .join(SESSIONS_DIR)
            .join(format!("{}.json", normalize_name(session_id)))
    }

    fn journal_path(&self, session_id: &str) -> PathBuf {
        self.storage_path
            .join(SESSIONS_DIR)
            .join(format!("{}{}", normalize_name(session_id), LAP_JOURNAL_SUFFIX))
    }

    fn track_path(&self, track_name: &str) -> PathBuf {
        self.storage_path
            .join(TRACKS_DIR)
            .join(format!("{}.json", normalize_name(track_name)))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), TimingError> {
        let json = serde_json::to_string_pretty(value).map_err(|e| serialize_error("serialize", e))?;

        // write next to the target and rename, so a crash never leaves half a file behind
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|e| io_error("write temporary file", e))?;
        fs::rename(&temp_path, path).map_err(|e| io_error("replace file", e))
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, TimingError> {
        if !path.exists() {
            debug!("No stored file at {:?}", path);
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| io_error("read file", e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| serialize_error("deserialize", e))
    }

    fn list_json_stems(dir: &Path) -> Result<Vec<String>, TimingError> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map_err(|e| io_error("list directory", e))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().to_string();
                file_name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }
}

impl SessionStorage for FileBasedStorage {
    fn save_session(&mut self, record: &SessionRecord) -> Result<(), TimingError> {
        let path = self.session_path(&record.session_id);
        Self::write_json(&path, record)?;

        // the saved record supersedes the journal
        let journal = self.journal_path(&record.session_id);
        if journal.exists() {
            fs::remove_file(&journal).map_err(|e| io_error("remove lap journal", e))?;
        }

        self.cache
            .insert(record.session_id.clone(), record.clone());
        info!("Saved session {} to {:?}", record.session_id, path);
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TimingError> {
        if let Some(record) = self.cache.get(session_id) {
            return Ok(Some(record.clone()));
        }
        Self::read_json(&self.session_path(session_id))
    }

    fn list_sessions(&self) -> Result<Vec<String>, TimingError> {
        Self::list_json_stems(&self.storage_path.join(SESSIONS_DIR))
    }

    fn delete_session(&mut self, session_id: &str) -> Result<(), TimingError> {
        self.cache.remove(session_id);
        for path in [self.session_path(session_id), self.journal_path(session_id)] {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| io_error("delete session", e))?;
            }
        }
        Ok(())
    }

    fn append_lap(&mut self, session_id: &str, lap: &LapRecord) -> Result<(), TimingError> {
        serde_jsonlines::append_json_lines(self.journal_path(session_id), [lap])
            .map_err(|e| io_error("append lap", e))?;
        debug!("Journaled lap {} of session {}", lap.lap_index, session_id);
        Ok(())
    }

    fn journaled_laps(&self, session_id: &str) -> Result<Vec<LapRecord>, TimingError> {
        let path = self.journal_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        serde_jsonlines::json_lines(&path)
            .map_err(|e| io_error("open lap journal", e))?
            .collect::<Result<Vec<LapRecord>, std::io::Error>>()
            .map_err(|e| {
                warn!("Lap journal {:?} is unreadable: {}", path, e);
                io_error("read lap journal", e)
            })
    }
}

impl TrackStorage for FileBasedStorage {
    fn save_track(&mut self, track: &Track) -> Result<(), TimingError> {
        track.geometry()?;
        Self::write_json(&self.track_path(&track.name), track)
    }

    fn load_track(&self, track_name: &str) -> Result<Option<Track>, TimingError> {
        Self::read_json(&self.track_path(track_name))
    }

    fn list_tracks(&self) -> Result<Vec<String>, TimingError> {
        Self::list_json_stems(&self.storage_path.join(TRACKS_DIR))
    }

    fn delete_track(&mut self, track_name: &str) -> Result<(), TimingError> {
        let path = self.track_path(track_name);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| io_error("delete track", e))?;
        }
        Ok(())
    }
}

/// Keeps everything in memory; for tests and hosts that persist records themselves.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: HashMap<String, SessionRecord>,
    journals: HashMap<String, Vec<LapRecord>>,
    tracks: HashMap<String, Track>,
}

impl SessionStorage for MemoryStorage {
    fn save_session(&mut self, record: &SessionRecord) -> Result<(), TimingError> {
        self.journals.remove(&record.session_id);
        self.sessions
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, TimingError> {
        Ok(self.sessions.get(session_id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<String>, TimingError> {
        let mut ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete_session(&mut self, session_id: &str) -> Result<(), TimingError> {
        self.sessions.remove(session_id);
        self.journals.remove(session_id);
        Ok(())
    }

    fn append_lap(&mut self, session_id: &str, lap: &LapRecord) -> Result<(), TimingError> {
        self.journals
            .entry(session_id.to_string())
            .or_default()
            .push(lap.clone());
        Ok(())
    }

    fn journaled_laps(&self, session_id: &str) -> Result<Vec<LapRecord>, TimingError> {
        Ok(self.journals.get(session_id).cloned().unwrap_or_default())
    }
}

impl TrackStorage for MemoryStorage {
    fn save_track(&mut self, track: &Track) -> Result<(), TimingError> {
        track.geometry()?;
        self.tracks.insert(normalize_name(&track.name), track.clone());
        Ok(())
    }

    fn load_track(&self, track_name: &str) -> Result<Option<Track>, TimingError> {
        Ok(self.tracks.get(&normalize_name(track_name)).cloned())
    }

    fn list_tracks(&self) -> Result<Vec<String>, TimingError> {
        let mut names: Vec<String> = self.tracks.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn delete_track(&mut self, track_name: &str) -> Result<(), TimingError> {
        self.tracks.remove(&normalize_name(track_name));
        Ok(())
    }
}
