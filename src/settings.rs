use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::level::DEFAULT_METER_FLOOR_DB;
use crate::error::RecorderError;
use crate::events::DEFAULT_EVENT_QUEUE_CAPACITY;
use crate::take::worker::DEFAULT_FRAME_QUEUE_BATCHES;
use crate::take::DEFAULT_FLUSH_THRESHOLD_BYTES;

const APP_DIR_NAME: &str = "punch-recorder";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    /// Last selected session directory.
    pub session_directory: Option<PathBuf>,

    /// Last selected input device (the device name, with cpal).
    pub device_id: Option<String>,

    /// Buffered audio written to disk once it reaches this many bytes.
    pub flush_threshold_bytes: usize,

    /// Depth of the queue between the capture callback and the take writer, in batches.
    pub frame_queue_batches: usize,

    pub event_queue_capacity: usize,

    /// Directory holding session_start.wav, session_end.wav, good.wav and bad.wav.
    /// Defaults to `<config_dir>/punch-recorder/cues`.
    pub cue_asset_dir: Option<PathBuf>,

    /// Extra time a blocking cue may run past its length before the controller moves on.
    pub cue_blocking_timeout_ms: u64,

    /// Lowest level shown by the meter.
    pub meter_floor_db: f64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            session_directory: default_session_directory(),
            device_id: None,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
            frame_queue_batches: DEFAULT_FRAME_QUEUE_BATCHES,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            cue_asset_dir: None,
            cue_blocking_timeout_ms: 5000,
            meter_floor_db: DEFAULT_METER_FLOOR_DB,
        }
    }
}

impl RecorderSettings {
    pub fn cue_dir(&self) -> Option<PathBuf> {
        self.cue_asset_dir
            .clone()
            .or_else(|| config_dir().map(|d| d.join("cues")))
    }
}

/// Desktop, falling back to the home directory.
fn default_session_directory() -> Option<PathBuf> {
    dirs::desktop_dir().or_else(dirs::home_dir)
}

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR_NAME))
}

pub fn settings_path() -> Result<PathBuf, RecorderError> {
    config_dir()
        .map(|d| d.join(SETTINGS_FILE_NAME))
        .ok_or_else(|| RecorderError::Settings("no config directory on this system".into()))
}

/// Load settings, falling back to defaults on any problem.
pub fn load_settings() -> RecorderSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("{}, using default settings", e);
            RecorderSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> RecorderSettings {
    read_settings(path).unwrap_or_else(|e| {
        log::warn!("{}, using default settings", e);
        RecorderSettings::default()
    })
}

fn read_settings(path: &Path) -> Result<RecorderSettings, RecorderError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RecorderSettings::default())
        }
        Err(e) => return Err(RecorderError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| RecorderError::Settings(format!("cannot parse {:?}: {}", path, e)))
}

pub fn save_settings(settings: &RecorderSettings) -> Result<(), RecorderError> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &RecorderSettings) -> Result<(), RecorderError> {
    let contents = serde_json::to_vec_pretty(settings)
        .map_err(|e| RecorderError::Settings(format!("cannot encode settings: {}", e)))?;
    replace_file(path, &contents)?;
    log::debug!("Settings saved to {:?}", path);
    Ok(())
}

/// Write `contents` next to `path` and rename it into place, so readers see
/// either the old file or the new one.
fn replace_file(path: &Path, contents: &[u8]) -> Result<(), RecorderError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RecorderError::io(parent, e))?;
    }

    let staged = path.with_extension("json.tmp");
    std::fs::write(&staged, contents).map_err(|e| RecorderError::io(&staged, e))?;

    // rename does not replace an existing file on Windows
    if cfg!(windows) {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(RecorderError::io(path, e));
            }
            _ => {}
        }
    }

    std::fs::rename(&staged, path).map_err(|e| RecorderError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("settings.json"));
        assert_eq!(settings.flush_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.frame_queue_batches, 512);
        assert_eq!(settings.device_id, None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = RecorderSettings {
            session_directory: Some(PathBuf::from("/sessions/today")),
            device_id: Some("USB Interface".into()),
            meter_floor_db: -48.0,
            ..RecorderSettings::default()
        };

        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "device_id": "Mic" }"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.device_id.as_deref(), Some("Mic"));
        assert_eq!(settings.cue_blocking_timeout_ms, 5000);
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path).event_queue_capacity, 256);
    }

    #[test]
    fn save_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ old and broken").unwrap();

        let settings = RecorderSettings {
            cue_blocking_timeout_ms: 250,
            ..RecorderSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn save_under_a_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let result = save_settings_to(&blocker.join("settings.json"), &RecorderSettings::default());
        assert!(matches!(result, Err(RecorderError::Io { .. })));
    }

    #[test]
    fn explicit_cue_dir_wins() {
        let settings = RecorderSettings {
            cue_asset_dir: Some(PathBuf::from("/assets")),
            ..RecorderSettings::default()
        };
        assert_eq!(settings.cue_dir(), Some(PathBuf::from("/assets")));
    }
}
