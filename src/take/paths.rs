//! Session directory layout
//!
//! `<session>/.punch_take.wav` is the single temp take reused across takes;
//! finished takes land in `<session>/keep/` or `<session>/discard/` as
//! `track_<unixSeconds>.wav`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Name of the in-progress take inside a session directory.
pub const TEMP_TAKE_NAME: &str = ".punch_take.wav";

pub const KEEP_DIR: &str = "keep";
pub const DISCARD_DIR: &str = "discard";

/// Where a finished take goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Destination {
    Keep,
    Discard,
}

impl Destination {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Destination::Keep => KEEP_DIR,
            Destination::Discard => DISCARD_DIR,
        }
    }

    pub fn dir(&self, session_dir: &Path) -> PathBuf {
        session_dir.join(self.dir_name())
    }
}

pub fn temp_take_path(session_dir: &Path) -> PathBuf {
    session_dir.join(TEMP_TAKE_NAME)
}

/// `track_<unix_secs>.wav`
pub fn track_file_name(unix_secs: i64) -> String {
    format!("track_{}.wav", unix_secs)
}

/// First free track path in `dest_dir` for this second.
///
/// Two takes finished within the same second get `_1`, `_2`, ... suffixes
/// instead of overwriting each other.
pub fn unique_track_path(dest_dir: &Path, unix_secs: i64) -> PathBuf {
    let first = dest_dir.join(track_file_name(unix_secs));
    if !first.exists() {
        return first;
    }

    let mut n = 1u32;
    loop {
        let candidate = dest_dir.join(format!("track_{}_{}.wav", unix_secs, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Finished tracks in a destination folder, oldest name first.
pub fn list_tracks(dest_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dest_dir.exists() {
        return Ok(Vec::new());
    }

    let mut tracks: Vec<PathBuf> = fs::read_dir(dest_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|ext| ext == "wav").unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("track_"))
                    .unwrap_or(false)
        })
        .collect();

    tracks.sort();
    Ok(tracks)
}
