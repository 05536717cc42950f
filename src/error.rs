//! Error taxonomy for the recorder core
//!
//! Device failures keep the session Idle, I/O failures keep buffered audio for a
//! retry, and state violations are rejected without touching anything.

use std::path::PathBuf;

use crate::audio::DeviceError;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// Opening or selecting the capture device failed
    #[error("Audio device error: {0}")]
    Device(#[from] DeviceError),

    /// Write, flush, or move of a take failed
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The temp take file vanished before finalize/discard
    #[error("Take file not found: {0:?}")]
    NotFound(PathBuf),

    /// Operation not allowed in the current session state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// A non-empty leftover take is waiting for the operator
    #[error("Leftover take {path:?} ({size_bytes} bytes) must be resolved before recording")]
    RecoveryAmbiguous { path: PathBuf, size_bytes: u64 },

    /// WAV encoding failed for a reason other than I/O
    #[error("WAV encoding error: {0}")]
    Wav(String),

    /// The settings file could not be located or encoded
    #[error("Settings error: {0}")]
    Settings(String),

    /// The background take writer is gone
    #[error("Take writer thread has stopped")]
    WorkerStopped,
}

impl RecorderError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RecorderError::Io {
            path: path.into(),
            source,
        }
    }

    /// Map a hound error onto the taxonomy, keeping I/O errors as I/O.
    pub fn from_wav(path: impl Into<PathBuf>, err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(source) => RecorderError::io(path, source),
            other => RecorderError::Wav(other.to_string()),
        }
    }

    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        RecorderError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// True for errors that leave nothing to clean up (the file is already gone).
    pub fn is_not_found(&self) -> bool {
        match self {
            RecorderError::NotFound(_) => true,
            RecorderError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
