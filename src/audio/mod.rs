//! Audio module for the take recorder
//!
//! Capture from the input device (CPAL), per-batch level metering, and cue
//! playback on dedicated output channels.

pub mod capture;
pub mod cues;
pub mod level;

pub use capture::{
    CaptureBackend, CaptureConfig, CpalBackend, DeviceError, FrameCallback, InputDevice,
    CAPTURE_BITS, CAPTURE_CHANNELS, CAPTURE_SAMPLE_RATE, FRAMES_PER_BATCH,
};
pub use cues::{ChannelOutput, Clip, CpalChannelOutput, CueChannel, CueSound, CueSoundCoordinator};
pub use level::{analyze, display_db, meter_percent, LevelReading, DISTORTION_THRESHOLD};
