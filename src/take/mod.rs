//! Takes on disk: durable writing, the background writer thread, session
//! directory layout, and leftover recovery.

pub mod paths;
pub mod recovery;
pub mod visibility;
pub mod worker;
pub mod writer;

pub use paths::{list_tracks, temp_take_path, Destination, DISCARD_DIR, KEEP_DIR, TEMP_TAKE_NAME};
pub use recovery::{LeftoverState, RecoveryChoice, RecoveryOutcome};
pub use visibility::{platform_hook, NoopVisibility, VisibilityHook};
pub use worker::{frame_callback, CaptureShared, TakeWorker, WorkerConfig, WriterCommand};
pub use writer::{Take, TakeFormat, TakeWriter, DEFAULT_FLUSH_THRESHOLD_BYTES};
