//! Observable events pushed from the recorder to its UI collaborator

use std::path::PathBuf;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::state_machine::SessionStateKind;
use crate::take::Destination;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RecorderEvent {
    /// Once per captured batch
    #[serde(rename_all = "camelCase")]
    LevelUpdated { db: f64 },

    /// Batch peak above the distortion threshold
    #[serde(rename_all = "camelCase")]
    DistortionDetected { peak: f64 },

    #[serde(rename_all = "camelCase")]
    StateChanged { state: SessionStateKind },

    /// A non-empty leftover take needs a keep/discard/delete/skip decision
    #[serde(rename_all = "camelCase")]
    RecoveryPromptNeeded { path: PathBuf, size_bytes: u64 },

    #[serde(rename_all = "camelCase")]
    TakeFinalized {
        path: PathBuf,
        destination: Destination,
    },

    #[serde(rename_all = "camelCase")]
    WriteFailed { message: String },
}

impl RecorderEvent {
    /// High-rate events that may be dropped under backpressure.
    pub fn is_meter(&self) -> bool {
        matches!(
            self,
            RecorderEvent::LevelUpdated { .. } | RecorderEvent::DistortionDetected { .. }
        )
    }
}

/// Non-blocking sending side of the event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<RecorderEvent>,
}

impl EventSender {
    pub fn new(tx: Sender<RecorderEvent>) -> Self {
        Self { tx }
    }

    /// Emit without blocking. Returns false if the event was dropped.
    pub fn try_emit(&self, event: RecorderEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                if !event.is_meter() {
                    log::warn!("Event channel full, dropped {:?}", event);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub fn event_channel(capacity: usize) -> (EventSender, Receiver<RecorderEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (EventSender::new(tx), rx)
}
