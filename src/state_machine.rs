//! Take state machine
//!
//! All session transitions go through `reduce()`, which returns the next state
//! and the effects the controller must run to get there. The reducer itself
//! never touches devices or files.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::audio::{CueChannel, CueSound};
use crate::error::RecorderError;
use crate::take::Destination;

/// Session state as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStateKind {
    Idle,
    Recording,
    Replaying,
}

impl fmt::Display for SessionStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStateKind::Idle => "Idle",
            SessionStateKind::Recording => "Recording",
            SessionStateKind::Replaying => "Replaying",
        };
        f.write_str(name)
    }
}

/// Authoritative session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    Recording {
        session_id: Uuid,
        takes_finished: u32,
    },
    /// Capture suspended while the current take plays back
    Replaying {
        session_id: Uuid,
        takes_finished: u32,
    },
}

impl State {
    pub fn kind(&self) -> SessionStateKind {
        match self {
            State::Idle => SessionStateKind::Idle,
            State::Recording { .. } => SessionStateKind::Recording,
            State::Replaying { .. } => SessionStateKind::Replaying,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, State::Idle)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Idle => None,
            State::Recording { session_id, .. } | State::Replaying { session_id, .. } => {
                Some(*session_id)
            }
        }
    }

    pub fn takes_finished(&self) -> u32 {
        match self {
            State::Idle => 0,
            State::Recording { takes_finished, .. } | State::Replaying { takes_finished, .. } => {
                *takes_finished
            }
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind().fmt(f)
    }
}

/// Operator commands that drive the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartSession,
    ReplayLastTake,
    FinishGoodTake,
    FinishBadTake,
    EndSession,
}

impl Command {
    /// Operation name used in rejection messages.
    pub fn operation(&self) -> &'static str {
        match self {
            Command::StartSession => "start a session",
            Command::ReplayLastTake => "replay the last take",
            Command::FinishGoodTake => "finish a good take",
            Command::FinishBadTake => "finish a bad take",
            Command::EndSession => "end the session",
        }
    }
}

/// Side effects run by the controller, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Refuse to continue while a non-empty leftover is unresolved
    ScanForLeftover,
    OpenTake,
    ResumeCapture,
    /// Stop forwarding frames and drain the in-flight callback
    SuspendCapture,
    FlushTake,
    StartReplay,
    StopReplay,
    FinalizeTake(Destination),
    DiscardTake,
    PlayCue {
        channel: CueChannel,
        sound: CueSound,
        blocking: bool,
    },
    EmitState,
}

/// Reducer: (state, command) -> (next_state, effects)
///
/// Commands not allowed in the current state are rejected with
/// `InvalidState` and leave the state untouched.
pub fn reduce(state: &State, command: Command) -> Result<(State, Vec<Effect>), RecorderError> {
    use Command::*;
    use Effect::*;
    use State::*;

    let start_cue = PlayCue {
        channel: CueChannel::RecordStart,
        sound: CueSound::SessionStart,
        blocking: false,
    };

    match (state, command) {
        // -----------------
        // Idle
        // -----------------
        (Idle, StartSession) => Ok((
            Recording {
                session_id: Uuid::new_v4(),
                takes_finished: 0,
            },
            vec![ScanForLeftover, OpenTake, ResumeCapture, start_cue, EmitState],
        )),

        // -----------------
        // Recording
        // -----------------
        (
            Recording {
                session_id,
                takes_finished,
            },
            ReplayLastTake,
        ) => Ok((
            Replaying {
                session_id: *session_id,
                takes_finished: *takes_finished,
            },
            vec![SuspendCapture, FlushTake, StartReplay, EmitState],
        )),

        // -----------------
        // Recording / Replaying
        // -----------------
        (
            Recording {
                session_id,
                takes_finished,
            }
            | Replaying {
                session_id,
                takes_finished,
            },
            FinishGoodTake | FinishBadTake,
        ) => {
            let (destination, sound) = if command == FinishGoodTake {
                (Destination::Keep, CueSound::GoodTake)
            } else {
                (Destination::Discard, CueSound::BadTake)
            };
            let halt = if matches!(state, Replaying { .. }) {
                StopReplay
            } else {
                SuspendCapture
            };
            Ok((
                Recording {
                    session_id: *session_id,
                    takes_finished: takes_finished + 1,
                },
                vec![
                    halt,
                    FinalizeTake(destination),
                    PlayCue {
                        channel: CueChannel::Ui,
                        sound,
                        blocking: true,
                    },
                    OpenTake,
                    ResumeCapture,
                    start_cue,
                    EmitState,
                ],
            ))
        }
        (Recording { .. } | Replaying { .. }, EndSession) => {
            let halt = if matches!(state, Replaying { .. }) {
                StopReplay
            } else {
                SuspendCapture
            };
            Ok((
                Idle,
                vec![
                    halt,
                    DiscardTake,
                    PlayCue {
                        channel: CueChannel::Ui,
                        sound: CueSound::SessionEnd,
                        blocking: false,
                    },
                    EmitState,
                ],
            ))
        }

        // -----------------
        // Rejected
        // -----------------
        _ => {
            log::warn!("Rejected {:?} while {}", command, state);
            Err(RecorderError::invalid_state(command.operation(), state))
        }
    }
}
