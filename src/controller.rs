//! Session controller
//!
//! Owns the capture stream, the take writer thread, and the cue coordinator,
//! and runs the effects `reduce()` asks for. Every operator intent enters
//! here on the control thread; the device callback only talks to the writer
//! queue and the event channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::{
    CaptureBackend, CaptureConfig, CueChannel, CueSoundCoordinator, DeviceError, InputDevice,
    CAPTURE_BITS,
};
use crate::error::RecorderError;
use crate::events::{EventSender, RecorderEvent};
use crate::state_machine::{reduce, Command, Effect, SessionStateKind, State};
use crate::take::recovery::{self, LeftoverState, RecoveryChoice, RecoveryOutcome};
use crate::take::{
    frame_callback, temp_take_path, CaptureShared, TakeWorker, VisibilityHook, WorkerConfig,
};

pub struct SessionController {
    backend: Box<dyn CaptureBackend>,
    cues: CueSoundCoordinator,
    worker: TakeWorker,
    capture: Arc<CaptureShared>,
    events: EventSender,
    visibility: Arc<dyn VisibilityHook>,
    state: State,
    directory: Option<PathBuf>,
    device_id: Option<String>,
    /// Non-empty leftover waiting for the operator
    pending_leftover: Option<LeftoverState>,
}

impl SessionController {
    pub fn new(
        backend: Box<dyn CaptureBackend>,
        cues: CueSoundCoordinator,
        worker_config: WorkerConfig,
        events: EventSender,
    ) -> Result<Self, RecorderError> {
        let visibility = worker_config.visibility.clone();
        let worker = TakeWorker::spawn(worker_config, events.clone())?;

        Ok(Self {
            backend,
            cues,
            worker,
            capture: Arc::new(CaptureShared::new()),
            events,
            visibility,
            state: State::Idle,
            directory: None,
            device_id: None,
            pending_leftover: None,
        })
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn pending_leftover(&self) -> Option<&LeftoverState> {
        self.pending_leftover.as_ref()
    }

    pub fn dropped_batches(&self) -> u64 {
        self.capture.dropped_batches()
    }

    pub fn list_input_devices(&self) -> Result<Vec<InputDevice>, RecorderError> {
        Ok(self.backend.list_input_devices()?)
    }

    /// Bind a session directory and check it for a leftover take.
    pub fn select_directory(&mut self, path: &Path) -> Result<LeftoverState, RecorderError> {
        if self.state.is_active() {
            return Err(RecorderError::invalid_state("change directory", &self.state));
        }
        if !path.is_dir() {
            return Err(RecorderError::NotFound(path.to_path_buf()));
        }

        let leftover = recovery::scan(path)?;
        self.pending_leftover = None;
        match &leftover {
            LeftoverState::None => {}
            LeftoverState::Empty { path } => recovery::delete_empty(path)?,
            LeftoverState::NonEmpty { path, size_bytes } => {
                self.events.try_emit(RecorderEvent::RecoveryPromptNeeded {
                    path: path.clone(),
                    size_bytes: *size_bytes,
                });
                self.pending_leftover = Some(leftover.clone());
            }
        }

        log::info!("Session directory: {:?}", path);
        self.directory = Some(path.to_path_buf());
        Ok(leftover)
    }

    /// Bind an input device and start metering it.
    pub fn select_device(&mut self, id: &str) -> Result<(), RecorderError> {
        if self.state.is_active() {
            return Err(RecorderError::invalid_state("change device", &self.state));
        }

        let devices = self.backend.list_input_devices()?;
        if !devices.iter().any(|d| d.id == id) {
            return Err(DeviceError::DeviceNotFound(id.to_string()).into());
        }

        self.backend.close_stream();
        self.device_id = None;

        let callback = frame_callback(
            self.capture.clone(),
            self.worker.frame_sender(),
            self.events.clone(),
            CAPTURE_BITS,
        );
        self.backend
            .open_stream(id, &CaptureConfig::default(), callback)?;

        log::info!("Input device selected: {}", id);
        self.device_id = Some(id.to_string());
        Ok(())
    }

    /// Apply the operator's decision to the pending leftover take.
    pub fn resolve_leftover(&mut self, choice: RecoveryChoice) -> Result<RecoveryOutcome, RecorderError> {
        if self.state.is_active() {
            return Err(RecorderError::invalid_state("resolve a leftover take", &self.state));
        }
        let dir = self.session_dir()?;

        let outcome = recovery::resolve(&dir, choice, self.visibility.as_ref())?;
        if outcome.unblocks() {
            self.pending_leftover = None;
        }
        if let RecoveryOutcome::Moved { path, destination } = &outcome {
            self.events.try_emit(RecorderEvent::TakeFinalized {
                path: path.clone(),
                destination: *destination,
            });
        }
        Ok(outcome)
    }

    /// The start/stop button.
    pub fn start_or_end_session(&mut self) -> Result<SessionStateKind, RecorderError> {
        if self.state.is_active() {
            self.end_session()
        } else {
            self.start_session()
        }
    }

    pub fn start_session(&mut self) -> Result<SessionStateKind, RecorderError> {
        self.dispatch(Command::StartSession)
    }

    pub fn finish_good_take(&mut self) -> Result<SessionStateKind, RecorderError> {
        self.dispatch(Command::FinishGoodTake)
    }

    pub fn finish_bad_take(&mut self) -> Result<SessionStateKind, RecorderError> {
        self.dispatch(Command::FinishBadTake)
    }

    pub fn replay_last_take(&mut self) -> Result<SessionStateKind, RecorderError> {
        self.dispatch(Command::ReplayLastTake)
    }

    pub fn end_session(&mut self) -> Result<SessionStateKind, RecorderError> {
        self.dispatch(Command::EndSession)
    }

    /// End any active session and release the device.
    pub fn shutdown(&mut self) {
        if self.state.is_active() {
            if let Err(e) = self.end_session() {
                log::error!("Failed to end session on shutdown: {}", e);
            }
        }
        self.cues.stop_all();
        self.backend.close_stream();
        log::info!("Recorder shut down");
    }

    fn session_dir(&self) -> Result<PathBuf, RecorderError> {
        self.directory
            .clone()
            .ok_or_else(|| RecorderError::invalid_state("record", "no directory is selected"))
    }

    fn dispatch(&mut self, command: Command) -> Result<SessionStateKind, RecorderError> {
        if command == Command::StartSession && !self.state.is_active() {
            if self.device_id.is_none() || !self.backend.is_open() {
                return Err(DeviceError::NoDeviceSelected.into());
            }
            self.session_dir()?;
        }

        let (next, effects) = reduce(&self.state, command)?;
        let previous = self.state.clone();
        let mut replay_stopped = false;

        for effect in effects {
            if let Err(e) = self.run_effect(effect, &next, &mut replay_stopped) {
                log::error!("{:?} failed while {}: {}", command, previous, e);
                self.reconcile(&previous, replay_stopped);
                return Err(e);
            }
        }

        log::info!(
            "Session {}: {} -> {} ({} takes finished)",
            next.session_id()
                .or_else(|| previous.session_id())
                .map(|id| id.to_string())
                .unwrap_or_default(),
            previous,
            next,
            next.takes_finished()
        );
        self.state = next;
        Ok(self.state.kind())
    }

    fn run_effect(
        &mut self,
        effect: Effect,
        next: &State,
        replay_stopped: &mut bool,
    ) -> Result<(), RecorderError> {
        match effect {
            Effect::ScanForLeftover => {
                let dir = self.session_dir()?;
                match recovery::scan(&dir)? {
                    LeftoverState::None => {}
                    LeftoverState::Empty { path } => recovery::delete_empty(&path)?,
                    LeftoverState::NonEmpty { path, size_bytes } => {
                        self.pending_leftover = Some(LeftoverState::NonEmpty {
                            path: path.clone(),
                            size_bytes,
                        });
                        self.events.try_emit(RecorderEvent::RecoveryPromptNeeded {
                            path: path.clone(),
                            size_bytes,
                        });
                        return Err(RecorderError::RecoveryAmbiguous { path, size_bytes });
                    }
                }
            }
            Effect::OpenTake => {
                let dir = self.session_dir()?;
                let take = self.worker.open(&temp_take_path(&dir))?;
                log::debug!("Take opened at {}", take.started_at.format("%H:%M:%S"));
            }
            Effect::ResumeCapture => self.capture.resume(),
            Effect::SuspendCapture => self.capture.suspend(),
            Effect::FlushTake => self.worker.flush()?,
            Effect::StartReplay => {
                let path = temp_take_path(&self.session_dir()?);
                self.cues
                    .play_file(CueChannel::Replay, &path)
                    .map_err(|e| RecorderError::from_wav(&path, e))?;
            }
            Effect::StopReplay => {
                self.cues.stop(CueChannel::Replay);
                *replay_stopped = true;
            }
            Effect::FinalizeTake(destination) => {
                let dir = self.session_dir()?;
                match self.worker.finalize(&destination.dir(&dir)) {
                    Ok(path) => {
                        self.events
                            .try_emit(RecorderEvent::TakeFinalized { path, destination });
                    }
                    // Already resolved; the session moves on to the next take
                    Err(e) if e.is_not_found() => log::warn!("{}", e),
                    Err(e) => return Err(e),
                }
            }
            Effect::DiscardTake => self.worker.discard()?,
            Effect::PlayCue {
                channel,
                sound,
                blocking,
            } => {
                if blocking {
                    self.cues.play_blocking(channel, sound);
                } else {
                    self.cues.play(channel, sound);
                }
            }
            Effect::EmitState => {
                self.events.try_emit(RecorderEvent::StateChanged { state: next.kind() });
            }
        }
        Ok(())
    }

    /// Settle on a truthful state after an effect failed part-way.
    fn reconcile(&mut self, previous: &State, replay_stopped: bool) {
        let settled = if !self.worker.has_take() {
            State::Idle
        } else {
            match previous {
                State::Replaying {
                    session_id,
                    takes_finished,
                } if replay_stopped => State::Recording {
                    session_id: *session_id,
                    takes_finished: *takes_finished,
                },
                other => other.clone(),
            }
        };

        match settled {
            State::Recording { .. } => self.capture.resume(),
            State::Replaying { .. } => {}
            State::Idle => {
                self.capture.suspend();
                self.cues.stop(CueChannel::Replay);
            }
        }

        if settled != self.state {
            log::warn!("Recovered from failed transition: {} -> {}", self.state, settled);
        }
        self.state = settled;
        self.events.try_emit(RecorderEvent::StateChanged {
            state: self.state.kind(),
        });
    }
}
