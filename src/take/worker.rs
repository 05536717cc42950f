//! Background take writer
//!
//! The device callback never touches the disk. It hands each captured batch to
//! a bounded FIFO queue, and a dedicated thread owns the `TakeWriter` and
//! drains that queue. Control commands (open, flush, finalize, discard) go
//! through the same queue, so they always observe every batch queued before
//! them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::visibility::VisibilityHook;
use super::writer::{Take, TakeFormat, TakeWriter, DEFAULT_FLUSH_THRESHOLD_BYTES};
use crate::audio::{level, FrameCallback};
use crate::error::RecorderError;
use crate::events::{EventSender, RecorderEvent};

/// Default queue depth, in batches (about 5.5 s of audio at 1024 frames / 96 kHz).
pub const DEFAULT_FRAME_QUEUE_BATCHES: usize = 512;

/// Repeated failures are reported on the first and then every Nth occurrence.
const REPORT_EVERY: u64 = 100;

type Reply<T> = Sender<Result<T, RecorderError>>;

fn should_report(count: u64) -> bool {
    count == 1 || count % REPORT_EVERY == 0
}

/// Commands processed by the writer thread, strictly in arrival order.
pub enum WriterCommand {
    Open { path: PathBuf, reply: Reply<Take> },
    /// One captured batch; fire-and-forget
    Frames(Vec<i32>),
    Flush { reply: Reply<()> },
    Finalize { destination: PathBuf, reply: Reply<PathBuf> },
    Discard { reply: Reply<()> },
    Shutdown,
}

#[derive(Clone)]
pub struct WorkerConfig {
    pub format: TakeFormat,
    pub flush_threshold_bytes: usize,
    pub queue_batches: usize,
    pub visibility: Arc<dyn VisibilityHook>,
}

impl WorkerConfig {
    pub fn new(visibility: Arc<dyn VisibilityHook>) -> Self {
        Self {
            format: TakeFormat::default(),
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
            queue_batches: DEFAULT_FRAME_QUEUE_BATCHES,
            visibility,
        }
    }
}

/// Handle to the writer thread. Dropping it shuts the thread down and joins it.
pub struct TakeWorker {
    sender: Sender<WriterCommand>,
    take_open: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TakeWorker {
    pub fn spawn(config: WorkerConfig, events: EventSender) -> Result<Self, RecorderError> {
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_batches.max(1));
        let take_open = Arc::new(AtomicBool::new(false));

        let thread_take_open = take_open.clone();
        let thread = thread::Builder::new()
            .name("take-writer".into())
            .spawn(move || writer_thread_main(receiver, config, events, thread_take_open))
            .map_err(|e| RecorderError::io("take-writer thread", e))?;

        Ok(Self {
            sender,
            take_open,
            thread: Some(thread),
        })
    }

    /// Sender for the capture callback.
    pub fn frame_sender(&self) -> Sender<WriterCommand> {
        self.sender.clone()
    }

    pub fn has_take(&self) -> bool {
        self.take_open.load(Ordering::SeqCst)
    }

    pub fn open(&self, path: &Path) -> Result<Take, RecorderError> {
        self.request(|reply| WriterCommand::Open {
            path: path.to_path_buf(),
            reply,
        })
    }

    /// Write out everything queued and buffered so far.
    pub fn flush(&self) -> Result<(), RecorderError> {
        self.request(|reply| WriterCommand::Flush { reply })
    }

    pub fn finalize(&self, destination: &Path) -> Result<PathBuf, RecorderError> {
        self.request(|reply| WriterCommand::Finalize {
            destination: destination.to_path_buf(),
            reply,
        })
    }

    pub fn discard(&self) -> Result<(), RecorderError> {
        self.request(|reply| WriterCommand::Discard { reply })
    }

    fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> WriterCommand,
    ) -> Result<T, RecorderError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.sender
            .send(make(reply_tx))
            .map_err(|_| RecorderError::WorkerStopped)?;
        reply_rx.recv().map_err(|_| RecorderError::WorkerStopped)?
    }
}

impl Drop for TakeWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(WriterCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Take writer thread panicked");
            }
        }
    }
}

fn writer_thread_main(
    receiver: Receiver<WriterCommand>,
    config: WorkerConfig,
    events: EventSender,
    take_open: Arc<AtomicBool>,
) {
    log::debug!("Take writer thread started");
    let mut writer: Option<TakeWriter> = None;
    // Consecutive failed threshold flushes
    let mut write_failures: u64 = 0;

    while let Ok(command) = receiver.recv() {
        match command {
            WriterCommand::Frames(frame) => {
                let Some(w) = writer.as_mut() else {
                    log::trace!("Dropping {} samples, no take open", frame.len());
                    continue;
                };
                w.append(&frame);
                match w.flush_if_threshold_exceeded() {
                    Ok(true) if write_failures > 0 => {
                        log::info!("Take writes recovered after {} failures", write_failures);
                        write_failures = 0;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        write_failures += 1;
                        if should_report(write_failures) {
                            log::error!(
                                "Take write failed ({} in a row), {} samples buffered: {}",
                                write_failures,
                                w.buffered_samples(),
                                e
                            );
                            events.try_emit(RecorderEvent::WriteFailed {
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            WriterCommand::Open { path, reply } => {
                let result = if writer.is_some() {
                    Err(RecorderError::invalid_state("open a take", "a take is open"))
                } else {
                    TakeWriter::open(
                        &path,
                        config.format,
                        config.flush_threshold_bytes,
                        config.visibility.clone(),
                    )
                    .map(|w| {
                        let take = w.take().clone();
                        writer = Some(w);
                        take
                    })
                };
                write_failures = 0;
                take_open.store(writer.is_some(), Ordering::SeqCst);
                let _ = reply.send(result);
            }
            WriterCommand::Flush { reply } => {
                let result = match writer.as_mut() {
                    Some(w) => w.flush(),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            WriterCommand::Finalize { destination, reply } => {
                let result = match writer.as_mut() {
                    Some(w) => w.finalize(&destination),
                    None => Err(RecorderError::invalid_state(
                        "finalize a take",
                        "no take is open",
                    )),
                };
                match &result {
                    Ok(_) => writer = None,
                    Err(e) if e.is_not_found() => {
                        log::warn!("Take vanished, nothing left to finalize");
                        writer = None;
                    }
                    Err(_) => {}
                }
                take_open.store(writer.is_some(), Ordering::SeqCst);
                let _ = reply.send(result);
            }
            WriterCommand::Discard { reply } => {
                let result = match writer.take() {
                    Some(w) => w.discard(),
                    None => {
                        log::debug!("Discard with no take open");
                        Ok(())
                    }
                };
                take_open.store(false, Ordering::SeqCst);
                let _ = reply.send(result);
            }
            WriterCommand::Shutdown => break,
        }
    }

    if let Some(mut w) = writer.take() {
        // Left on disk for the next directory scan
        match w.flush() {
            Ok(()) => log::warn!("Shutting down with take open, left at {:?}", w.temp_path()),
            Err(e) => log::error!("Final flush of {:?} failed: {}", w.temp_path(), e),
        }
    }
    take_open.store(false, Ordering::SeqCst);
    log::debug!("Take writer thread exiting");
}

/// State shared between the capture callback and the controller.
#[derive(Debug, Default)]
pub struct CaptureShared {
    capturing: AtomicBool,
    in_flight: AtomicUsize,
    dropped_batches: AtomicU64,
}

impl CaptureShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    pub fn resume(&self) {
        self.capturing.store(true, Ordering::SeqCst);
    }

    /// Stop forwarding batches and wait until no callback is mid-enqueue.
    ///
    /// After this returns, every batch the callback accepted is in the queue.
    pub fn suspend(&self) {
        self.capturing.store(false, Ordering::SeqCst);
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    fn note_dropped(&self) {
        let dropped = self.dropped_batches.fetch_add(1, Ordering::Relaxed) + 1;
        if should_report(dropped) {
            log::warn!("Writer queue full, {} batches dropped so far", dropped);
        }
    }
}

/// Build the device callback: meter every batch, forward it while capturing.
pub fn frame_callback(
    shared: Arc<CaptureShared>,
    frames: Sender<WriterCommand>,
    events: EventSender,
    bits: u16,
) -> FrameCallback {
    Box::new(move |samples: &[i32]| {
        let reading = level::analyze(samples, bits);
        events.try_emit(RecorderEvent::LevelUpdated {
            db: reading.level_db,
        });
        if reading.is_distorted {
            events.try_emit(RecorderEvent::DistortionDetected { peak: reading.peak });
        }

        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        if shared.capturing.load(Ordering::SeqCst) {
            match frames.try_send(WriterCommand::Frames(samples.to_vec())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => shared.note_dropped(),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::take::paths::{list_tracks, temp_take_path, Destination};
    use crate::take::visibility::NoopVisibility;

    fn spawn_worker(threshold: usize) -> (TakeWorker, crossbeam_channel::Receiver<RecorderEvent>) {
        let (events, rx) = event_channel(1024);
        let mut config = WorkerConfig::new(Arc::new(NoopVisibility));
        config.flush_threshold_bytes = threshold;
        (TakeWorker::spawn(config, events).unwrap(), rx)
    }

    fn read_samples(path: &Path) -> Vec<i32> {
        hound::WavReader::open(path)
            .unwrap()
            .samples::<i32>()
            .map(|s| s.unwrap())
            .collect()
    }

    #[test]
    fn finalize_sees_every_queued_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
        worker.open(&temp_take_path(dir.path())).unwrap();
        assert!(worker.has_take());

        let frames = worker.frame_sender();
        let mut expected = Vec::new();
        for i in 0..10 {
            let batch: Vec<i32> = (0..1024).map(|s| s + i * 1024).collect();
            expected.extend_from_slice(&batch);
            frames.send(WriterCommand::Frames(batch)).unwrap();
        }

        let keep = Destination::Keep.dir(dir.path());
        let path = worker.finalize(&keep).unwrap();
        assert!(!worker.has_take());
        assert_eq!(read_samples(&path), expected);
        assert_eq!(list_tracks(&keep).unwrap().len(), 1);
    }

    #[test]
    fn frames_without_take_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
        worker
            .frame_sender()
            .send(WriterCommand::Frames(vec![1; 1024]))
            .unwrap();

        worker.open(&temp_take_path(dir.path())).unwrap();
        let path = worker.finalize(&dir.path().join("keep")).unwrap();
        assert!(read_samples(&path).is_empty());
    }

    #[test]
    fn second_open_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
        worker.open(&temp_take_path(dir.path())).unwrap();
        assert!(matches!(
            worker.open(&temp_take_path(dir.path())),
            Err(RecorderError::InvalidState { .. })
        ));
        assert!(worker.has_take());
    }

    #[test]
    fn finalize_without_take_is_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
        assert!(matches!(
            worker.finalize(dir.path()),
            Err(RecorderError::InvalidState { .. })
        ));
    }

    #[test]
    fn discard_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
        worker.open(&temp_take_path(dir.path())).unwrap();
        worker
            .frame_sender()
            .send(WriterCommand::Frames(vec![7; 1024]))
            .unwrap();
        worker.discard().unwrap();
        assert!(!temp_take_path(dir.path()).exists());
        assert!(!worker.has_take());
        // Discarding again is harmless
        worker.discard().unwrap();
    }

    #[test]
    fn shutdown_leaves_flushed_take_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let temp = temp_take_path(dir.path());
        {
            let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
            worker.open(&temp).unwrap();
            worker
                .frame_sender()
                .send(WriterCommand::Frames(vec![3; 2048]))
                .unwrap();
        }
        assert_eq!(read_samples(&temp), vec![3; 2048]);
    }

    #[test]
    fn failed_open_leaves_no_take() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, _events) = spawn_worker(DEFAULT_FLUSH_THRESHOLD_BYTES);
        let missing = dir.path().join("gone");
        assert!(matches!(
            worker.open(&temp_take_path(&missing)),
            Err(RecorderError::Io { .. })
        ));
        assert!(!worker.has_take());

        // The worker keeps serving after the failure
        worker.open(&temp_take_path(dir.path())).unwrap();
        assert!(worker.has_take());
    }

    #[test]
    fn failures_reported_first_then_every_hundredth() {
        let reported: Vec<u64> = (1..=250).filter(|&n| should_report(n)).collect();
        assert_eq!(reported, vec![1, 100, 200]);
    }

    #[cfg(unix)]
    #[test]
    fn persistent_write_failure_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, events) = spawn_worker(1024 * 4);
        let temp = temp_take_path(dir.path());
        worker.open(&temp).unwrap();

        // Swap the temp file for something that cannot be reopened, then fail
        // the move so the take stays open without a file handle.
        let garbage = dir.path().join("garbage");
        std::fs::write(&garbage, b"not a wav file").unwrap();
        std::fs::rename(&garbage, &temp).unwrap();
        let blocked = dir.path().join("keep");
        std::fs::write(&blocked, b"not a dir").unwrap();
        assert!(worker.finalize(&blocked).is_err());
        assert!(worker.has_take());

        let frames = worker.frame_sender();
        for i in 0..250 {
            frames.send(WriterCommand::Frames(vec![i; 1024])).unwrap();
        }
        assert!(worker.flush().is_err());

        let failures = events
            .try_iter()
            .filter(|e| matches!(e, RecorderEvent::WriteFailed { .. }))
            .count();
        assert_eq!(failures, 3);
    }

    #[test]
    fn callback_forwards_only_while_capturing() {
        let (events, event_rx) = event_channel(16);
        let (tx, rx) = crossbeam_channel::bounded(8);
        let shared = Arc::new(CaptureShared::new());
        let mut callback = frame_callback(shared.clone(), tx, events, 32);

        callback(&[0; 1024]);
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            RecorderEvent::LevelUpdated { .. }
        ));

        shared.resume();
        callback(&[i32::MAX; 1024]);
        assert!(matches!(rx.try_recv().unwrap(), WriterCommand::Frames(f) if f.len() == 1024));
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            RecorderEvent::LevelUpdated { .. }
        ));
        assert!(matches!(
            event_rx.try_recv().unwrap(),
            RecorderEvent::DistortionDetected { .. }
        ));

        shared.suspend();
        callback(&[5; 1024]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_counts_dropped_batches() {
        let (events, _event_rx) = event_channel(16);
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(CaptureShared::new());
        shared.resume();
        let mut callback = frame_callback(shared.clone(), tx, events, 32);

        callback(&[1; 16]);
        callback(&[2; 16]);
        callback(&[3; 16]);
        assert_eq!(shared.dropped_batches(), 2);
    }
}
