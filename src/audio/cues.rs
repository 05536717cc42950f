//! Cue sounds on dedicated playback channels
//!
//! Cues are short pre-loaded clips (session start/end, good/bad take) played on
//! named channels that never touch the capture path. The replay channel plays
//! the temp take file through the same machinery.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::capture::DeviceError;

/// Poll interval while waiting for a blocking cue to finish.
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Logical cue assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CueSound {
    SessionStart,
    SessionEnd,
    GoodTake,
    BadTake,
}

impl CueSound {
    pub const ALL: [CueSound; 4] = [
        CueSound::SessionStart,
        CueSound::SessionEnd,
        CueSound::GoodTake,
        CueSound::BadTake,
    ];

    /// File name of the asset inside the cue directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            CueSound::SessionStart => "session_start.wav",
            CueSound::SessionEnd => "session_end.wav",
            CueSound::GoodTake => "good.wav",
            CueSound::BadTake => "bad.wav",
        }
    }
}

/// Playback channels. A channel plays one clip at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CueChannel {
    Ui,
    Replay,
    RecordStart,
}

impl CueChannel {
    pub const ALL: [CueChannel; 3] = [CueChannel::Ui, CueChannel::Replay, CueChannel::RecordStart];

    pub fn as_str(&self) -> &'static str {
        match self {
            CueChannel::Ui => "ui",
            CueChannel::Replay => "replay",
            CueChannel::RecordStart => "recordStart",
        }
    }
}

/// Decoded audio held in memory, interleaved f32 in -1.0..=1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Clip {
    /// Load a WAV file (integer or float samples).
    pub fn from_wav(path: &Path) -> Result<Self, hound::Error> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 2f32.powi(i32::from(spec.bits_per_sample) - 1);
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels.max(1),
        })
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / usize::from(self.channels.max(1))
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / f64::from(self.sample_rate))
    }

    /// Sample for output channel `out_ch`; mono clips feed every channel.
    fn sample_at(&self, frame: usize, out_ch: usize) -> f32 {
        let channels = usize::from(self.channels.max(1));
        let ch = out_ch.min(channels - 1);
        self.samples.get(frame * channels + ch).copied().unwrap_or(0.0)
    }
}

/// One playback channel (allows silent outputs in tests).
pub trait ChannelOutput: Send {
    /// Begin playing `clip`. Any clip already playing has been stopped by the caller.
    fn start(&mut self, clip: Arc<Clip>) -> Result<(), DeviceError>;
    fn stop(&mut self);
    fn is_busy(&self) -> bool;
}

/// Plays cues on owned, independent channels.
pub struct CueSoundCoordinator {
    outputs: HashMap<CueChannel, Box<dyn ChannelOutput>>,
    assets: HashMap<CueSound, Arc<Clip>>,
    blocking_timeout: Duration,
}

impl CueSoundCoordinator {
    /// Create a coordinator with one output per channel, built by `make_output`.
    pub fn new<F>(mut make_output: F, blocking_timeout: Duration) -> Self
    where
        F: FnMut(CueChannel) -> Box<dyn ChannelOutput>,
    {
        let outputs = CueChannel::ALL
            .iter()
            .map(|&channel| (channel, make_output(channel)))
            .collect();

        Self {
            outputs,
            assets: HashMap::new(),
            blocking_timeout,
        }
    }

    /// Coordinator backed by the default output device.
    pub fn with_default_output(blocking_timeout: Duration) -> Self {
        Self::new(
            |channel| Box::new(CpalChannelOutput::new(channel)) as Box<dyn ChannelOutput>,
            blocking_timeout,
        )
    }

    /// Load every cue asset found in `dir`. Returns how many were loaded.
    pub fn load_assets(&mut self, dir: &Path) -> usize {
        let mut loaded = 0;
        for sound in CueSound::ALL {
            let path = dir.join(sound.file_name());
            match Clip::from_wav(&path) {
                Ok(clip) => {
                    self.assets.insert(sound, Arc::new(clip));
                    loaded += 1;
                }
                Err(e) => log::warn!("Cue: could not load {:?}: {}", path, e),
            }
        }
        log::info!("Cue: loaded {}/{} assets from {:?}", loaded, CueSound::ALL.len(), dir);
        loaded
    }

    pub fn insert_asset(&mut self, sound: CueSound, clip: Clip) {
        self.assets.insert(sound, Arc::new(clip));
    }

    pub fn has_asset(&self, sound: CueSound) -> bool {
        self.assets.contains_key(&sound)
    }

    /// Play a cue, stopping whatever the channel was playing.
    pub fn play(&mut self, channel: CueChannel, sound: CueSound) {
        let Some(clip) = self.assets.get(&sound).cloned() else {
            log::debug!("Cue: no asset for {:?}, skipping", sound);
            return;
        };
        self.start_clip(channel, clip);
    }

    /// Play a cue and wait until the channel is no longer busy.
    pub fn play_blocking(&mut self, channel: CueChannel, sound: CueSound) {
        let Some(clip) = self.assets.get(&sound).cloned() else {
            log::debug!("Cue: no asset for {:?}, skipping", sound);
            return;
        };
        let limit = clip.duration() + self.blocking_timeout;
        if self.start_clip(channel, clip) {
            self.wait_until_idle(channel, limit);
        }
    }

    /// Load a WAV file and play it on `channel` (used for take replay).
    ///
    /// The whole file is decoded to `f32` up front on the calling thread: about
    /// 23 MB and a matching read per minute of 96 kHz mono take.
    pub fn play_file(&mut self, channel: CueChannel, path: &Path) -> Result<Duration, hound::Error> {
        let clip = Arc::new(Clip::from_wav(path)?);
        let duration = clip.duration();
        log::info!(
            "Cue: playing {:?} on {} ({:.1}s)",
            path,
            channel.as_str(),
            duration.as_secs_f32()
        );
        self.start_clip(channel, clip);
        Ok(duration)
    }

    pub fn stop(&mut self, channel: CueChannel) {
        if let Some(output) = self.outputs.get_mut(&channel) {
            output.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for output in self.outputs.values_mut() {
            output.stop();
        }
    }

    pub fn is_busy(&self, channel: CueChannel) -> bool {
        self.outputs
            .get(&channel)
            .map(|o| o.is_busy())
            .unwrap_or(false)
    }

    fn start_clip(&mut self, channel: CueChannel, clip: Arc<Clip>) -> bool {
        let Some(output) = self.outputs.get_mut(&channel) else {
            log::warn!("Cue: no output for channel {}", channel.as_str());
            return false;
        };
        output.stop();
        match output.start(clip) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Cue: playback on {} failed: {}", channel.as_str(), e);
                false
            }
        }
    }

    fn wait_until_idle(&self, channel: CueChannel, limit: Duration) {
        let started = Instant::now();
        while self.is_busy(channel) {
            if started.elapsed() >= limit {
                log::warn!(
                    "Cue: channel {} still busy after {:?}, continuing",
                    channel.as_str(),
                    limit
                );
                return;
            }
            thread::sleep(BUSY_POLL_INTERVAL);
        }
    }
}

/// Progress shared between a playback thread's callback and its owner.
struct PlaybackCursor {
    frame: AtomicUsize,
    finished: AtomicBool,
}

struct PlaybackThread {
    cursor: Arc<PlaybackCursor>,
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// A playback channel on the default output device.
///
/// Each clip gets its own output stream, built and dropped on a dedicated thread.
pub struct CpalChannelOutput {
    channel: CueChannel,
    active: Mutex<Option<PlaybackThread>>,
}

impl CpalChannelOutput {
    pub fn new(channel: CueChannel) -> Self {
        Self {
            channel,
            active: Mutex::new(None),
        }
    }
}

impl ChannelOutput for CpalChannelOutput {
    fn start(&mut self, clip: Arc<Clip>) -> Result<(), DeviceError> {
        self.stop();

        let cursor = Arc::new(PlaybackCursor {
            frame: AtomicUsize::new(0),
            finished: AtomicBool::new(clip.frames() == 0),
        });
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_cursor = cursor.clone();
        let name = format!("cue-{}", self.channel.as_str());

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let stream = match build_output_stream(clip, thread_cursor) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::StreamCreationFailed(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *self.active.lock() = Some(PlaybackThread {
                    cursor,
                    stop_tx,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::StreamCreationFailed(
                    "playback thread exited early".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.lock().take() {
            let _ = active.stop_tx.send(());
            if active.thread.join().is_err() {
                log::error!("Cue: playback thread for {} panicked", self.channel.as_str());
            }
        }
    }

    fn is_busy(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|a| !a.cursor.finished.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl Drop for CpalChannelOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_output_stream(clip: Arc<Clip>, cursor: Arc<PlaybackCursor>) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| DeviceError::DeviceNotFound("default output".to_string()))?;

    let default_config = device
        .default_output_config()
        .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;
    let sample_format = default_config.sample_format();
    let mut config: StreamConfig = default_config.into();

    let wanted = SampleRate(clip.sample_rate);
    let rate_supported = device
        .supported_output_configs()
        .map(|mut ranges| {
            ranges.any(|r| {
                r.channels() == config.channels
                    && r.sample_format() == sample_format
                    && r.min_sample_rate() <= wanted
                    && wanted <= r.max_sample_rate()
            })
        })
        .unwrap_or(false);

    if rate_supported {
        config.sample_rate = wanted;
    } else {
        log::warn!(
            "Cue: output device does not support {} Hz, playing at {} Hz",
            clip.sample_rate,
            config.sample_rate.0
        );
    }

    match sample_format {
        SampleFormat::F32 => build_output_stream_typed::<f32>(&device, &config, clip, cursor),
        SampleFormat::I16 => build_output_stream_typed::<i16>(&device, &config, clip, cursor),
        SampleFormat::U16 => build_output_stream_typed::<u16>(&device, &config, clip, cursor),
        SampleFormat::I32 => build_output_stream_typed::<i32>(&device, &config, clip, cursor),
        other => Err(DeviceError::UnsupportedConfig(format!(
            "output sample format {:?}",
            other
        ))),
    }
}

fn build_output_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    clip: Arc<Clip>,
    cursor: Arc<PlaybackCursor>,
) -> Result<cpal::Stream, DeviceError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let out_channels = usize::from(config.channels.max(1));
    let total_frames = clip.frames();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut frame = cursor.frame.load(Ordering::Relaxed);
                for out_frame in data.chunks_mut(out_channels) {
                    for (ch, sample) in out_frame.iter_mut().enumerate() {
                        let value = if frame < total_frames {
                            clip.sample_at(frame, ch)
                        } else {
                            0.0
                        };
                        *sample = T::from_sample(value);
                    }
                    frame = frame.saturating_add(1);
                }
                cursor.frame.store(frame, Ordering::Relaxed);
                if frame >= total_frames {
                    cursor.finished.store(true, Ordering::Release);
                }
            },
            |err| log::error!("Cue output stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}
