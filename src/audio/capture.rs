//! Capture device interface and the CPAL implementation
//!
//! The core needs one thing from a device: a mono, 32-bit signed, 96 kHz input
//! stream delivered in fixed batches to a callback. `CaptureBackend` is that
//! seam; `CpalBackend` is the real one. It opens whatever 96 kHz integer or
//! float layout the device offers and hands channel 0 on as `i32`.

use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, StreamConfig};
use parking_lot::Mutex;
use serde::Serialize;

/// Fixed capture format.
pub const CAPTURE_SAMPLE_RATE: u32 = 96_000;
pub const CAPTURE_CHANNELS: u16 = 1;
pub const CAPTURE_BITS: u16 = 32;
pub const FRAMES_PER_BATCH: u32 = 1024;

/// Errors from device selection and stream setup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("No input device selected")]
    NoDeviceSelected,
    #[error("No audio input devices found")]
    NoInputDevices,
    #[error("Input device not found: {0}")]
    DeviceNotFound(String),
    #[error("Device does not support the capture format: {0}")]
    UnsupportedConfig(String),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to enumerate audio devices: {0}")]
    Enumeration(String),
}

/// An input device the operator can pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputDevice {
    pub id: String,
    pub name: String,
}

/// Stream parameters requested from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits: u16,
    pub frames_per_batch: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: CAPTURE_CHANNELS,
            bits: CAPTURE_BITS,
            frames_per_batch: FRAMES_PER_BATCH,
        }
    }
}

/// Callback receiving mono samples, invoked on the device's real-time thread.
pub type FrameCallback = Box<dyn FnMut(&[i32]) + Send + 'static>;

/// A source of capture streams (allows an in-memory backend in tests).
pub trait CaptureBackend: Send {
    fn list_input_devices(&self) -> Result<Vec<InputDevice>, DeviceError>;

    /// Open and start a stream, replacing any stream that is already open.
    fn open_stream(
        &mut self,
        device_id: &str,
        config: &CaptureConfig,
        on_frames: FrameCallback,
    ) -> Result<(), DeviceError>;

    /// Stop the stream. Returns only after the callback can no longer run.
    fn close_stream(&mut self);

    fn is_open(&self) -> bool;
}

/// A running CPAL stream, owned by its own thread.
///
/// `cpal::Stream` is not `Send` on every platform, so the stream is built,
/// played and dropped on the same dedicated thread.
struct StreamThread {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// CPAL-backed capture.
#[derive(Default)]
pub struct CpalBackend {
    active: Option<StreamThread>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureBackend for CpalBackend {
    fn list_input_devices(&self) -> Result<Vec<InputDevice>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

        let list: Vec<InputDevice> = devices
            .filter_map(|d| d.name().ok())
            .map(|name| InputDevice {
                id: name.clone(),
                name,
            })
            .collect();

        log::debug!("Found {} input devices", list.len());
        Ok(list)
    }

    fn open_stream(
        &mut self,
        device_id: &str,
        config: &CaptureConfig,
        on_frames: FrameCallback,
    ) -> Result<(), DeviceError> {
        self.close_stream();

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_id = device_id.to_string();
        let config = *config;

        let thread = thread::Builder::new()
            .name("capture-stream".into())
            .spawn(move || {
                let stream = match find_input_device(&device_id)
                    .and_then(|device| build_input_stream(&device, &config, on_frames))
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(()));
                // Park until close_stream (or the backend is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture stream for {} dropped", device_id);
            })
            .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.active = Some(StreamThread { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::StreamCreationFailed(
                    "capture thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    fn close_stream(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.stop_tx.send(());
            if active.thread.join().is_err() {
                log::error!("Capture stream thread panicked");
            }
            log::info!("Capture stream closed");
        }
    }

    fn is_open(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for CpalBackend {
    fn drop(&mut self) {
        self.close_stream();
    }
}

fn find_input_device(device_id: &str) -> Result<Device, DeviceError> {
    let host = cpal::default_host();
    let mut devices = host
        .input_devices()
        .map_err(|e| DeviceError::Enumeration(e.to_string()))?;

    devices
        .find(|d| d.name().map(|n| n == device_id).unwrap_or(false))
        .ok_or_else(|| DeviceError::DeviceNotFound(device_id.to_string()))
}

/// A capture format a device offers natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NativeFormat {
    channels: u16,
    sample_format: SampleFormat,
    min_rate: u32,
    max_rate: u32,
}

/// Pick the native format to open at the capture rate.
///
/// Integer 32-bit is preferred, then float, then 16-bit. Within a format the
/// requested channel count wins, then the fewest channels. Channel 0 of
/// whatever is opened becomes the mono take.
fn choose_native_format(
    offered: &[NativeFormat],
    config: &CaptureConfig,
) -> Option<(SampleFormat, u16)> {
    let rank = |format: SampleFormat| match format {
        SampleFormat::I32 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::I16 => Some(2),
        SampleFormat::U16 => Some(3),
        _ => None,
    };

    offered
        .iter()
        .filter(|f| f.channels > 0)
        .filter(|f| f.min_rate <= config.sample_rate && config.sample_rate <= f.max_rate)
        .filter_map(|f| rank(f.sample_format).map(|r| (r, f)))
        .min_by_key(|(r, f)| (*r, f.channels != config.channels, f.channels))
        .map(|(_, f)| (f.sample_format, f.channels))
}

fn negotiate_format(
    device: &Device,
    config: &CaptureConfig,
) -> Result<(SampleFormat, u16), DeviceError> {
    let offered: Vec<NativeFormat> = device
        .supported_input_configs()
        .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?
        .map(|range| NativeFormat {
            channels: range.channels(),
            sample_format: range.sample_format(),
            min_rate: range.min_sample_rate().0,
            max_rate: range.max_sample_rate().0,
        })
        .collect();

    choose_native_format(&offered, config).ok_or_else(|| {
        DeviceError::UnsupportedConfig(format!(
            "no i16/i32/f32 input at {} Hz",
            config.sample_rate
        ))
    })
}

/// Copy channel 0 of an interleaved buffer into `out` as 32-bit integers.
fn first_channel_to_i32<T>(data: &[T], channels: usize, out: &mut Vec<i32>)
where
    T: Copy,
    i32: FromSample<T>,
{
    out.clear();
    out.extend(
        data.iter()
            .step_by(channels.max(1))
            .map(|&s| i32::from_sample(s)),
    );
}

fn build_input_stream(
    device: &Device,
    config: &CaptureConfig,
    on_frames: FrameCallback,
) -> Result<cpal::Stream, DeviceError> {
    let (sample_format, channels) = negotiate_format(device, config)?;

    log::info!(
        "Opening capture stream on {:?}: {} Hz, {} ch {:?} (channel 0 kept), {} frames/batch",
        device.name(),
        config.sample_rate,
        channels,
        sample_format,
        config.frames_per_batch
    );

    // Shared so a failed first attempt does not consume the callback. Only one
    // stream ever calls it, so the lock is never contended.
    let shared = Arc::new(Mutex::new(on_frames));

    let mut stream_config = StreamConfig {
        channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: BufferSize::Fixed(config.frames_per_batch),
    };

    match build_stream(device, &stream_config, sample_format, shared.clone(), config) {
        Ok(stream) => Ok(stream),
        Err(e) => {
            // Not every host honours a fixed buffer size
            log::warn!(
                "Fixed {}-frame buffer rejected ({}), falling back to device default",
                config.frames_per_batch,
                e
            );
            stream_config.buffer_size = BufferSize::Default;
            build_stream(device, &stream_config, sample_format, shared, config)
        }
    }
}

fn build_stream(
    device: &Device,
    stream_config: &StreamConfig,
    sample_format: SampleFormat,
    slot: Arc<Mutex<FrameCallback>>,
    config: &CaptureConfig,
) -> Result<cpal::Stream, DeviceError> {
    match sample_format {
        SampleFormat::I32 => build_stream_typed::<i32>(device, stream_config, slot, config),
        SampleFormat::F32 => build_stream_typed::<f32>(device, stream_config, slot, config),
        SampleFormat::I16 => build_stream_typed::<i16>(device, stream_config, slot, config),
        SampleFormat::U16 => build_stream_typed::<u16>(device, stream_config, slot, config),
        other => Err(DeviceError::UnsupportedConfig(format!("{:?}", other))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    stream_config: &StreamConfig,
    slot: Arc<Mutex<FrameCallback>>,
    config: &CaptureConfig,
) -> Result<cpal::Stream, DeviceError>
where
    T: SizedSample + Send + 'static,
    i32: FromSample<T>,
{
    let channels = usize::from(stream_config.channels);
    let mut mono: Vec<i32> = Vec::with_capacity(config.frames_per_batch as usize);
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            stream_config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                first_channel_to_i32(data, channels, &mut mono);
                if let Some(mut cb) = slot.try_lock() {
                    cb(&mono);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| DeviceError::StreamCreationFailed(e.to_string()))
}
