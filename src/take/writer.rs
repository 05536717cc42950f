//! Durable buffered writer for a single take
//!
//! Frames are appended to an in-memory buffer and written to the temp WAV once
//! the buffer reaches the flush threshold. Every flush also rewrites the WAV
//! header, so after a crash the temp file is a playable WAV holding everything
//! up to the last flush.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use hound::{WavSpec, WavWriter};

use super::paths::{unique_track_path, unix_now};
use super::visibility::VisibilityHook;
use crate::audio::{CAPTURE_BITS, CAPTURE_CHANNELS, CAPTURE_SAMPLE_RATE};
use crate::error::RecorderError;

/// Buffered bytes that trigger a write to disk (10 MiB).
pub const DEFAULT_FLUSH_THRESHOLD_BYTES: usize = 10 * 1024 * 1024;

type TakeWavWriter = WavWriter<BufWriter<File>>;

/// On-disk format of a take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeFormat {
    pub channels: u16,
    pub sample_width_bytes: u16,
    pub sample_rate: u32,
}

impl Default for TakeFormat {
    fn default() -> Self {
        Self {
            channels: CAPTURE_CHANNELS,
            sample_width_bytes: CAPTURE_BITS / 8,
            sample_rate: CAPTURE_SAMPLE_RATE,
        }
    }
}

impl TakeFormat {
    pub fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.sample_width_bytes * 8,
            sample_format: hound::SampleFormat::Int,
        }
    }
}

/// Metadata of an open take.
#[derive(Debug, Clone)]
pub struct Take {
    pub temp_path: PathBuf,
    pub format: TakeFormat,
    pub started_at: DateTime<Local>,
    /// Samples already written to disk (not counting the buffer)
    pub samples_written: u64,
}

impl Take {
    pub fn duration_secs(&self) -> f64 {
        let per_second = u64::from(self.format.sample_rate) * u64::from(self.format.channels);
        if per_second == 0 {
            return 0.0;
        }
        self.samples_written as f64 / per_second as f64
    }
}

/// Writer for one take's temp file.
///
/// `writer` is `None` once `finalize` has closed the file. A failed move
/// reopens it for appending, so recording can go on and `finalize` be retried.
pub struct TakeWriter {
    take: Take,
    writer: Option<TakeWavWriter>,
    buffer: Vec<i32>,
    flush_threshold_bytes: usize,
    visibility: Arc<dyn VisibilityHook>,
}

impl TakeWriter {
    /// Create the temp file and write its header.
    pub fn open(
        path: &Path,
        format: TakeFormat,
        flush_threshold_bytes: usize,
        visibility: Arc<dyn VisibilityHook>,
    ) -> Result<Self, RecorderError> {
        let writer =
            WavWriter::create(path, format.wav_spec()).map_err(|e| RecorderError::from_wav(path, e))?;
        visibility.mark_temporary(path);

        log::info!(
            "Take opened: {:?} ({} Hz, {} ch, {}-bit)",
            path,
            format.sample_rate,
            format.channels,
            format.sample_width_bytes * 8
        );

        Ok(Self {
            take: Take {
                temp_path: path.to_path_buf(),
                format,
                started_at: Local::now(),
                samples_written: 0,
            },
            writer: Some(writer),
            buffer: Vec::new(),
            flush_threshold_bytes,
            visibility,
        })
    }

    pub fn take(&self) -> &Take {
        &self.take
    }

    pub fn temp_path(&self) -> &Path {
        &self.take.temp_path
    }

    /// Buffer a batch. Never touches the disk.
    pub fn append(&mut self, frame: &[i32]) {
        self.buffer.extend_from_slice(frame);
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len() * usize::from(self.take.format.sample_width_bytes)
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Write the buffer out once it has reached the threshold.
    ///
    /// Returns whether a flush happened.
    pub fn flush_if_threshold_exceeded(&mut self) -> Result<bool, RecorderError> {
        if self.buffered_bytes() < self.flush_threshold_bytes {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Write every buffered sample and update the header.
    ///
    /// On failure, samples that did reach the file are dropped from the buffer
    /// and the rest are kept for a retry.
    pub fn flush(&mut self) -> Result<(), RecorderError> {
        let path = self.take.temp_path.clone();
        if self.writer.is_none() {
            if self.buffer.is_empty() {
                return Ok(());
            }
            self.reopen()?;
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(RecorderError::invalid_state("write audio", "the take is closed"));
        };

        if !self.buffer.is_empty() {
            let mut failure = None;
            for (written, &sample) in self.buffer.iter().enumerate() {
                if let Err(e) = writer.write_sample(sample) {
                    failure = Some((written, e));
                    break;
                }
            }
            if let Some((written, e)) = failure {
                self.buffer.drain(..written);
                self.take.samples_written += written as u64;
                log::error!("Take flush failed after {} samples: {}", written, e);
                return Err(RecorderError::from_wav(path, e));
            }
            self.take.samples_written += self.buffer.len() as u64;
            log::debug!(
                "Take flushed {} samples ({} total) to {:?}",
                self.buffer.len(),
                self.take.samples_written,
                path
            );
            self.buffer.clear();
        }

        writer
            .flush()
            .map_err(|e| RecorderError::from_wav(&path, e))?;
        Ok(())
    }

    /// Flush, close, and move the take to `destination_root/track_<unixSeconds>.wav`.
    pub fn finalize(&mut self, destination_root: &Path) -> Result<PathBuf, RecorderError> {
        let temp_path = self.take.temp_path.clone();
        if !temp_path.exists() {
            log::error!("Take file vanished before finalize: {:?}", temp_path);
            return Err(RecorderError::NotFound(temp_path));
        }

        // A closed take still holding samples is reopened here; if that fails
        // the buffer stays put and nothing moves.
        self.flush()?;
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| RecorderError::from_wav(&temp_path, e))?;
        }

        let destination = match move_into(&temp_path, destination_root) {
            Ok(destination) => destination,
            Err(e) => {
                // A later flush or finalize tries again
                if let Err(reopen) = self.reopen() {
                    log::error!("Could not reopen take after failed move: {}", reopen);
                }
                return Err(e);
            }
        };
        self.visibility.unmark_temporary(&destination);

        log::info!(
            "Take finalized: {:?} ({:.1}s)",
            destination,
            self.take.duration_secs()
        );
        Ok(destination)
    }

    /// Reopen the closed temp file for appending after a failed move.
    fn reopen(&mut self) -> Result<(), RecorderError> {
        match WavWriter::append(&self.take.temp_path) {
            Ok(writer) => {
                log::info!("Take reopened for appending: {:?}", self.take.temp_path);
                self.writer = Some(writer);
                Ok(())
            }
            Err(e) => Err(RecorderError::from_wav(&self.take.temp_path, e)),
        }
    }

    /// Close and delete the temp file without keeping it.
    ///
    /// A file that is already gone is logged and treated as discarded.
    pub fn discard(mut self) -> Result<(), RecorderError> {
        // Dropping the hound writer finalizes the header; the file goes anyway.
        self.buffer.clear();
        drop(self.writer.take());

        match std::fs::remove_file(&self.take.temp_path) {
            Ok(()) => {
                log::info!("Take discarded: {:?}", self.take.temp_path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Take already gone at discard: {:?}", self.take.temp_path);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to discard take {:?}: {}", self.take.temp_path, e);
                Err(RecorderError::io(&self.take.temp_path, e))
            }
        }
    }
}

/// Move a closed temp take into `destination_root` under a fresh track name.
pub(crate) fn move_into(temp_path: &Path, destination_root: &Path) -> Result<PathBuf, RecorderError> {
    std::fs::create_dir_all(destination_root)
        .map_err(|e| RecorderError::io(destination_root, e))?;

    let destination = unique_track_path(destination_root, unix_now());
    match std::fs::rename(temp_path, &destination) {
        Ok(()) => Ok(destination),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::error!("Take file vanished during move: {:?}", temp_path);
            Err(RecorderError::NotFound(temp_path.to_path_buf()))
        }
        Err(e) => {
            log::error!(
                "Failed to move take {:?} to {:?}: {}",
                temp_path,
                destination,
                e
            );
            Err(RecorderError::io(destination, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::take::paths::{list_tracks, temp_take_path, Destination};
    use crate::take::visibility::NoopVisibility;

    fn open_writer(dir: &Path, threshold: usize) -> TakeWriter {
        TakeWriter::open(
            &temp_take_path(dir),
            TakeFormat::default(),
            threshold,
            Arc::new(NoopVisibility),
        )
        .unwrap()
    }

    fn read_samples(path: &Path) -> Vec<i32> {
        let mut reader = hound::WavReader::open(path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 32);
        assert_eq!(spec.sample_rate, 96_000);
        reader.samples::<i32>().map(|s| s.unwrap()).collect()
    }

    fn batch(seed: i32) -> Vec<i32> {
        (0..1024).map(|i| seed.wrapping_mul(1_000_003).wrapping_add(i * 7919)).collect()
    }

    #[test]
    fn default_threshold_is_ten_mib() {
        assert_eq!(DEFAULT_FLUSH_THRESHOLD_BYTES, 10_485_760);
    }

    #[test]
    fn open_fails_on_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("take.wav");
        let result = TakeWriter::open(
            &path,
            TakeFormat::default(),
            DEFAULT_FLUSH_THRESHOLD_BYTES,
            Arc::new(NoopVisibility),
        );
        assert!(matches!(result, Err(RecorderError::Io { .. })));
    }

    #[test]
    fn append_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        let header_len = std::fs::metadata(writer.temp_path()).unwrap().len();

        writer.append(&batch(1));
        writer.append(&batch(2));

        assert_eq!(writer.buffered_bytes(), 2 * 1024 * 4);
        assert_eq!(std::fs::metadata(writer.temp_path()).unwrap().len(), header_len);
    }

    #[test]
    fn below_threshold_leaves_buffer_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), 3 * 1024 * 4);
        writer.append(&batch(1));
        writer.append(&batch(2));

        assert!(!writer.flush_if_threshold_exceeded().unwrap());
        assert_eq!(writer.buffered_samples(), 2048);
        assert_eq!(writer.take().samples_written, 0);
    }

    #[test]
    fn at_threshold_flushes_once_and_empties_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), 3 * 1024 * 4);
        for seed in 0..3 {
            writer.append(&batch(seed));
        }

        assert!(writer.flush_if_threshold_exceeded().unwrap());
        assert_eq!(writer.buffered_samples(), 0);
        assert_eq!(writer.take().samples_written, 3 * 1024);

        // Nothing left to flush
        assert!(!writer.flush_if_threshold_exceeded().unwrap());
        assert_eq!(writer.take().samples_written, 3 * 1024);
    }

    #[test]
    fn flushed_temp_file_is_readable_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), 1024 * 4);
        writer.append(&batch(5));
        assert!(writer.flush_if_threshold_exceeded().unwrap());

        assert_eq!(read_samples(writer.temp_path()), batch(5));
    }

    #[test]
    fn finalize_round_trips_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), 2 * 1024 * 4);
        let mut expected = Vec::new();
        for seed in 0..5 {
            let b = batch(seed);
            expected.extend_from_slice(&b);
            writer.append(&b);
            writer.flush_if_threshold_exceeded().unwrap();
        }

        let keep = Destination::Keep.dir(dir.path());
        let path = writer.finalize(&keep).unwrap();

        assert!(!temp_take_path(dir.path()).exists());
        assert_eq!(path.parent().unwrap(), keep);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("track_") && name.ends_with(".wav"));
        assert_eq!(read_samples(&path), expected);
        assert_eq!(list_tracks(&keep).unwrap(), vec![path]);
    }

    #[test]
    fn finalize_reports_vanished_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        writer.append(&batch(1));
        std::fs::remove_file(writer.temp_path()).unwrap();

        let result = writer.finalize(&Destination::Keep.dir(dir.path()));
        assert!(matches!(result, Err(RecorderError::NotFound(_))));
    }

    #[test]
    fn failed_move_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        writer.append(&batch(9));

        // A plain file where the destination directory should be
        let blocked = dir.path().join("keep");
        std::fs::write(&blocked, b"not a dir").unwrap();
        assert!(matches!(
            writer.finalize(&blocked),
            Err(RecorderError::Io { .. })
        ));
        assert!(temp_take_path(dir.path()).exists());

        // Still writable after the failed move
        writer.append(&batch(10));

        std::fs::remove_file(&blocked).unwrap();
        let path = writer.finalize(&blocked).unwrap();
        let mut expected = batch(9);
        expected.extend(batch(10));
        assert_eq!(read_samples(&path), expected);
    }

    /// Close the file behind the writer's back, as after a failed move whose
    /// reopen also failed.
    fn close_file(writer: &mut TakeWriter) {
        writer.writer.take().unwrap().finalize().unwrap();
    }

    #[test]
    fn finalize_reopens_closed_take_with_buffered_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        writer.append(&batch(1));
        writer.flush().unwrap();
        close_file(&mut writer);
        writer.append(&batch(2));

        let path = writer.finalize(&Destination::Keep.dir(dir.path())).unwrap();
        let mut expected = batch(1);
        expected.extend(batch(2));
        assert_eq!(read_samples(&path), expected);
    }

    #[test]
    fn finalize_keeps_buffer_when_take_cannot_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        writer.append(&batch(1));
        writer.flush().unwrap();
        close_file(&mut writer);
        writer.append(&batch(2));
        std::fs::write(writer.temp_path(), b"garbage, not a wav file").unwrap();

        let keep = Destination::Keep.dir(dir.path());
        assert!(writer.finalize(&keep).is_err());
        assert_eq!(writer.buffered_samples(), 1024);
        assert!(temp_take_path(dir.path()).exists());
        assert!(list_tracks(&keep).unwrap().is_empty());

        // A plain flush fails the same way and keeps the audio
        assert!(writer.flush().is_err());
        assert_eq!(writer.buffered_samples(), 1024);
    }

    #[test]
    fn discard_deletes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        writer.append(&batch(1));
        writer.discard().unwrap();
        assert!(!temp_take_path(dir.path()).exists());
    }

    #[test]
    fn discard_of_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = open_writer(dir.path(), DEFAULT_FLUSH_THRESHOLD_BYTES);
        std::fs::remove_file(writer.temp_path()).unwrap();
        assert!(writer.discard().is_ok());
    }

    #[test]
    fn duration_counts_flushed_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = open_writer(dir.path(), 4);
        writer.append(&vec![0; 96_000]);
        writer.flush_if_threshold_exceeded().unwrap();
        assert!((writer.take().duration_secs() - 1.0).abs() < 1e-9);
    }
}
