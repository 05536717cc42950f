//! Leftover take detection and resolution
//!
//! A temp take still present when a directory is selected means the previous
//! run ended without finalizing it. The scan only reports what it finds; the
//! operator decides what happens to a non-empty leftover.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::paths::{temp_take_path, Destination};
use super::visibility::VisibilityHook;
use super::writer::move_into;
use crate::error::RecorderError;

/// What a scan found in a session directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LeftoverState {
    None,
    /// Nothing worth keeping (zero bytes or header only)
    Empty { path: PathBuf },
    #[serde(rename_all = "camelCase")]
    NonEmpty { path: PathBuf, size_bytes: u64 },
}

/// Operator decision for a non-empty leftover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    Keep,
    Discard,
    Delete,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Moved {
        path: PathBuf,
        destination: Destination,
    },
    Deleted,
    /// Left in place; the directory stays blocked
    Skipped,
    /// No leftover was there to resolve
    Nothing,
}

impl RecoveryOutcome {
    pub fn unblocks(&self) -> bool {
        !matches!(self, RecoveryOutcome::Skipped)
    }
}

/// Look for a leftover temp take in `session_dir`.
pub fn scan(session_dir: &Path) -> Result<LeftoverState, RecorderError> {
    let path = temp_take_path(session_dir);
    let size_bytes = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LeftoverState::None),
        Err(e) => return Err(RecorderError::io(&path, e)),
    };

    if size_bytes == 0 || is_header_only(&path, size_bytes) {
        log::info!("Empty leftover take at {:?}", path);
        return Ok(LeftoverState::Empty { path });
    }

    log::info!("Leftover take at {:?} ({} bytes)", path, size_bytes);
    Ok(LeftoverState::NonEmpty { path, size_bytes })
}

/// Remove an empty leftover. A file already gone counts as removed.
pub fn delete_empty(path: &Path) -> Result<(), RecorderError> {
    remove_leftover(path)
}

/// Apply the operator's choice to the leftover in `session_dir`.
pub fn resolve(
    session_dir: &Path,
    choice: RecoveryChoice,
    visibility: &dyn VisibilityHook,
) -> Result<RecoveryOutcome, RecorderError> {
    let path = temp_take_path(session_dir);
    if !path.exists() {
        log::warn!("Nothing to resolve at {:?}", path);
        return Ok(RecoveryOutcome::Nothing);
    }

    let destination = match choice {
        RecoveryChoice::Skip => {
            log::info!("Leftover take skipped, {:?} stays blocked", session_dir);
            return Ok(RecoveryOutcome::Skipped);
        }
        RecoveryChoice::Delete => {
            remove_leftover(&path)?;
            log::info!("Leftover take deleted: {:?}", path);
            return Ok(RecoveryOutcome::Deleted);
        }
        RecoveryChoice::Keep => Destination::Keep,
        RecoveryChoice::Discard => Destination::Discard,
    };

    match repair_header(&path) {
        Ok(true) => log::info!("Repaired WAV header of {:?}", path),
        Ok(false) => {}
        Err(e) => log::warn!("Could not repair {:?}, moving as-is: {}", path, e),
    }

    let moved = move_into(&path, &destination.dir(session_dir))?;
    visibility.unmark_temporary(&moved);
    log::info!("Leftover take recovered to {:?}", moved);
    Ok(RecoveryOutcome::Moved {
        path: moved,
        destination,
    })
}

fn remove_leftover(path: &Path) -> Result<(), RecorderError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("Leftover already gone: {:?}", path);
            Ok(())
        }
        Err(e) => Err(RecorderError::io(path, e)),
    }
}

/// Where the audio starts and how big one sample frame is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WavLayout {
    data_offset: u64,
    block_align: u16,
}

/// Walk the RIFF chunks up to the `data` chunk.
///
/// Returns `None` for anything that is not a PCM WAV we can make sense of.
fn read_layout(file: &mut File, file_len: u64) -> std::io::Result<Option<WavLayout>> {
    let mut riff = [0u8; 12];
    file.seek(SeekFrom::Start(0))?;
    if file_len < 12 {
        return Ok(None);
    }
    file.read_exact(&mut riff)?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return Ok(None);
    }

    let mut block_align = None;
    let mut pos = 12u64;
    while pos + 8 <= file_len {
        let mut header = [0u8; 8];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut header)?;
        let size = u64::from(u32::from_le_bytes([header[4], header[5], header[6], header[7]]));

        match &header[0..4] {
            b"fmt " => {
                if size < 16 || pos + 8 + 16 > file_len {
                    return Ok(None);
                }
                let mut fmt = [0u8; 16];
                file.read_exact(&mut fmt)?;
                block_align = Some(u16::from_le_bytes([fmt[12], fmt[13]]));
            }
            b"data" => {
                return Ok(block_align.filter(|&b| b > 0).map(|block_align| WavLayout {
                    data_offset: pos + 8,
                    block_align,
                }));
            }
            _ => {}
        }
        // Chunks are word aligned
        pos += 8 + size + (size & 1);
    }
    Ok(None)
}

fn is_header_only(path: &Path, file_len: u64) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    match read_layout(&mut file, file_len) {
        Ok(Some(layout)) => file_len.saturating_sub(layout.data_offset) < u64::from(layout.block_align),
        _ => false,
    }
}

/// Rewrite the RIFF and `data` sizes from the real file length.
///
/// A take interrupted mid-flush can hold more audio than its header claims,
/// or end in a partial sample. The trailing partial sample is cut off.
/// Returns whether the file changed.
pub fn repair_header(path: &Path) -> Result<bool, RecorderError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| RecorderError::io(path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| RecorderError::io(path, e))?
        .len();

    let layout = read_layout(&mut file, file_len)
        .map_err(|e| RecorderError::io(path, e))?
        .ok_or_else(|| RecorderError::Wav(format!("{:?} is not a PCM WAV file", path)))?;

    let audio_bytes = file_len - layout.data_offset;
    let aligned = audio_bytes - audio_bytes % u64::from(layout.block_align);
    let new_len = layout.data_offset + aligned;
    let riff_size = u32::try_from(new_len - 8).unwrap_or(u32::MAX);
    let data_size = u32::try_from(aligned).unwrap_or(u32::MAX);

    let mut current = [0u8; 4];
    let mut changed = false;

    file.seek(SeekFrom::Start(4))
        .and_then(|_| file.read_exact(&mut current))
        .map_err(|e| RecorderError::io(path, e))?;
    if u32::from_le_bytes(current) != riff_size {
        file.seek(SeekFrom::Start(4))
            .and_then(|_| file.write_all(&riff_size.to_le_bytes()))
            .map_err(|e| RecorderError::io(path, e))?;
        changed = true;
    }

    let data_size_at = layout.data_offset - 4;
    file.seek(SeekFrom::Start(data_size_at))
        .and_then(|_| file.read_exact(&mut current))
        .map_err(|e| RecorderError::io(path, e))?;
    if u32::from_le_bytes(current) != data_size {
        file.seek(SeekFrom::Start(data_size_at))
            .and_then(|_| file.write_all(&data_size.to_le_bytes()))
            .map_err(|e| RecorderError::io(path, e))?;
        changed = true;
    }

    if new_len < file_len {
        file.set_len(new_len).map_err(|e| RecorderError::io(path, e))?;
        changed = true;
    }

    file.sync_all().map_err(|e| RecorderError::io(path, e))?;
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::take::paths::list_tracks;
    use crate::take::visibility::NoopVisibility;
    use crate::take::writer::TakeFormat;

    fn write_wav(path: &Path, samples: &[i32]) {
        let mut writer = hound::WavWriter::create(path, TakeFormat::default().wav_spec()).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn read_samples(path: &Path) -> Vec<i32> {
        hound::WavReader::open(path)
            .unwrap()
            .samples::<i32>()
            .map(|s| s.unwrap())
            .collect()
    }

    #[test]
    fn no_leftover() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(scan(dir.path()).unwrap(), LeftoverState::None);
    }

    #[test]
    fn zero_byte_leftover_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_take_path(dir.path());
        std::fs::write(&path, b"").unwrap();

        assert_eq!(scan(dir.path()).unwrap(), LeftoverState::Empty { path: path.clone() });
        delete_empty(&path).unwrap();
        assert!(!path.exists());
        // Second delete is a no-op
        delete_empty(&path).unwrap();
    }

    #[test]
    fn header_only_leftover_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_take_path(dir.path());
        write_wav(&path, &[]);
        assert!(matches!(scan(dir.path()).unwrap(), LeftoverState::Empty { .. }));
    }

    #[test]
    fn leftover_with_audio_is_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_take_path(dir.path());
        write_wav(&path, &[1, 2, 3, 4]);
        let size = std::fs::metadata(&path).unwrap().len();

        assert_eq!(
            scan(dir.path()).unwrap(),
            LeftoverState::NonEmpty {
                path,
                size_bytes: size
            }
        );
    }

    #[test]
    fn non_wav_garbage_is_non_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_take_path(dir.path()), b"garbage").unwrap();
        assert!(matches!(scan(dir.path()).unwrap(), LeftoverState::NonEmpty { .. }));
    }

    #[test]
    fn repair_recovers_unaccounted_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_take_path(dir.path());
        write_wav(&path, &[10, 20]);

        // Audio written after the last header update, ending in a partial sample
        let tail: Vec<i32> = vec![30, 40, 50];
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        for s in &tail {
            file.write_all(&s.to_le_bytes()).unwrap();
        }
        file.write_all(&[0xAB, 0xCD]).unwrap();
        drop(file);

        assert!(repair_header(&path).unwrap());
        assert_eq!(read_samples(&path), vec![10, 20, 30, 40, 50]);
        // Already consistent now
        assert!(!repair_header(&path).unwrap());
    }

    #[test]
    fn repair_rejects_non_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.wav");
        std::fs::write(&path, b"not a wav file at all").unwrap();
        assert!(matches!(repair_header(&path), Err(RecorderError::Wav(_))));
    }

    #[test]
    fn keep_moves_leftover_into_keep() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&temp_take_path(dir.path()), &[1, 2, 3]);

        let outcome = resolve(dir.path(), RecoveryChoice::Keep, &NoopVisibility).unwrap();
        let RecoveryOutcome::Moved { path, destination } = outcome else {
            panic!("expected a move");
        };
        assert_eq!(destination, Destination::Keep);
        assert_eq!(list_tracks(&dir.path().join("keep")).unwrap(), vec![path.clone()]);
        assert_eq!(read_samples(&path), vec![1, 2, 3]);
        assert!(!temp_take_path(dir.path()).exists());
    }

    #[test]
    fn discard_moves_leftover_into_discard() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&temp_take_path(dir.path()), &[1]);

        let outcome = resolve(dir.path(), RecoveryChoice::Discard, &NoopVisibility).unwrap();
        assert!(matches!(
            outcome,
            RecoveryOutcome::Moved {
                destination: Destination::Discard,
                ..
            }
        ));
        assert_eq!(list_tracks(&dir.path().join("discard")).unwrap().len(), 1);
        assert!(!dir.path().join("keep").exists());
    }

    #[test]
    fn delete_removes_leftover() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&temp_take_path(dir.path()), &[1]);

        assert_eq!(
            resolve(dir.path(), RecoveryChoice::Delete, &NoopVisibility).unwrap(),
            RecoveryOutcome::Deleted
        );
        assert_eq!(scan(dir.path()).unwrap(), LeftoverState::None);
    }

    #[test]
    fn skip_leaves_leftover_in_place() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&temp_take_path(dir.path()), &[1]);

        let outcome = resolve(dir.path(), RecoveryChoice::Skip, &NoopVisibility).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Skipped);
        assert!(!outcome.unblocks());
        assert!(matches!(scan(dir.path()).unwrap(), LeftoverState::NonEmpty { .. }));
    }

    #[test]
    fn resolve_without_leftover_is_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve(dir.path(), RecoveryChoice::Keep, &NoopVisibility).unwrap(),
            RecoveryOutcome::Nothing
        );
    }
}
