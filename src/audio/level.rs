//! Level metering and distortion detection for capture batches
//!
//! Pure functions over one batch of signed integer samples. The result is only
//! reported (meter + distortion event); it never gates capture.

/// Normalized peak above which a batch is reported as distorted (exclusive).
pub const DISTORTION_THRESHOLD: f64 = 0.8;

/// Default lower bound of the level meter.
pub const DEFAULT_METER_FLOOR_DB: f64 = -60.0;

/// Level of a single batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    /// `20 * log10(rms)`; negative infinity for silence
    pub level_db: f64,
    /// Normalized RMS in 0.0..=1.0
    pub rms: f64,
    /// Normalized peak in 0.0..=1.0
    pub peak: f64,
    pub is_distorted: bool,
}

/// Full-scale magnitude for a signed sample of `bits` width, i.e. `2^(bits-1)`.
pub fn full_scale(bits: u16) -> f64 {
    2f64.powi(i32::from(bits.max(1)) - 1)
}

/// Analyze one batch of samples of the given bit depth.
///
/// An empty batch reads as silence.
pub fn analyze(samples: &[i32], bits: u16) -> LevelReading {
    if samples.is_empty() {
        return LevelReading {
            level_db: f64::NEG_INFINITY,
            rms: 0.0,
            peak: 0.0,
            is_distorted: false,
        };
    }

    let scale = full_scale(bits);
    let mut sum_squares = 0.0f64;
    let mut peak_abs: i64 = 0;

    for &sample in samples {
        // i64 so that i32::MIN has an absolute value
        let abs = i64::from(sample).abs();
        peak_abs = peak_abs.max(abs);
        let normalized = sample as f64 / scale;
        sum_squares += normalized * normalized;
    }

    let rms = (sum_squares / samples.len() as f64).sqrt();
    let peak = peak_abs as f64 / scale;

    LevelReading {
        level_db: rms_to_db(rms),
        rms,
        peak,
        is_distorted: exceeds_distortion_threshold(peak),
    }
}

/// `20 * log10(rms)`. Zero maps to negative infinity.
pub fn rms_to_db(rms: f64) -> f64 {
    if rms <= 0.0 {
        return f64::NEG_INFINITY;
    }
    20.0 * rms.log10()
}

pub fn exceeds_distortion_threshold(peak: f64) -> bool {
    peak > DISTORTION_THRESHOLD
}

/// Clamp a level for display: non-finite or below-floor values become the floor.
pub fn display_db(level_db: f64, floor_db: f64) -> f64 {
    if level_db.is_nan() || level_db < floor_db {
        return floor_db;
    }
    level_db.min(0.0)
}

/// Map a level onto a 0..=100 meter between `floor_db` and 0 dBFS.
pub fn meter_percent(level_db: f64, floor_db: f64) -> u8 {
    if floor_db >= 0.0 {
        return 0;
    }
    let clamped = display_db(level_db, floor_db);
    let fraction = (clamped - floor_db) / -floor_db;
    (fraction * 100.0).round().clamp(0.0, 100.0) as u8
}
