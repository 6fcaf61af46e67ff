//! Amplitude metering for the volume feed
//!
//! Captured and played frames are reduced to a single RMS value, scaled to
//! the 0-100 range the UI layer renders, and EMA-smoothed so the meter does
//! not jitter between frames.

use rand::Rng;

/// Gain applied to normalized RMS before clamping to 100.
/// Conversational speech sits around 0.05-0.2 RMS.
const LEVEL_GAIN: f32 = 400.0;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous)
const EMA_ALPHA: f32 = 0.3;

/// Bounds of the synthetic speaking level
const SYNTHETIC_MIN: f32 = 20.0;
const SYNTHETIC_MAX: f32 = 80.0;

/// Root-mean-square of normalized f32 samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Scale an RMS value into the [0, 100] volume range
pub fn level_from_rms(rms: f32) -> f32 {
    (rms * LEVEL_GAIN).clamp(0.0, 100.0)
}

/// Volume of one frame in [0, 100]
pub fn frame_level(samples: &[f32]) -> f32 {
    level_from_rms(rms(samples))
}

/// EMA-smoothed level meter
#[derive(Debug, Clone, Default)]
pub struct LevelMeter {
    prev: f32,
    initialized: bool,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame, returning the smoothed level
    pub fn push(&mut self, samples: &[f32]) -> f32 {
        let current = frame_level(samples);
        if !self.initialized {
            self.prev = current;
            self.initialized = true;
            return current;
        }
        self.prev = EMA_ALPHA * current + (1.0 - EMA_ALPHA) * self.prev;
        self.prev
    }

    pub fn reset(&mut self) {
        self.prev = 0.0;
        self.initialized = false;
    }
}

/// Stand-in level for synthesizers that expose no signal envelope.
///
/// This is a bounded pseudo-random fluctuation in [20, 80] for the visual
/// layer only. It is not derived from the audio being spoken.
pub fn synthetic_speaking_level<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    rng.gen_range(SYNTHETIC_MIN..SYNTHETIC_MAX)
}
