//! Energy-based utterance segmentation
//!
//! Frames above the energy threshold open an utterance; a run of quiet
//! frames closes it. Blips shorter than the minimum speech length are
//! discarded, and an utterance is force-closed at the maximum length.

use crate::audio::level::rms;
use crate::audio::AudioChunk;

/// Minimum RMS energy to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Quiet time that ends an utterance
const END_SILENCE_MS: f64 = 700.0;

/// Speech shorter than this is treated as noise
const MIN_SPEECH_MS: f64 = 300.0;

/// Hard cap on one utterance
const MAX_UTTERANCE_MS: f64 = 15_000.0;

/// A finished utterance ready for transcription
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Default)]
pub struct Segmenter {
    buffer: Vec<f32>,
    sample_rate: u32,
    in_speech: bool,
    speech_ms: f64,
    silence_ms: f64,
}

impl Segmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_speech(&self) -> bool {
        self.in_speech
    }

    /// Feed one frame; returns an utterance when one just closed
    pub fn push(&mut self, frame: &AudioChunk) -> Option<Utterance> {
        let frame_ms = frame.duration_secs() * 1000.0;
        let loud = rms(&frame.samples) > ENERGY_THRESHOLD;

        if !self.in_speech {
            if !loud {
                return None;
            }
            log::trace!("Speech started");
            self.in_speech = true;
            self.sample_rate = frame.sample_rate;
            self.buffer.clear();
            self.speech_ms = 0.0;
            self.silence_ms = 0.0;
        }

        self.buffer.extend_from_slice(&frame.samples);
        if loud {
            self.speech_ms += frame_ms;
            self.silence_ms = 0.0;
        } else {
            self.silence_ms += frame_ms;
        }

        let total_ms = self.speech_ms + self.silence_ms;
        if self.silence_ms >= END_SILENCE_MS || total_ms >= MAX_UTTERANCE_MS {
            return self.close();
        }
        None
    }

    fn close(&mut self) -> Option<Utterance> {
        self.in_speech = false;
        let samples = std::mem::take(&mut self.buffer);
        if self.speech_ms < MIN_SPEECH_MS {
            log::trace!("Discarding {:.0} ms blip", self.speech_ms);
            return None;
        }
        log::debug!("Utterance closed: {:.0} ms of speech", self.speech_ms);
        Some(Utterance {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}
