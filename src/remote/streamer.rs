//! Microphone frames → 24 kHz PCM16 chunks for the realtime session
//!
//! ```text
//! Capture (device rate, f32)  ──▶ resample (24kHz) ──▶ PCM16 ──▶ 100ms chunks
//! ```

use crate::audio::codec::{f32_to_i16, resample};
use crate::audio::AudioChunk;

/// Chunk duration sent per `input_audio_buffer.append`
pub const CHUNK_DURATION_MS: u32 = 100;

#[derive(Debug)]
pub struct AudioStreamer {
    target_sample_rate: u32,
    samples_per_chunk: usize,
    buffer: Vec<i16>,
    chunks_out: u64,
}

impl AudioStreamer {
    pub fn new(target_sample_rate: u32, chunk_duration_ms: u32) -> Self {
        let samples_per_chunk =
            ((target_sample_rate as u64 * chunk_duration_ms as u64) / 1000).max(1) as usize;
        log::info!(
            "AudioStreamer: {}Hz, {}ms chunks = {} samples",
            target_sample_rate,
            chunk_duration_ms,
            samples_per_chunk
        );
        Self {
            target_sample_rate,
            samples_per_chunk,
            buffer: Vec::with_capacity(samples_per_chunk * 2),
            chunks_out: 0,
        }
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.samples_per_chunk
    }

    /// Feed one capture frame, returning every complete chunk
    pub fn push(&mut self, frame: &AudioChunk) -> Vec<Vec<i16>> {
        let converted = resample(&frame.samples, frame.sample_rate, self.target_sample_rate);
        self.buffer.extend(converted.into_iter().map(f32_to_i16));

        let mut chunks = Vec::new();
        while self.buffer.len() >= self.samples_per_chunk {
            chunks.push(self.buffer.drain(..self.samples_per_chunk).collect());
            self.chunks_out += 1;
            // ~5 seconds at 100ms
            if self.chunks_out % 50 == 0 {
                log::debug!("AudioStreamer: {} chunks out", self.chunks_out);
            }
        }
        chunks
    }
}
