//! Audio pipeline for the assistant
//!
//! Microphone capture and speaker playback go through CPAL. Frames are mono
//! f32 internally; the codec converts to and from the PCM16 wire format.

pub mod capture;
pub mod codec;
pub mod level;
pub mod playback;
pub mod scheduler;
pub mod shared;

pub use capture::{AudioSource, CaptureStream, CpalAudioSource};
pub use codec::AudioChunk;
pub use level::LevelMeter;
pub use playback::{CpalSink, NullSink, Playback, PlaybackSink};
pub use scheduler::{PlaybackScheduler, ScheduledChunk};
pub use shared::SharedAudioSource;
