//! Audio output: a sink with a sample-accurate clock plus gapless scheduling
//!
//! The cpal stream lives on its own thread because `cpal::Stream` is not
//! `Send` on every backend. The callback mixes every queued voice that covers
//! the current frame, so scheduling is purely a matter of picking start frames.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};

use super::codec::{resample, AudioChunk};
use super::level::{level_from_rms, rms};
use super::scheduler::{PlaybackScheduler, ScheduledChunk};
use crate::error::SynthesisError;

/// Destination for decoded audio with its own output clock
pub trait PlaybackSink: Send + Sync {
    /// Output clock in seconds
    fn now(&self) -> f64;

    /// Queue a chunk to begin at `start` on the output clock
    fn play_at(&self, start: f64, chunk: AudioChunk);

    /// Silence everything queued or playing
    fn stop_all(&self);

    /// Current output level in [0, 100]
    fn level(&self) -> f32;
}

/// A sink paired with the gapless scheduler
pub struct Playback {
    sink: Arc<dyn PlaybackSink>,
    scheduler: Mutex<PlaybackScheduler>,
}

impl Playback {
    pub fn new(sink: Arc<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            scheduler: Mutex::new(PlaybackScheduler::new()),
        }
    }

    /// Schedule a chunk right after whatever is already queued
    pub fn enqueue(&self, chunk: AudioChunk) -> ScheduledChunk {
        let now = self.sink.now();
        let placed = match self.scheduler.lock() {
            Ok(mut scheduler) => scheduler.schedule(now, chunk.duration_secs()),
            Err(poisoned) => poisoned
                .into_inner()
                .schedule(now, chunk.duration_secs()),
        };
        log::debug!(
            "Scheduled {:.3}s chunk at {:.3} (now {:.3})",
            placed.end - placed.start,
            placed.start,
            now
        );
        self.sink.play_at(placed.start, chunk);
        placed
    }

    /// Stop every pending chunk and reset the clock to now
    pub fn stop(&self) {
        self.sink.stop_all();
        let now = self.sink.now();
        match self.scheduler.lock() {
            Ok(mut scheduler) => scheduler.reset(now),
            Err(poisoned) => poisoned.into_inner().reset(now),
        }
    }

    /// True while scheduled audio has not finished
    pub fn is_playing(&self) -> bool {
        let now = self.sink.now();
        match self.scheduler.lock() {
            Ok(scheduler) => !scheduler.is_idle(now),
            Err(poisoned) => !poisoned.into_inner().is_idle(now),
        }
    }

    pub fn level(&self) -> f32 {
        self.sink.level()
    }
}

/// Sink for hosts without an output device: keeps time, drops audio
pub struct NullSink {
    epoch: Instant,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for NullSink {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn play_at(&self, start: f64, chunk: AudioChunk) {
        log::trace!(
            "Discarding {} samples scheduled at {:.3}",
            chunk.samples.len(),
            start
        );
    }

    fn stop_all(&self) {}

    fn level(&self) -> f32 {
        0.0
    }
}

struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct Timeline {
    frames_played: u64,
    voices: Vec<Voice>,
    level: f32,
    /// End frame of the most recently queued voice
    cursor: u64,
}

impl Timeline {
    /// Queue `samples` at `requested`. A start within `slack` frames of the
    /// previous voice's end is back-to-back audio and is snapped to it.
    fn place(&mut self, requested: u64, samples: Vec<f32>, slack: u64) -> u64 {
        let contiguous =
            self.cursor >= self.frames_played && requested.abs_diff(self.cursor) <= slack;
        let start_frame = if contiguous { self.cursor } else { requested };
        self.cursor = start_frame + samples.len() as u64;
        self.voices.push(Voice {
            start_frame,
            samples,
        });
        start_frame
    }

    fn clear(&mut self) {
        self.voices.clear();
        self.level = 0.0;
        self.cursor = self.frames_played;
    }

    fn mix(&self, frame: u64) -> f32 {
        let sum: f32 = self
            .voices
            .iter()
            .filter(|v| v.start_frame <= frame && frame < v.end_frame())
            .map(|v| v.samples[(frame - v.start_frame) as usize])
            .sum();
        sum.clamp(-1.0, 1.0)
    }
}

/// Default output device driven by a shared timeline
pub struct CpalSink {
    shared: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    // Dropping the sender ends the stream thread
    _stop: std_mpsc::Sender<()>,
}

impl CpalSink {
    pub fn open() -> Result<Self, SynthesisError> {
        let shared = Arc::new(Mutex::new(Timeline::default()));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let stream = match build_output_stream(thread_shared) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until CpalSink is dropped
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Playback stream closed");
            })
            .map_err(|e| SynthesisError::Playback(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| SynthesisError::Playback("playback thread exited".into()))??;

        Ok(Self {
            shared,
            sample_rate,
            _stop: stop_tx,
        })
    }
}

impl PlaybackSink for CpalSink {
    fn now(&self) -> f64 {
        match self.shared.lock() {
            Ok(timeline) => timeline.frames_played as f64 / self.sample_rate as f64,
            Err(_) => 0.0,
        }
    }

    fn play_at(&self, start: f64, chunk: AudioChunk) {
        let samples = resample(&chunk.samples, chunk.sample_rate, self.sample_rate);
        let requested = (start * self.sample_rate as f64).round().max(0.0) as u64;
        if let Ok(mut timeline) = self.shared.lock() {
            // One millisecond absorbs per-chunk rounding of start and length
            let slack = (self.sample_rate as u64 / 1000).max(1);
            let start_frame = timeline.place(requested, samples, slack);
            log::trace!("Voice queued at frame {} (asked {})", start_frame, requested);
        }
    }

    fn stop_all(&self) {
        if let Ok(mut timeline) = self.shared.lock() {
            timeline.clear();
        }
    }

    fn level(&self) -> f32 {
        self.shared.lock().map(|t| t.level).unwrap_or(0.0)
    }
}

fn build_output_stream(
    shared: Arc<Mutex<Timeline>>,
) -> Result<(cpal::Stream, u32), SynthesisError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SynthesisError::Playback("no output device available".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| SynthesisError::Playback(e.to_string()))?;

    log::info!(
        "Playback device: {:?} ({} Hz, {} channels, {:?})",
        device.name(),
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::F32 => build_typed::<f32>(&device, &config, shared),
        SampleFormat::I16 => build_typed::<i16>(&device, &config, shared),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, shared),
        other => Err(SynthesisError::Playback(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| SynthesisError::Playback(format!("failed to start stream: {}", e)))?;

    Ok((stream, rate))
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: Arc<Mutex<Timeline>>,
) -> Result<cpal::Stream, SynthesisError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let Ok(mut timeline) = shared.lock() else {
                    data.fill(T::EQUILIBRIUM);
                    return;
                };

                let base = timeline.frames_played;
                let mut mixed = Vec::with_capacity(data.len() / channels.max(1));
                for (i, frame) in data.chunks_mut(channels.max(1)).enumerate() {
                    let sample = timeline.mix(base + i as u64);
                    mixed.push(sample);
                    for out in frame.iter_mut() {
                        *out = T::from_sample(sample);
                    }
                }

                let played = base + mixed.len() as u64;
                timeline.frames_played = played;
                timeline.voices.retain(|v| v.end_frame() > played);
                timeline.level = level_from_rms(rms(&mixed));
            },
            |err| log::error!("Audio playback error: {}", err),
            None,
        )
        .map_err(|e| SynthesisError::Playback(e.to_string()))
}
