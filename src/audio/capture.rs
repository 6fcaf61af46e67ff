//! Microphone capture using CPAL
//!
//! `AudioSource::open()` yields a `CaptureStream`: fixed-size mono f32 frames
//! delivered over a channel until `close()` (or drop). The cpal stream itself
//! is parked on a dedicated thread, so the handle stays `Send`.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;

use super::codec::{to_mono, AudioChunk};
use crate::error::CaptureError;

/// Anything that can hand out microphone streams
pub trait AudioSource: Send + Sync {
    fn open(&self, frame_ms: u32) -> Result<CaptureStream, CaptureError>;
}

/// An open microphone stream
pub struct CaptureStream {
    sample_rate: u32,
    frames: Option<mpsc::UnboundedReceiver<AudioChunk>>,
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureStream {
    pub fn new(
        sample_rate: u32,
        frames: mpsc::UnboundedReceiver<AudioChunk>,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            sample_rate,
            frames: Some(frames),
            stop: Some(Box::new(stop)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Take the frame receiver. Only the first call returns `Some`.
    pub fn take_frames(&mut self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        self.frames.take()
    }

    /// Release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
            log::debug!("Capture stream closed");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Default input device through cpal
#[derive(Debug, Default, Clone)]
pub struct CpalAudioSource;

impl CpalAudioSource {
    pub fn new() -> Self {
        Self
    }
}

impl AudioSource for CpalAudioSource {
    fn open(&self, frame_ms: u32) -> Result<CaptureStream, CaptureError> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(frame_ms, frames_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Either an explicit stop or the sender being dropped ends capture
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| CaptureError::StreamFailed("capture thread exited".into()))??;

        log::info!("Capture started at {} Hz, {} ms frames", sample_rate, frame_ms);

        Ok(CaptureStream::new(sample_rate, frames_rx, move || {
            let _ = stop_tx.send(());
        }))
    }
}

/// Map a backend error message to the capture taxonomy.
///
/// cpal has no dedicated permission variant; platform backends surface the
/// refusal in the message text.
pub fn classify_open_error(message: &str) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed")
    {
        CaptureError::PermissionDenied(message.to_string())
    } else {
        CaptureError::DeviceUnavailable(message.to_string())
    }
}

fn build_input_stream(
    frame_ms: u32,
    frames_tx: mpsc::UnboundedSender<AudioChunk>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("no audio input device found".into()))?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device
        .default_input_config()
        .map_err(|e| classify_open_error(&e.to_string()))?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;
    let framer = Framer::new(rate, frame_ms, config.channels as usize, frames_tx);

    let stream = match sample_format {
        SampleFormat::I16 => build_typed::<i16>(&device, &config, framer),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, framer),
        SampleFormat::F32 => build_typed::<f32>(&device, &config, framer),
        other => Err(CaptureError::DeviceUnavailable(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;

    stream
        .play()
        .map_err(|e| classify_open_error(&format!("failed to start stream: {}", e)))?;

    Ok((stream, rate))
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut framer: Framer,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from_sample_(s)).collect();
                framer.push(&floats);
            },
            |err| log::error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| classify_open_error(&e.to_string()))
}

/// Re-frames interleaved device buffers into fixed-size mono frames
struct Framer {
    sample_rate: u32,
    channels: usize,
    frame_len: usize,
    pending: Vec<f32>,
    tx: mpsc::UnboundedSender<AudioChunk>,
}

impl Framer {
    fn new(
        sample_rate: u32,
        frame_ms: u32,
        channels: usize,
        tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> Self {
        let frame_len = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
        Self {
            sample_rate,
            channels,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            tx,
        }
    }

    fn push(&mut self, interleaved: &[f32]) {
        self.pending.extend(to_mono(interleaved, self.channels));
        while self.pending.len() >= self.frame_len {
            let frame: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            if self.tx.send(AudioChunk::new(frame, self.sample_rate)).is_err() {
                // Receiver gone; nothing left to feed
                self.pending.clear();
                return;
            }
        }
    }
}
