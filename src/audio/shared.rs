//! One microphone stream shared by every consumer
//!
//! The wake-word recognizer and the volume meter both capture while the
//! assistant is listening. `SharedAudioSource` opens the device for the first
//! consumer and hands later ones a copy of the same frames; the device is
//! released when the last handle closes.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tokio::sync::mpsc;

use super::capture::{AudioSource, CaptureStream};
use super::codec::AudioChunk;
use crate::error::CaptureError;

type Subscribers = Arc<Mutex<Vec<(u64, mpsc::UnboundedSender<AudioChunk>)>>>;

struct Device {
    stream: CaptureStream,
    subscribers: Subscribers,
}

#[derive(Default)]
struct State {
    device: Option<Device>,
    next_id: u64,
}

pub struct SharedAudioSource {
    inner: Arc<dyn AudioSource>,
    state: Arc<Mutex<State>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedAudioSource {
    pub fn new(inner: Arc<dyn AudioSource>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Number of consumers currently attached
    pub fn consumers(&self) -> usize {
        guard(&self.state)
            .device
            .as_ref()
            .map_or(0, |d| guard(&d.subscribers).len())
    }
}

impl AudioSource for SharedAudioSource {
    fn open(&self, frame_ms: u32) -> Result<CaptureStream, CaptureError> {
        let mut state = guard(&self.state);

        if state.device.is_none() {
            let mut stream = self.inner.open(frame_ms)?;
            let mut device_frames = stream
                .take_frames()
                .ok_or_else(|| CaptureError::StreamFailed("capture frames already taken".into()))?;
            let subscribers: Subscribers = Arc::default();

            let fanout = subscribers.clone();
            thread::Builder::new()
                .name("capture-fanout".into())
                .spawn(move || {
                    while let Some(frame) = device_frames.blocking_recv() {
                        guard(&fanout).retain(|(_, tx)| tx.send(frame.clone()).is_ok());
                    }
                    log::debug!("Shared capture fan-out exiting");
                })
                .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;

            state.device = Some(Device {
                stream,
                subscribers,
            });
        } else {
            log::debug!("Reusing open capture stream ({} ms frames requested)", frame_ms);
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let (sample_rate, subscribers) = match state.device.as_ref() {
            Some(device) => (device.stream.sample_rate(), device.subscribers.clone()),
            None => return Err(CaptureError::StreamFailed("capture device vanished".into())),
        };
        guard(&subscribers).push((id, tx));

        let shared = self.state.clone();
        Ok(CaptureStream::new(sample_rate, rx, move || {
            let mut state = guard(&shared);
            let last = {
                let mut list = guard(&subscribers);
                list.retain(|(other, _)| *other != id);
                list.is_empty()
            };
            let same_device = state
                .device
                .as_ref()
                .is_some_and(|d| Arc::ptr_eq(&d.subscribers, &subscribers));
            if last && same_device {
                if let Some(mut device) = state.device.take() {
                    device.stream.close();
                    log::debug!("Last capture consumer left, device released");
                }
            }
        }))
    }
}
