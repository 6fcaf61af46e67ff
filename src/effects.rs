//! Effect runner for the assistant
//!
//! Executes effects produced by the state machine against the adapter set.
//! Release effects (stop, cancel, close) complete synchronously inside
//! `spawn()`, so a toggle-off leaves nothing running once the loop turn
//! ends. Start effects spawn tasks that forward adapter callbacks back into
//! the loop as `Event`s tagged with the instance's generation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioSource, CaptureStream, LevelMeter, Playback};
use crate::recognition::{RecognitionEvent, RecognitionSession, SpeechRecognizer};
use crate::remote::{RemoteConfig, RemoteConnector, RemoteEvent};
use crate::responder::Responder;
use crate::state_machine::{CaptureRoute, Effect, Event, Generation};
use crate::synthesis::{SpeechHandle, SpeechSynthesizer, SynthesisEvent};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Everything the runner drives
pub struct Adapters {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub audio_source: Arc<dyn AudioSource>,
    pub connector: Arc<dyn RemoteConnector>,
    pub playback: Arc<Playback>,
    pub responder: Responder,
    pub remote: RemoteConfig,
    pub capture_frame_ms: u32,
}

struct CaptureSlot {
    stream: CaptureStream,
    forwarder: CancellationToken,
}

enum RemoteSlot {
    /// Connect in flight; cancel to abandon it
    Pending(CancellationToken),
    Open {
        audio: mpsc::Sender<crate::audio::AudioChunk>,
        close: CancellationToken,
    },
}

#[derive(Default)]
struct Resources {
    recognizers: HashMap<Generation, Box<dyn RecognitionSession>>,
    restarts: HashMap<Generation, CancellationToken>,
    captures: HashMap<Generation, CaptureSlot>,
    utterances: HashMap<Generation, Box<dyn SpeechHandle>>,
    remotes: HashMap<Generation, RemoteSlot>,
}

/// Count of live adapter handles per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeldResources {
    pub recognizers: usize,
    pub restarts: usize,
    pub captures: usize,
    pub utterances: usize,
    pub remotes: usize,
}

impl HeldResources {
    pub fn total(&self) -> usize {
        self.recognizers + self.restarts + self.captures + self.utterances + self.remotes
    }
}

/// Real effect runner backed by the adapter traits
pub struct AdapterEffectRunner {
    recognizer: Arc<dyn SpeechRecognizer>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    audio_source: Arc<dyn AudioSource>,
    connector: Arc<dyn RemoteConnector>,
    playback: Arc<Playback>,
    responder: Arc<Mutex<Responder>>,
    remote: Arc<RemoteConfig>,
    capture_frame_ms: u32,
    resources: Arc<Mutex<Resources>>,
}

fn lock(resources: &Mutex<Resources>) -> MutexGuard<'_, Resources> {
    resources
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AdapterEffectRunner {
    pub fn new(adapters: Adapters) -> Arc<Self> {
        Arc::new(Self {
            recognizer: adapters.recognizer,
            synthesizer: adapters.synthesizer,
            audio_source: adapters.audio_source,
            connector: adapters.connector,
            playback: adapters.playback,
            responder: Arc::new(Mutex::new(adapters.responder)),
            remote: Arc::new(adapters.remote),
            capture_frame_ms: adapters.capture_frame_ms,
            resources: Arc::new(Mutex::new(Resources::default())),
        })
    }

    pub fn held_resources(&self) -> HeldResources {
        let r = lock(&self.resources);
        HeldResources {
            recognizers: r.recognizers.len(),
            restarts: r.restarts.len(),
            captures: r.captures.len(),
            utterances: r.utterances.len(),
            remotes: r.remotes.len(),
        }
    }

    fn start_recognizer(
        &self,
        id: Generation,
        mode: crate::recognition::RecognitionMode,
        tx: mpsc::Sender<Event>,
    ) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        match self.recognizer.start(mode, events_tx) {
            Ok(session) => {
                log::debug!("Recognizer {} started ({:?})", id, mode);
                lock(&self.resources).recognizers.insert(id, session);
                tokio::spawn(async move {
                    while let Some(event) = events_rx.recv().await {
                        let event = match event {
                            RecognitionEvent::Result { text, is_final } => {
                                Event::RecognitionResult { id, text, is_final }
                            }
                            RecognitionEvent::Ended => Event::RecognizerEnded { id },
                            RecognitionEvent::Error(error) => Event::RecognizerFailed { id, error },
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(error) => {
                log::warn!("Recognizer {} failed to start: {}", id, error);
                tokio::spawn(async move {
                    let _ = tx.send(Event::RecognizerFailed { id, error }).await;
                });
            }
        }
    }

    fn open_capture(&self, id: Generation, route: CaptureRoute, tx: mpsc::Sender<Event>) {
        let source = self.audio_source.clone();
        let resources = self.resources.clone();
        let playback = self.playback.clone();
        let frame_ms = self.capture_frame_ms;

        tokio::spawn(async move {
            // Device open blocks on the capture thread's startup
            let opened = tokio::task::spawn_blocking(move || source.open(frame_ms)).await;
            let mut stream = match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    log::warn!("Capture {} failed to open: {}", id, error);
                    let _ = tx.send(Event::CaptureFailed { id, error }).await;
                    return;
                }
                Err(e) => {
                    log::error!("Capture {} open task failed: {}", id, e);
                    let error = crate::error::CaptureError::StreamFailed(e.to_string());
                    let _ = tx.send(Event::CaptureFailed { id, error }).await;
                    return;
                }
            };

            let Some(mut frames) = stream.take_frames() else {
                let error =
                    crate::error::CaptureError::StreamFailed("capture frames already taken".into());
                let _ = tx.send(Event::CaptureFailed { id, error }).await;
                return;
            };

            let forwarder = CancellationToken::new();
            let uplink = {
                let mut r = lock(&resources);
                let uplink = match route {
                    CaptureRoute::Meter => None,
                    CaptureRoute::Remote { session } => match r.remotes.get(&session) {
                        Some(RemoteSlot::Open { audio, .. }) => Some(audio.clone()),
                        _ => None,
                    },
                };
                r.captures.insert(
                    id,
                    CaptureSlot {
                        stream,
                        forwarder: forwarder.clone(),
                    },
                );
                uplink
            };
            log::info!("Capture {} open ({:?})", id, route);

            if tx.send(Event::CaptureOpened { id }).await.is_err() {
                return;
            }

            let mut meter = LevelMeter::new();
            let mut dropped: u64 = 0;
            loop {
                tokio::select! {
                    _ = forwarder.cancelled() => break,
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };
                        let mut level = meter.push(&frame.samples);
                        if let Some(audio) = &uplink {
                            level = level.max(playback.level());
                            if audio.try_send(frame).is_err() {
                                dropped += 1;
                                if dropped % 50 == 1 {
                                    log::warn!("Remote uplink full, dropped {} frames", dropped);
                                }
                            }
                        }
                        if tx.send(Event::Level { id, level }).await.is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Capture {} forwarder exiting", id);
        });
    }

    fn speak(&self, id: Generation, text: &str, tx: mpsc::Sender<Event>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        match self.synthesizer.speak(text, events_tx) {
            Ok(handle) => {
                lock(&self.resources).utterances.insert(id, handle);
                tokio::spawn(async move {
                    while let Some(event) = events_rx.recv().await {
                        let event = match event {
                            SynthesisEvent::Started => Event::SynthesisStarted { id },
                            SynthesisEvent::Level(level) => Event::Level { id, level },
                            SynthesisEvent::Ended => Event::SynthesisEnded { id },
                            SynthesisEvent::Error(error) => Event::SynthesisFailed { id, error },
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(error) => {
                tokio::spawn(async move {
                    let _ = tx.send(Event::SynthesisFailed { id, error }).await;
                });
            }
        }
    }

    fn open_remote(&self, id: Generation, tx: mpsc::Sender<Event>) {
        let pending = CancellationToken::new();
        lock(&self.resources)
            .remotes
            .insert(id, RemoteSlot::Pending(pending.clone()));

        let connector = self.connector.clone();
        let config = self.remote.clone();
        let resources = self.resources.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = pending.cancelled() => {
                    log::info!("Remote session {} abandoned while connecting", id);
                    return;
                }
                result = connector.connect(&config) => result,
            };

            let mut link = match result {
                Ok(link) => link,
                Err(error) => {
                    log::error!("Remote session {} failed: {}", id, error);
                    lock(&resources).remotes.remove(&id);
                    let _ = tx.send(Event::RemoteFailed { id, error }).await;
                    return;
                }
            };

            {
                let mut r = lock(&resources);
                if !matches!(r.remotes.get(&id), Some(RemoteSlot::Pending(_))) {
                    // Closed while the handshake was finishing
                    link.close.cancel();
                    return;
                }
                r.remotes.insert(
                    id,
                    RemoteSlot::Open {
                        audio: link.audio.clone(),
                        close: link.close.clone(),
                    },
                );
            }

            if tx.send(Event::RemoteOpened { id }).await.is_err() {
                link.close.cancel();
                return;
            }

            loop {
                let event = tokio::select! {
                    _ = link.close.cancelled() => break,
                    event = link.events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let event = match event {
                    RemoteEvent::Audio(chunk) => Event::RemoteAudio { id, chunk },
                    RemoteEvent::InputTranscript(text) => Event::RemoteInputTranscript { id, text },
                    RemoteEvent::OutputTranscript(text) => {
                        Event::RemoteOutputTranscript { id, text }
                    }
                    RemoteEvent::InputComplete => Event::RemoteInputComplete { id },
                    RemoteEvent::Interrupted => Event::RemoteInterrupted { id },
                    RemoteEvent::TurnComplete => Event::RemoteTurnComplete { id },
                    RemoteEvent::Error(error) => Event::RemoteError { id, error },
                    RemoteEvent::Closed => Event::RemoteClosed { id },
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            log::debug!("Remote session {} event stream ended", id);
        });
    }
}

impl EffectRunner for AdapterEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartRecognizer { id, mode } => self.start_recognizer(id, mode, tx),

            Effect::StopRecognizer { id } => {
                let session = lock(&self.resources).recognizers.remove(&id);
                if let Some(mut session) = session {
                    log::debug!("Stopping recognizer {}", id);
                    session.stop();
                }
            }

            Effect::ScheduleRestart { token, delay } => {
                let cancel = CancellationToken::new();
                lock(&self.resources).restarts.insert(token, cancel.clone());
                let resources = self.resources.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            lock(&resources).restarts.remove(&token);
                            let _ = tx.send(Event::RestartDue { token }).await;
                        }
                    }
                });
            }

            Effect::CancelRestart { token } => {
                if let Some(cancel) = lock(&self.resources).restarts.remove(&token) {
                    cancel.cancel();
                }
            }

            Effect::OpenCapture { id, route } => self.open_capture(id, route, tx),

            Effect::CloseCapture { id } => {
                let capture = lock(&self.resources).captures.remove(&id);
                if let Some(mut capture) = capture {
                    capture.forwarder.cancel();
                    capture.stream.close();
                    log::info!("Capture {} closed", id);
                }
            }

            Effect::Respond { id, command } => {
                let response = self
                    .responder
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .respond(&command);
                log::info!("Response to {:?}: {:?}", command, response.text);
                tokio::spawn(async move {
                    let _ = tx.send(Event::ResponseReady { id, response }).await;
                });
            }

            Effect::Speak { id, text } => self.speak(id, &text, tx),

            Effect::CancelSpeech { id } => {
                let handle = lock(&self.resources).utterances.remove(&id);
                if let Some(mut handle) = handle {
                    handle.cancel();
                }
            }

            Effect::OpenRemote { id } => self.open_remote(id, tx),

            Effect::CloseRemote { id } => {
                let slot = lock(&self.resources).remotes.remove(&id);
                match slot {
                    Some(RemoteSlot::Pending(cancel)) => cancel.cancel(),
                    Some(RemoteSlot::Open { close, .. }) => {
                        log::info!("Closing remote session {}", id);
                        close.cancel();
                    }
                    None => {}
                }
            }

            Effect::PlayChunk { chunk, .. } => {
                self.playback.enqueue(chunk);
            }

            Effect::StopPlayback { session } => {
                log::debug!("Stopping playback for session {}", session);
                self.playback.stop();
            }

            Effect::Transcript(_)
            | Effect::PublishVolume(_)
            | Effect::PlayCue(_)
            | Effect::OpenIntent(_)
            | Effect::EmitUi => {
                log::debug!("Effect handled by state loop: {:?}", effect);
            }
        }
    }
}
