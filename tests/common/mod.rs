//! Scripted adapters for driving the real state loop
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use jarvis::audio::{AudioChunk, AudioSource, CaptureStream, Playback, PlaybackSink};
use jarvis::effects::{AdapterEffectRunner, Adapters};
use jarvis::error::{CaptureError, RecognitionError, RemoteError};
use jarvis::recognition::{RecognitionEvent, RecognitionMode, RecognitionSession, SpeechRecognizer};
use jarvis::remote::{RemoteConfig, RemoteConnector, RemoteEvent, RemoteLink};
use jarvis::responder::Responder;
use jarvis::state_machine::{MachineConfig, Variant};
use jarvis::synthesis::{SpeechHandle, SpeechSynthesizer, SynthesisEvent};
use jarvis::AssistantHandle;

// ----------------------------------------------------------------------------
// Recognizer
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRecognizer {
    starts: AtomicUsize,
    stops: Arc<AtomicUsize>,
    sessions: Mutex<Vec<(RecognitionMode, mpsc::UnboundedSender<RecognitionEvent>)>>,
}

struct FakeRecognition {
    stops: Arc<AtomicUsize>,
}

impl RecognitionSession for FakeRecognition {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl SpeechRecognizer for FakeRecognizer {
    fn start(
        &self,
        mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionSession>, RecognitionError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().push((mode, events));
        Ok(Box::new(FakeRecognition {
            stops: self.stops.clone(),
        }))
    }
}

impl FakeRecognizer {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_mode(&self) -> Option<RecognitionMode> {
        self.sessions.lock().unwrap().last().map(|(mode, _)| *mode)
    }

    /// Deliver an event from the most recently started session
    pub fn emit(&self, event: RecognitionEvent) {
        let sessions = self.sessions.lock().unwrap();
        let (_, tx) = sessions.last().expect("no recognizer started");
        let _ = tx.send(event);
    }

    pub fn hear(&self, text: &str) {
        self.emit(RecognitionEvent::Result {
            text: text.to_string(),
            is_final: true,
        });
    }
}

// ----------------------------------------------------------------------------
// Synthesizer
// ----------------------------------------------------------------------------

pub struct FakeSynthesizer {
    auto_finish: bool,
    spoken: Mutex<Vec<String>>,
    cancels: Arc<AtomicUsize>,
    senders: Mutex<Vec<mpsc::UnboundedSender<SynthesisEvent>>>,
}

struct FakeUtterance {
    cancels: Arc<AtomicUsize>,
}

impl SpeechHandle for FakeUtterance {
    fn cancel(&mut self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

impl FakeSynthesizer {
    /// `auto_finish` ends every utterance right after it starts
    pub fn new(auto_finish: bool) -> Self {
        Self {
            auto_finish,
            spoken: Mutex::new(Vec::new()),
            cancels: Arc::new(AtomicUsize::new(0)),
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: SynthesisEvent) {
        let senders = self.senders.lock().unwrap();
        let _ = senders.last().expect("nothing spoken").send(event);
    }
}

impl SpeechSynthesizer for FakeSynthesizer {
    fn speak(
        &self,
        text: &str,
        events: mpsc::UnboundedSender<SynthesisEvent>,
    ) -> Result<Box<dyn SpeechHandle>, jarvis::error::SynthesisError> {
        self.spoken.lock().unwrap().push(text.to_string());
        let _ = events.send(SynthesisEvent::Started);
        if self.auto_finish {
            let _ = events.send(SynthesisEvent::Ended);
        }
        self.senders.lock().unwrap().push(events);
        Ok(Box::new(FakeUtterance {
            cancels: self.cancels.clone(),
        }))
    }
}

// ----------------------------------------------------------------------------
// Capture
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeSource {
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    fail_with: Mutex<Option<CaptureError>>,
    frames: Mutex<Vec<mpsc::UnboundedSender<AudioChunk>>>,
}

impl FakeSource {
    pub fn failing(error: CaptureError) -> Self {
        Self {
            fail_with: Mutex::new(Some(error)),
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn push(&self, frame: AudioChunk) {
        if let Some(tx) = self.frames.lock().unwrap().last() {
            let _ = tx.send(frame);
        }
    }
}

impl AudioSource for FakeSource {
    fn open(&self, _frame_ms: u32) -> Result<CaptureStream, CaptureError> {
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.frames.lock().unwrap().push(tx);
        let closes = self.closes.clone();
        Ok(CaptureStream::new(16_000, rx, move || {
            closes.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

// ----------------------------------------------------------------------------
// Remote session
// ----------------------------------------------------------------------------

pub struct FakeLink {
    pub events: mpsc::UnboundedSender<RemoteEvent>,
    pub audio: mpsc::Receiver<AudioChunk>,
    pub close: CancellationToken,
}

#[derive(Default)]
pub struct FakeConnector {
    /// When set, `connect` waits for one permit
    gate: Option<Arc<Notify>>,
    attempts: AtomicUsize,
    links: Mutex<Vec<FakeLink>>,
}

impl FakeConnector {
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn all_closed(&self) -> bool {
        self.links
            .lock()
            .unwrap()
            .iter()
            .all(|l| l.close.is_cancelled())
    }

    pub fn send(&self, event: RemoteEvent) {
        let links = self.links.lock().unwrap();
        let _ = links.last().expect("no session").events.send(event);
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, _config: &RemoteConfig) -> Result<RemoteLink, RemoteError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let (audio_tx, audio_rx) = mpsc::channel(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        self.links.lock().unwrap().push(FakeLink {
            events: events_tx,
            audio: audio_rx,
            close: close.clone(),
        });
        Ok(RemoteLink {
            audio: audio_tx,
            events: events_rx,
            close,
        })
    }
}

// ----------------------------------------------------------------------------
// Playback
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct ManualSink {
    now: Mutex<f64>,
    starts: Mutex<Vec<f64>>,
    stops: AtomicUsize,
}

impl ManualSink {
    pub fn set_now(&self, now: f64) {
        *self.now.lock().unwrap() = now;
    }

    pub fn starts(&self) -> Vec<f64> {
        self.starts.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl PlaybackSink for ManualSink {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn play_at(&self, start: f64, _chunk: AudioChunk) {
        self.starts.lock().unwrap().push(start);
    }

    fn stop_all(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn level(&self) -> f32 {
        0.0
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub handle: AssistantHandle,
    pub runner: Arc<AdapterEffectRunner>,
    pub recognizer: Arc<FakeRecognizer>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub source: Arc<FakeSource>,
    pub connector: Arc<FakeConnector>,
    pub sink: Arc<ManualSink>,
    pub playback: Arc<Playback>,
}

pub struct Setup {
    pub variant: Variant,
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub synthesizer: FakeSynthesizer,
    pub source: FakeSource,
    pub connector: FakeConnector,
}

impl Setup {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            recognizer: None,
            synthesizer: FakeSynthesizer::new(true),
            source: FakeSource::default(),
            connector: FakeConnector::default(),
        }
    }

    pub fn start(self) -> Harness {
        let recognizer = Arc::new(FakeRecognizer::default());
        let synthesizer = Arc::new(self.synthesizer);
        let source = Arc::new(self.source);
        let connector = Arc::new(self.connector);
        let sink = Arc::new(ManualSink::default());
        let playback = Arc::new(Playback::new(sink.clone()));

        let runner = AdapterEffectRunner::new(Adapters {
            recognizer: self
                .recognizer
                .unwrap_or_else(|| recognizer.clone() as Arc<dyn SpeechRecognizer>),
            synthesizer: synthesizer.clone(),
            audio_source: source.clone(),
            connector: connector.clone(),
            playback: playback.clone(),
            responder: Responder::new(Some(1)),
            remote: RemoteConfig::default(),
            capture_frame_ms: 100,
        });

        let config = MachineConfig::new(self.variant, "jarvis", Duration::from_millis(20));
        let handle = AssistantHandle::spawn(config, runner.clone());

        Harness {
            handle,
            runner,
            recognizer,
            synthesizer,
            source,
            connector,
            sink,
            playback,
        }
    }
}

/// Poll `cond` until it holds, failing the test after two seconds
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
