pub mod audio;
pub mod effects;
pub mod error;
pub mod openai;
pub mod recognition;
pub mod remote;
pub mod responder;
pub mod settings;
pub mod state_machine;
pub mod synthesis;
pub mod transcript;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

pub use error::{Error, Result};

use effects::EffectRunner;
use responder::Intent;
use state_machine::{reduce, ConnectionState, Cue, Effect, Event, MachineConfig, Session};
use transcript::{TranscriptItem, TranscriptStore};

/// Capacity of the state loop's event queue
const EVENT_QUEUE: usize = 64;

/// Capacity of the cue/intent broadcast
const NOTICE_QUEUE: usize = 16;

/// UI state published on every phase change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub connection_state: ConnectionState,
    pub error: Option<String>,
}

impl UiState {
    fn from_session(session: &Session) -> Self {
        Self {
            connection_state: session.connection_state(),
            error: session.error_message().map(str::to_string),
        }
    }
}

/// One-shot notifications for outer layers (chimes, URL opening)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Notice {
    Cue(Cue),
    Intent(Intent),
}

/// Publishing side of the UI boundary, owned by the state loop
struct Outputs {
    ui: watch::Sender<UiState>,
    volume: watch::Sender<f32>,
    transcripts: watch::Sender<Vec<TranscriptItem>>,
    notices: broadcast::Sender<Notice>,
}

/// Run the main state loop
async fn run_state_loop(
    config: MachineConfig,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    outputs: Outputs,
) {
    let mut session = Session::new();
    let mut store = TranscriptStore::new();

    log::info!("State loop started ({:?})", config.variant);

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        let exit = matches!(event, Event::Exit);
        let (next, effects) = reduce(&config, &session, event);

        if next.connection_state() != session.connection_state() {
            log::info!(
                "State transition: {:?} -> {:?}",
                session.connection_state(),
                next.connection_state()
            );
        }

        session = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => {
                    outputs.ui.send_replace(UiState::from_session(&session));
                }
                Effect::PublishVolume(level) => {
                    outputs.volume.send_replace(level);
                }
                Effect::Transcript(op) => {
                    store.apply(op);
                    outputs.transcripts.send_replace(store.items().to_vec());
                }
                Effect::PlayCue(cue) => {
                    // No subscribers is fine
                    let _ = outputs.notices.send(Notice::Cue(cue));
                }
                Effect::OpenIntent(intent) => {
                    log::info!("Intent: {:?}", intent);
                    let _ = outputs.notices.send(Notice::Intent(intent));
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        if exit {
            log::info!("Exit requested, shutting down state loop");
            break;
        }
    }

    log::info!("State loop ended");
}

/// The UI boundary: commands in, state/volume/transcripts out
pub struct AssistantHandle {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    volume: watch::Receiver<f32>,
    transcripts: watch::Receiver<Vec<TranscriptItem>>,
    notices: broadcast::Sender<Notice>,
    task: JoinHandle<()>,
}

impl AssistantHandle {
    /// Spawn the state loop on the current tokio runtime
    pub fn spawn(config: MachineConfig, effect_runner: Arc<dyn EffectRunner>) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_QUEUE);
        let (ui_tx, ui) = watch::channel(UiState::from_session(&Session::new()));
        let (volume_tx, volume) = watch::channel(0.0);
        let (transcripts_tx, transcripts) = watch::channel(Vec::new());
        let (notices, _) = broadcast::channel(NOTICE_QUEUE);

        let outputs = Outputs {
            ui: ui_tx,
            volume: volume_tx,
            transcripts: transcripts_tx,
            notices: notices.clone(),
        };
        let task = tokio::spawn(run_state_loop(
            config,
            rx,
            tx.clone(),
            effect_runner,
            outputs,
        ));

        Self {
            tx,
            ui,
            volume,
            transcripts,
            notices,
            task,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.ui.borrow().connection_state
    }

    pub fn error(&self) -> Option<String> {
        self.ui.borrow().error.clone()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.borrow()
    }

    pub fn transcripts(&self) -> Vec<TranscriptItem> {
        self.transcripts.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    pub fn subscribe_volume(&self) -> watch::Receiver<f32> {
        self.volume.clone()
    }

    pub fn subscribe_transcripts(&self) -> watch::Receiver<Vec<TranscriptItem>> {
        self.transcripts.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Disconnected → listening; anything else → Disconnected
    pub async fn toggle_system(&self) -> Result<()> {
        self.send(Event::Toggle).await
    }

    pub async fn stop_speaking(&self) -> Result<()> {
        self.send(Event::StopSpeaking).await
    }

    pub async fn activate_listening(&self) -> Result<()> {
        self.send(Event::ActivateListening).await
    }

    /// Inject an event into the state loop
    pub async fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::LoopClosed)
    }

    /// Tear everything down and wait for the loop to finish
    pub async fn shutdown(self) -> Result<()> {
        self.send(Event::Exit).await?;
        self.task.await.map_err(|e| {
            log::error!("State loop task failed: {}", e);
            Error::LoopClosed
        })
    }
}
