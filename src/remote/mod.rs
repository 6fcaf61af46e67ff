//! Remote conversational session
//!
//! The state machine only sees the `RemoteConnector` capability: open a
//! session from a model, voice and instruction string, push microphone
//! frames into it, and read back a tagged stream of `RemoteEvent`s. The
//! OpenAI Realtime implementation lives behind it.
//!
//! ```text
//! capture frames ──▶ RemoteLink.audio ──▶ AudioStreamer (24kHz PCM16) ──▶ WebSocket
//!                                                                           │
//! RemoteLink.events ◀── translate() ◀── ServerMessage ◀─────────────────────┘
//! ```

mod aggregator;
pub mod protocol;
mod realtime_client;
mod streamer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::codec::decode_pcm16;
use crate::audio::AudioChunk;
use crate::error::RemoteError;

pub use aggregator::{StreamingText, TurnAggregator};
pub use protocol::{ClientMessage, ServerMessage, REALTIME_SAMPLE_RATE};
pub use realtime_client::RealtimeSession;
pub use streamer::{AudioStreamer, CHUNK_DURATION_MS};

/// Capacity of the outbound audio queue (frames)
const AUDIO_QUEUE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub model: String,
    pub voice: String,
    pub instructions: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            voice: "alloy".to_string(),
            instructions: "You are Jarvis, a concise and capable voice assistant. \
                           Answer briefly and speak naturally."
                .to_string(),
        }
    }
}

/// What a remote session reports back
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Decoded chunk of the assistant's voice
    Audio(AudioChunk),
    /// Running transcription of the user's current utterance
    InputTranscript(String),
    /// The user's utterance is final
    InputComplete,
    /// Running transcription of the assistant's current reply
    OutputTranscript(String),
    /// The user started talking over the assistant
    Interrupted,
    /// The assistant's reply is final
    TurnComplete,
    Error(RemoteError),
    Closed,
}

/// An open session as seen by the effect runner
pub struct RemoteLink {
    /// Microphone frames at the capture rate
    pub audio: mpsc::Sender<AudioChunk>,
    pub events: mpsc::UnboundedReceiver<RemoteEvent>,
    /// Cancel to close the session; no `Closed` event follows
    pub close: CancellationToken,
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, config: &RemoteConfig) -> Result<RemoteLink, RemoteError>;
}

/// Connector for the OpenAI Realtime API
pub struct OpenAiConnector {
    api_key: Option<String>,
}

impl OpenAiConnector {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }

    pub fn from_env() -> Self {
        Self::new(crate::openai::api_key())
    }
}

#[async_trait]
impl RemoteConnector for OpenAiConnector {
    async fn connect(&self, config: &RemoteConfig) -> Result<RemoteLink, RemoteError> {
        // A missing key is a precondition failure, never retried
        let api_key = self.api_key.as_deref().ok_or(RemoteError::MissingApiKey)?;

        let mut session = RealtimeSession::connect(api_key, config).await?;
        let incoming = session
            .take_inbound()
            .ok_or_else(|| RemoteError::Protocol("Failed to get incoming receiver".into()))?;

        log::info!("Realtime session open: {}", session.id());

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();

        tokio::spawn(pump(session, incoming, audio_rx, events_tx, close.clone()));

        Ok(RemoteLink {
            audio: audio_tx,
            events: events_rx,
            close,
        })
    }
}

/// Owns the session: forwards audio out, translates messages in
async fn pump(
    mut session: RealtimeSession,
    mut incoming: mpsc::Receiver<ServerMessage>,
    mut audio_rx: mpsc::Receiver<AudioChunk>,
    events: mpsc::UnboundedSender<RemoteEvent>,
    close: CancellationToken,
) {
    let mut streamer = AudioStreamer::new(REALTIME_SAMPLE_RATE, CHUNK_DURATION_MS);
    let mut turn = TurnAggregator::new();
    let mut audio_open = true;

    loop {
        tokio::select! {
            _ = close.cancelled() => {
                session.disconnect().await;
                return;
            }
            frame = audio_rx.recv(), if audio_open => {
                let Some(frame) = frame else {
                    log::debug!("Audio input closed");
                    audio_open = false;
                    continue;
                };
                for chunk in streamer.push(&frame) {
                    if let Err(e) = session.send_audio(&chunk).await {
                        log::error!("Realtime send failed: {}", e);
                        let _ = events.send(RemoteEvent::Error(e));
                        session.disconnect().await;
                        return;
                    }
                }
            }
            msg = incoming.recv() => {
                let Some(msg) = msg else {
                    let _ = events.send(RemoteEvent::Closed);
                    return;
                };
                let interrupted = matches!(msg, ServerMessage::SpeechStarted);
                for event in translate(msg, &mut turn) {
                    if events.send(event).is_err() {
                        session.disconnect().await;
                        return;
                    }
                }
                if interrupted {
                    if let Err(e) = session.send_message(&ClientMessage::CancelResponse).await {
                        log::debug!("response.cancel not sent: {}", e);
                    }
                }
            }
        }
    }
}

/// Map one server message to zero or more session events
pub fn translate(msg: ServerMessage, turn: &mut TurnAggregator) -> Vec<RemoteEvent> {
    match msg {
        ServerMessage::AudioDelta { delta } => match decode_pcm16(&delta, REALTIME_SAMPLE_RATE) {
            Ok(chunk) if !chunk.is_empty() => vec![RemoteEvent::Audio(chunk)],
            Ok(_) => vec![],
            Err(e) => {
                log::warn!("Dropping undecodable audio chunk: {}", e);
                vec![]
            }
        },
        ServerMessage::InputTranscriptDelta { delta } => {
            vec![RemoteEvent::InputTranscript(turn.input.delta(&delta).to_string())]
        }
        ServerMessage::InputTranscriptCompleted { transcript } => {
            let had_partial = !turn.input.is_empty();
            let text = turn.input.complete(&transcript).to_string();
            turn.close_input();
            match (text.is_empty(), had_partial) {
                (false, _) => vec![
                    RemoteEvent::InputTranscript(text),
                    RemoteEvent::InputComplete,
                ],
                (true, true) => vec![RemoteEvent::InputComplete],
                (true, false) => vec![],
            }
        }
        ServerMessage::OutputTranscriptDelta { delta } => {
            vec![RemoteEvent::OutputTranscript(
                turn.output.delta(&delta).to_string(),
            )]
        }
        ServerMessage::OutputTranscriptDone { transcript } => {
            vec![RemoteEvent::OutputTranscript(
                turn.output.complete(&transcript).to_string(),
            )]
        }
        ServerMessage::SpeechStarted => {
            // A new utterance begins; whatever the previous one left is final
            if turn.close_input() {
                vec![RemoteEvent::InputComplete, RemoteEvent::Interrupted]
            } else {
                vec![RemoteEvent::Interrupted]
            }
        }
        ServerMessage::ResponseDone => {
            turn.close_output();
            vec![RemoteEvent::TurnComplete]
        }
        ServerMessage::Error { error } => {
            log::error!("Realtime API error ({}): {}", error.kind, error.message);
            vec![RemoteEvent::Error(RemoteError::Protocol(error.message))]
        }
        ServerMessage::SessionCreated { .. }
        | ServerMessage::SessionUpdated { .. }
        | ServerMessage::Other => vec![],
    }
}
