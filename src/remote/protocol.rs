//! Wire messages for a spoken conversation over the OpenAI Realtime socket
//!
//! A session goes: `session.created` from the server, our `session.update`
//! (audio+text, voice, instructions, server VAD), `session.updated`, then
//! microphone audio as `input_audio_buffer.append` while the server streams
//! `response.audio.delta` plus transcripts of both sides. `response.done`
//! ends an assistant turn.

use serde::{Deserialize, Serialize};

use super::RemoteConfig;
use crate::audio::codec::encode_pcm16;

const ENDPOINT: &str = "wss://api.openai.com/v1/realtime";

/// `pcm16` runs at this rate in both directions
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

pub fn realtime_url(model: &str) -> String {
    format!("{}?model={}", ENDPOINT, urlencoding::encode(model))
}

/// Body of `session.update`
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSetup {
    modalities: [&'static str; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    voice: Option<String>,
    input_audio_format: &'static str,
    output_audio_format: &'static str,
    input_audio_transcription: Named,
    /// The server decides when the user's turn is over
    turn_detection: Typed,
}

#[derive(Debug, Clone, Serialize)]
struct Named {
    model: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct Typed {
    #[serde(rename = "type")]
    kind: &'static str,
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl ConversationSetup {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            modalities: ["audio", "text"],
            instructions: non_empty(&config.instructions),
            voice: non_empty(&config.voice),
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            input_audio_transcription: Named { model: "whisper-1" },
            turn_detection: Typed { kind: "server_vad" },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub modalities: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub code: Option<String>,
    pub message: String,
}

/// Messages we send
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.update")]
    Configure { session: ConversationSetup },

    /// `audio` is base64 little-endian PCM16
    #[serde(rename = "input_audio_buffer.append")]
    AppendAudio { audio: String },

    /// Abandon the reply in flight after the user barges in
    #[serde(rename = "response.cancel")]
    CancelResponse,
}

impl ClientMessage {
    pub fn session_update(config: &RemoteConfig) -> Self {
        Self::Configure {
            session: ConversationSetup::from_config(config),
        }
    }

    pub fn audio_append(samples: &[i16]) -> Self {
        Self::AppendAudio {
            audio: encode_pcm16(samples),
        }
    }
}

/// Messages the server sends; anything not listed decodes as `Other`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { transcript: String },

    /// Base64 PCM16 of the assistant's voice
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    OutputTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    OutputTranscriptDone { transcript: String },

    /// Server VAD heard the user start talking
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(other)]
    Other,
}
