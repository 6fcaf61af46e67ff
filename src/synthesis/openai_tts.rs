//! OpenAI TTS synthesizer played through the shared playback pipeline
//!
//! Speech is requested as raw PCM (24 kHz, 16-bit mono) so it can go straight
//! onto the playback timeline. The level reported while speaking is the real
//! output level of the sink.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SpeechHandle, SpeechSynthesizer, SynthesisEvent, VoicePreferences};
use crate::audio::codec::i16_to_f32;
use crate::audio::{AudioChunk, Playback};
use crate::error::SynthesisError;
use crate::openai;

/// Sample rate of `response_format: pcm`
pub const TTS_SAMPLE_RATE: u32 = 24_000;

const DEFAULT_MODEL: &str = "tts-1";
const DEFAULT_VOICE: &str = "onyx";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

pub struct OpenAiSynthesizer {
    api_key: String,
    playback: Arc<Playback>,
    voice: String,
    speed: f32,
}

impl OpenAiSynthesizer {
    pub fn new(api_key: impl Into<String>, playback: Arc<Playback>, prefs: &VoicePreferences) -> Self {
        if (prefs.pitch - 1.0).abs() > f32::EPSILON {
            log::debug!("Pitch {} not supported by the TTS endpoint, ignoring", prefs.pitch);
        }
        Self {
            api_key: api_key.into(),
            playback,
            voice: prefs.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            // Endpoint accepts 0.25-4.0
            speed: prefs.rate.clamp(0.25, 4.0),
        }
    }

    /// Build from `OPENAI_API_KEY`, or report `Unsupported` when it is not set
    pub fn from_env(
        playback: Arc<Playback>,
        prefs: &VoicePreferences,
    ) -> Result<Self, SynthesisError> {
        openai::api_key()
            .map(|key| Self::new(key, playback, prefs))
            .ok_or_else(|| SynthesisError::Unsupported("OPENAI_API_KEY not set".into()))
    }
}

struct TtsUtterance {
    token: CancellationToken,
}

impl SpeechHandle for TtsUtterance {
    fn cancel(&mut self) {
        self.token.cancel();
    }
}

impl Drop for TtsUtterance {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl SpeechSynthesizer for OpenAiSynthesizer {
    fn speak(
        &self,
        text: &str,
        events: mpsc::UnboundedSender<SynthesisEvent>,
    ) -> Result<Box<dyn SpeechHandle>, SynthesisError> {
        // At most one audible utterance
        self.playback.stop();

        let token = CancellationToken::new();
        let task_token = token.clone();
        let api_key = self.api_key.clone();
        let voice = self.voice.clone();
        let speed = self.speed;
        let playback = Arc::clone(&self.playback);
        let text = text.to_string();

        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = task_token.cancelled() => return,
                fetched = fetch_speech(&api_key, &voice, speed, &text) => fetched,
            };

            let chunk = match fetched {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::error!("TTS request failed: {}", e);
                    let _ = events.send(SynthesisEvent::Error(e));
                    return;
                }
            };

            playback.enqueue(chunk);
            let _ = events.send(SynthesisEvent::Started);

            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        playback.stop();
                        return;
                    }
                    _ = ticker.tick() => {
                        if !playback.is_playing() {
                            let _ = events.send(SynthesisEvent::Ended);
                            return;
                        }
                        let _ = events.send(SynthesisEvent::Level(playback.level()));
                    }
                }
            }
        });

        Ok(Box::new(TtsUtterance { token }))
    }
}

async fn fetch_speech(
    api_key: &str,
    voice: &str,
    speed: f32,
    text: &str,
) -> Result<AudioChunk, SynthesisError> {
    let request = SpeechRequest {
        model: DEFAULT_MODEL,
        input: text,
        voice,
        speed,
        response_format: "pcm",
    };

    let response = openai::http_client()
        .post(openai::SPEECH_URL)
        .header("Authorization", format!("Bearer {}", api_key))
        .json(&request)
        .send()
        .await
        .map_err(|e| SynthesisError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SynthesisError::Request(format!(
            "OpenAI TTS error {}: {}",
            status,
            openai::error_message(&body)
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| SynthesisError::Request(e.to_string()))?;

    log::debug!("TTS returned {} bytes", bytes.len());
    Ok(pcm_bytes_to_chunk(&bytes))
}

/// Little-endian PCM16 at the TTS rate; a trailing odd byte is dropped
fn pcm_bytes_to_chunk(bytes: &[u8]) -> AudioChunk {
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    AudioChunk::new(samples, TTS_SAMPLE_RATE)
}
