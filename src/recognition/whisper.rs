//! Cloud recognizer: energy-segmented capture transcribed by OpenAI Whisper
//!
//! Each session opens its own capture stream, cuts it into utterances with
//! the `Segmenter`, encodes each one as a 16-bit WAV in memory and posts it to
//! the transcriptions endpoint.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use hound::{WavSpec, WavWriter};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::segmenter::{Segmenter, Utterance};
use super::{RecognitionEvent, RecognitionMode, RecognitionSession, SpeechRecognizer};
use crate::audio::codec::f32_to_i16;
use crate::audio::AudioSource;
use crate::error::{RecognitionError, RecognitionErrorKind};
use crate::openai;

/// How long a single-shot session waits for speech to begin
const NO_SPEECH_TIMEOUT: Duration = Duration::from_secs(8);

/// Whisper's estimate above which a segment is treated as silence
const NO_SPEECH_PROB_CUTOFF: f32 = 0.8;

#[derive(Debug, Deserialize)]
struct WhisperVerboseResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    no_speech_prob: Option<f32>,
}

fn max_no_speech_prob(segments: &[WhisperSegment]) -> Option<f32> {
    segments
        .iter()
        .filter_map(|s| s.no_speech_prob)
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

pub struct WhisperRecognizer {
    source: Arc<dyn AudioSource>,
    api_key: String,
    language: String,
    frame_ms: u32,
}

impl WhisperRecognizer {
    pub fn new(
        source: Arc<dyn AudioSource>,
        api_key: impl Into<String>,
        language: &str,
        frame_ms: u32,
    ) -> Self {
        Self {
            source,
            api_key: api_key.into(),
            language: whisper_language(language),
            frame_ms,
        }
    }

    /// Build from `OPENAI_API_KEY`, or `None` when it is not set
    pub fn from_env(source: Arc<dyn AudioSource>, language: &str, frame_ms: u32) -> Option<Self> {
        openai::api_key().map(|key| Self::new(source, key, language, frame_ms))
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn start(
        &self,
        mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionSession>, RecognitionError> {
        let token = CancellationToken::new();
        let job = Job {
            api_key: self.api_key.clone(),
            language: self.language.clone(),
            mode,
            token: token.clone(),
        };
        let source = Arc::clone(&self.source);
        let frame_ms = self.frame_ms;

        tokio::spawn(async move {
            // Device setup can block for a while; keep it off the async workers
            let opening = tokio::task::spawn_blocking(move || source.open(frame_ms));
            let opened = tokio::select! {
                // A stream that opens after this point closes itself on drop
                _ = job.token.cancelled() => {
                    let _ = events.send(RecognitionEvent::Ended);
                    return;
                }
                opened = opening => opened,
            };

            let mut capture = match opened {
                Ok(Ok(capture)) => capture,
                Ok(Err(e)) => {
                    log::error!("Whisper capture failed to open: {}", e);
                    let _ = events.send(RecognitionEvent::Error(e.into()));
                    return;
                }
                Err(e) => {
                    let _ = events.send(RecognitionEvent::Error(RecognitionError::new(
                        RecognitionErrorKind::Aborted,
                        e.to_string(),
                    )));
                    return;
                }
            };

            let terminal = match capture.take_frames() {
                Some(frames) => job.run(frames, &events).await,
                None => RecognitionEvent::Error(RecognitionError::new(
                    RecognitionErrorKind::Aborted,
                    "capture frames unavailable",
                )),
            };
            // Dropping the stream releases the device before the terminal event
            drop(capture);
            let _ = events.send(terminal);
        });

        log::info!("Whisper recognizer started ({:?})", mode);
        Ok(Box::new(WhisperSession { token }))
    }
}

struct WhisperSession {
    token: CancellationToken,
}

impl RecognitionSession for WhisperSession {
    fn stop(&mut self) {
        self.token.cancel();
    }
}

impl Drop for WhisperSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Job {
    api_key: String,
    language: String,
    mode: RecognitionMode,
    token: CancellationToken,
}

impl Job {
    async fn run(
        &self,
        mut frames: mpsc::UnboundedReceiver<crate::audio::AudioChunk>,
        events: &mpsc::UnboundedSender<RecognitionEvent>,
    ) -> RecognitionEvent {
        let mut segmenter = Segmenter::new();
        let deadline = tokio::time::Instant::now() + NO_SPEECH_TIMEOUT;

        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => return RecognitionEvent::Ended,
                _ = tokio::time::sleep_until(deadline),
                    if self.mode == RecognitionMode::SingleShot && !segmenter.is_in_speech() =>
                {
                    return RecognitionEvent::Error(RecognitionError::new(
                        RecognitionErrorKind::NoSpeech,
                        "no speech detected",
                    ));
                }
                frame = frames.recv() => frame,
            };

            let Some(frame) = frame else {
                return RecognitionEvent::Error(RecognitionError::new(
                    RecognitionErrorKind::Aborted,
                    "capture stream ended",
                ));
            };

            let Some(utterance) = segmenter.push(&frame) else {
                continue;
            };

            match self.transcribe(&utterance).await {
                Ok(text) if !text.is_empty() => {
                    let _ = events.send(RecognitionEvent::Result {
                        text,
                        is_final: true,
                    });
                    if self.mode == RecognitionMode::SingleShot {
                        return RecognitionEvent::Ended;
                    }
                }
                Ok(_) => {
                    log::debug!("Utterance transcribed to nothing");
                    if self.mode == RecognitionMode::SingleShot {
                        return RecognitionEvent::Error(RecognitionError::new(
                            RecognitionErrorKind::NoSpeech,
                            "no speech in utterance",
                        ));
                    }
                }
                Err(e) => return RecognitionEvent::Error(e),
            }
        }
    }

    async fn transcribe(&self, utterance: &Utterance) -> Result<String, RecognitionError> {
        let wav = encode_wav(utterance)
            .map_err(|e| RecognitionError::new(RecognitionErrorKind::Aborted, e.to_string()))?;

        log::info!("Transcribing utterance ({} bytes)", wav.len());

        let file_part = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| RecognitionError::new(RecognitionErrorKind::Aborted, e.to_string()))?;

        let form = Form::new()
            .part("file", file_part)
            .text("model", "whisper-1")
            .text("response_format", "verbose_json")
            .text("language", self.language.clone())
            .text("temperature", "0");

        let response = openai::http_client()
            .post(openai::TRANSCRIPTIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| RecognitionError::new(RecognitionErrorKind::Network, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = openai::error_message(&body);
            log::error!("OpenAI API error ({}): {}", status.as_u16(), message);
            let kind = if status.as_u16() == 401 || status.as_u16() == 403 {
                RecognitionErrorKind::PermissionDenied
            } else {
                RecognitionErrorKind::Network
            };
            return Err(RecognitionError::new(kind, message));
        }

        let parsed: WhisperVerboseResponse = response
            .json()
            .await
            .map_err(|e| RecognitionError::new(RecognitionErrorKind::Network, e.to_string()))?;

        let no_speech_prob = max_no_speech_prob(&parsed.segments);
        log::info!(
            "Transcription successful: {} chars (no_speech_prob={:?})",
            parsed.text.len(),
            no_speech_prob
        );

        if no_speech_prob.is_some_and(|p| p > NO_SPEECH_PROB_CUTOFF) {
            return Ok(String::new());
        }
        Ok(parsed.text.trim().to_string())
    }
}

/// Encode an utterance as a mono 16-bit WAV file in memory
fn encode_wav(utterance: &Utterance) -> Result<Vec<u8>, hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: utterance.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for &sample in &utterance.samples {
            writer.write_sample(f32_to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Whisper wants ISO-639-1 ("en"), settings carry a BCP-47 tag ("en-US")
fn whisper_language(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or("en")
        .to_lowercase()
}
