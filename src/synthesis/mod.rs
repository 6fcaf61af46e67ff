//! Speech synthesis adapters
//!
//! A synthesizer turns one reply into audible speech and reports
//! `Started`, a stream of `Level` samples while audible, then `Ended`.
//! Cancelling an utterance is silent: no terminal event follows.

pub mod openai_tts;
pub mod timed;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SynthesisError;

pub use openai_tts::OpenAiSynthesizer;
pub use timed::TimedSynthesizer;

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    Started,
    Level(f32),
    Ended,
    Error(SynthesisError),
}

/// Handle to one in-flight utterance
pub trait SpeechHandle: Send {
    fn cancel(&mut self);
}

pub trait SpeechSynthesizer: Send + Sync {
    fn speak(
        &self,
        text: &str,
        events: mpsc::UnboundedSender<SynthesisEvent>,
    ) -> Result<Box<dyn SpeechHandle>, SynthesisError>;
}

/// Preferred voice settings handed to the local synthesizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePreferences {
    pub voice: Option<String>,
    pub rate: f32,
    pub pitch: f32,
}

impl Default for VoicePreferences {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
            pitch: 0.9,
        }
    }
}
