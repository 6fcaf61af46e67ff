//! Speech recognition adapters
//!
//! A recognizer session reports zero or more results followed by exactly one
//! terminal event (`Ended` or `Error`). Restarting is left to the state
//! machine; `stop()` only requests termination, so results already in flight
//! may still arrive afterwards.

pub mod segmenter;
pub mod wake_word;
pub mod whisper;

use tokio::sync::mpsc;

use crate::error::{RecognitionError, RecognitionErrorKind};

pub use segmenter::Segmenter;
pub use wake_word::{WakeMatch, WakeWord};
pub use whisper::WhisperRecognizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionMode {
    /// One utterance, then end
    SingleShot,
    /// Keep transcribing until stopped
    Continuous,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    Result { text: String, is_final: bool },
    Ended,
    Error(RecognitionError),
}

/// A running recognizer instance
pub trait RecognitionSession: Send {
    fn stop(&mut self);
}

pub trait SpeechRecognizer: Send + Sync {
    fn start(
        &self,
        mode: RecognitionMode,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionSession>, RecognitionError>;
}

/// Stand-in used when no recognition backend is available
#[derive(Debug, Default, Clone)]
pub struct UnsupportedRecognizer;

impl SpeechRecognizer for UnsupportedRecognizer {
    fn start(
        &self,
        _mode: RecognitionMode,
        _events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Result<Box<dyn RecognitionSession>, RecognitionError> {
        Err(RecognitionError::new(
            RecognitionErrorKind::Unsupported,
            "Speech Recognition not supported on this system.",
        ))
    }
}
