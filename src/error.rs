//! Error types for the assistant core
//!
//! Every adapter reports its own error enum. The state machine only cares about
//! the coarse classification returned by `kind()`, which decides whether a
//! failure ends the cycle, degrades it, or is swallowed.

use thiserror::Error;

/// Result type alias for assistant operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used by the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Microphone or recognition permission refused. Fatal to the cycle.
    PermissionDenied,
    /// A platform capability is missing. Announce and stay idle.
    Unsupported,
    /// No-speech, aborted and similar recognizer noise. Ignored.
    TransientRecognition,
    /// Remote session failed. Torn down into `Error`.
    RemoteSession,
    /// Remote session closed by the peer. Graceful `Disconnected`.
    RemoteSessionClosed,
    /// No usable audio device.
    DeviceUnavailable,
}

/// Errors raised while acquiring or running the microphone stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio stream failed: {0}")]
    StreamFailed(String),
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            CaptureError::DeviceUnavailable(_) | CaptureError::StreamFailed(_) => {
                ErrorKind::DeviceUnavailable
            }
        }
    }
}

/// Reason a recognizer session terminated with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    NoSpeech,
    Aborted,
    Network,
    PermissionDenied,
    Unsupported,
}

impl RecognitionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionErrorKind::NoSpeech => "no-speech",
            RecognitionErrorKind::Aborted => "aborted",
            RecognitionErrorKind::Network => "network",
            RecognitionErrorKind::PermissionDenied => "not-allowed",
            RecognitionErrorKind::Unsupported => "unsupported",
        }
    }
}

/// Terminal error reported by a speech recognizer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("speech recognition error ({}): {message}", kind.as_str())]
pub struct RecognitionError {
    pub kind: RecognitionErrorKind,
    pub message: String,
}

impl RecognitionError {
    pub fn new(kind: RecognitionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            RecognitionErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            RecognitionErrorKind::Unsupported => ErrorKind::Unsupported,
            RecognitionErrorKind::NoSpeech
            | RecognitionErrorKind::Aborted
            | RecognitionErrorKind::Network => ErrorKind::TransientRecognition,
        }
    }
}

impl From<CaptureError> for RecognitionError {
    fn from(err: CaptureError) -> Self {
        let kind = match err {
            CaptureError::PermissionDenied(_) => RecognitionErrorKind::PermissionDenied,
            CaptureError::DeviceUnavailable(_) => RecognitionErrorKind::Unsupported,
            CaptureError::StreamFailed(_) => RecognitionErrorKind::Aborted,
        };
        RecognitionError::new(kind, err.to_string())
    }
}

/// Errors raised by a speech synthesizer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("speech synthesis not supported: {0}")]
    Unsupported(String),
    #[error("speech request failed: {0}")]
    Request(String),
    #[error("audio playback failed: {0}")]
    Playback(String),
}

impl SynthesisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SynthesisError::Unsupported(_) => ErrorKind::Unsupported,
            SynthesisError::Request(_) | SynthesisError::Playback(_) => {
                ErrorKind::DeviceUnavailable
            }
        }
    }
}

/// Errors raised by the remote conversational session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("OpenAI API key not configured. Set OPENAI_API_KEY environment variable.")]
    MissingApiKey,
    #[error("failed to connect to realtime API: {0}")]
    ConnectionFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("realtime protocol error: {0}")]
    Protocol(String),
    #[error("realtime session closed: {0}")]
    Closed(String),
    #[error("failed to send audio: {0}")]
    SendFailed(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Closed(_) => ErrorKind::RemoteSessionClosed,
            _ => ErrorKind::RemoteSession,
        }
    }
}

/// Errors raised while loading or saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("settings io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Recognition(#[from] RecognitionError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("state loop has shut down")]
    LoopClosed,
}

impl Error {
    /// Classification for the state machine, where one applies
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Capture(e) => Some(e.kind()),
            Error::Recognition(e) => Some(e.error_kind()),
            Error::Synthesis(e) => Some(e.kind()),
            Error::Remote(e) => Some(e.kind()),
            Error::Settings(_) | Error::LoopClosed => None,
        }
    }
}
