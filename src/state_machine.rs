//! Session state machine for the assistant
//!
//! Single-writer pattern: every adapter callback arrives as an `Event`, and
//! `reduce()` returns the next session plus the effects the runner must
//! execute. Adapter instances are tagged with a `Generation`; callbacks from
//! superseded instances are dropped, and late-opened resources that nobody
//! wants any more are closed on arrival.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AudioChunk;
use crate::error::{CaptureError, ErrorKind, RecognitionError, RemoteError, SynthesisError};
use crate::recognition::{RecognitionMode, WakeMatch, WakeWord};
use crate::responder::{Intent, Response};
use crate::transcript::{Sender, TranscriptOp};

/// Reply to a bare wake word
pub const ACKNOWLEDGEMENT: &str = "Yes?";

/// Monotonically increasing id of one adapter instance or timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which conversation cycle the assistant runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Wake word → local responder → local speech
    #[default]
    Offline,
    /// Wake word → streaming session with a remote conversational model
    Remote,
}

/// Externally visible session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Standby,
    Listening,
    Processing,
    Speaking,
    WaitingForWakeWord,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether this state belongs to the variant's subset
    pub fn reachable_in(self, variant: Variant) -> bool {
        use ConnectionState::*;
        match self {
            Disconnected | Error => true,
            Standby | Listening | Processing | Speaking => variant == Variant::Offline,
            WaitingForWakeWord | Connecting | Connected => variant == Variant::Remote,
        }
    }
}

/// The wake-word recognizer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    Active(Generation),
    /// Waiting for the debounce timer carrying this token
    Restarting(Generation),
    /// Recognition unavailable; nothing runs
    Idle,
}

/// Authoritative phase, including the generations of every held resource
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Disconnected,
    Standby {
        listener: Listener,
    },
    Listening {
        recognizer: Generation,
        capture: Generation,
    },
    Processing {
        request: Generation,
    },
    Speaking {
        utterance: Generation,
    },
    WaitingForWakeWord {
        listener: Listener,
    },
    Connecting {
        session: Generation,
    },
    Connected {
        session: Generation,
        capture: Generation,
    },
    Error {
        message: String,
    },
}

impl Phase {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Standby { .. } => ConnectionState::Standby,
            Phase::Listening { .. } => ConnectionState::Listening,
            Phase::Processing { .. } => ConnectionState::Processing,
            Phase::Speaking { .. } => ConnectionState::Speaking,
            Phase::WaitingForWakeWord { .. } => ConnectionState::WaitingForWakeWord,
            Phase::Connecting { .. } => ConnectionState::Connecting,
            Phase::Connected { .. } => ConnectionState::Connected,
            Phase::Error { .. } => ConnectionState::Error,
        }
    }

    /// Phases during which a capture or playback stream feeds the volume
    fn is_streaming(&self) -> bool {
        matches!(
            self,
            Phase::Listening { .. } | Phase::Speaking { .. } | Phase::Connected { .. }
        )
    }

    fn capture(&self) -> Option<Generation> {
        match self {
            Phase::Listening { capture, .. } | Phase::Connected { capture, .. } => Some(*capture),
            _ => None,
        }
    }

    fn set_listener(&mut self, next: Listener) {
        if let Phase::Standby { listener } | Phase::WaitingForWakeWord { listener } = self {
            *listener = next;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub phase: Phase,
    next_generation: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            phase: Phase::Disconnected,
            next_generation: 1,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.phase.connection_state()
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.phase {
            Phase::Error { message } => Some(message),
            _ => None,
        }
    }

    fn mint(&mut self) -> Generation {
        let id = Generation(self.next_generation);
        self.next_generation += 1;
        id
    }
}

/// Static inputs to the reducer
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub variant: Variant,
    pub wake_word: WakeWord,
    pub restart_delay: Duration,
}

impl MachineConfig {
    pub fn new(variant: Variant, wake_word: &str, restart_delay: Duration) -> Self {
        Self {
            variant,
            wake_word: WakeWord::new(wake_word),
            restart_delay,
        }
    }
}

/// Short sounds for an external chime layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Cue {
    SystemStart,
    WakeWordDetected,
    ListeningStarted,
    Disconnect,
}

/// Where an opened capture stream's frames go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRoute {
    /// Volume meter only
    Meter,
    /// Streamed into the remote session
    Remote { session: Generation },
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // UI
    Toggle,
    StopSpeaking,
    ActivateListening,
    Exit,

    // Recognizer
    RecognitionResult {
        id: Generation,
        text: String,
        is_final: bool,
    },
    RecognizerEnded {
        id: Generation,
    },
    RecognizerFailed {
        id: Generation,
        error: RecognitionError,
    },
    RestartDue {
        token: Generation,
    },

    // Capture
    CaptureOpened {
        id: Generation,
    },
    CaptureFailed {
        id: Generation,
        error: CaptureError,
    },
    /// Amplitude from the capture or synthesis instance `id`
    Level {
        id: Generation,
        level: f32,
    },

    // Responder / synthesis
    ResponseReady {
        id: Generation,
        response: Response,
    },
    SynthesisStarted {
        id: Generation,
    },
    SynthesisEnded {
        id: Generation,
    },
    SynthesisFailed {
        id: Generation,
        error: SynthesisError,
    },

    // Remote session
    RemoteOpened {
        id: Generation,
    },
    RemoteFailed {
        id: Generation,
        error: RemoteError,
    },
    RemoteAudio {
        id: Generation,
        chunk: AudioChunk,
    },
    RemoteInputTranscript {
        id: Generation,
        text: String,
    },
    RemoteOutputTranscript {
        id: Generation,
        text: String,
    },
    RemoteInputComplete {
        id: Generation,
    },
    RemoteInterrupted {
        id: Generation,
    },
    RemoteTurnComplete {
        id: Generation,
    },
    RemoteError {
        id: Generation,
        error: RemoteError,
    },
    RemoteClosed {
        id: Generation,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartRecognizer {
        id: Generation,
        mode: RecognitionMode,
    },
    StopRecognizer {
        id: Generation,
    },
    ScheduleRestart {
        token: Generation,
        delay: Duration,
    },
    CancelRestart {
        token: Generation,
    },
    OpenCapture {
        id: Generation,
        route: CaptureRoute,
    },
    CloseCapture {
        id: Generation,
    },
    Respond {
        id: Generation,
        command: String,
    },
    Speak {
        id: Generation,
        text: String,
    },
    /// Cancel (or release a finished) utterance
    CancelSpeech {
        id: Generation,
    },
    OpenRemote {
        id: Generation,
    },
    CloseRemote {
        id: Generation,
    },
    PlayChunk {
        session: Generation,
        chunk: AudioChunk,
    },
    StopPlayback {
        session: Generation,
    },

    // Handled by the state loop itself
    Transcript(TranscriptOp),
    PublishVolume(f32),
    PlayCue(Cue),
    OpenIntent(Intent),
    EmitUi,
}

/// Reducer function: (config, session, event) -> (next_session, effects)
///
/// Key rules:
/// - Never mutate the input session
/// - Ignore callbacks whose generation is not the one the phase holds
/// - Close resources that open after their phase was left
/// - Emit EmitUi (and a zero volume when no stream remains) on every phase change
pub fn reduce(config: &MachineConfig, session: &Session, event: Event) -> (Session, Vec<Effect>) {
    let mut next = session.clone();
    let mut effects = Vec::new();

    step(config, &mut next, event, &mut effects);

    let changed = next.connection_state() != session.connection_state()
        || next.error_message() != session.error_message();
    if changed {
        if !next.phase.is_streaming() && session.phase.is_streaming() {
            effects.push(Effect::PublishVolume(0.0));
        }
        effects.push(Effect::EmitUi);
    }

    (next, effects)
}

fn step(config: &MachineConfig, s: &mut Session, event: Event, fx: &mut Vec<Effect>) {
    use Event::*;

    let offline = config.variant == Variant::Offline;
    let current = s.phase.clone();

    match (current.clone(), event) {
        // -----------------
        // Lifecycle
        // -----------------
        (Phase::Disconnected, Toggle) => {
            fx.push(Effect::PlayCue(Cue::SystemStart));
            start_listener_loop(config, s, fx);
        }
        (Phase::Disconnected, Exit) => {}
        (_, Toggle) => {
            teardown(&current, fx);
            fx.push(Effect::PlayCue(Cue::Disconnect));
            s.phase = Phase::Disconnected;
        }
        (_, Exit) => {
            teardown(&current, fx);
            s.phase = Phase::Disconnected;
        }

        // -----------------
        // Wake-word loop (Standby / WaitingForWakeWord)
        // -----------------
        (
            Phase::Standby {
                listener: Listener::Active(cur),
            },
            RecognitionResult {
                id,
                text,
                is_final: true,
            },
        ) if cur == id => match config.wake_word.detect(&text) {
            WakeMatch::Absent => log::debug!("No wake word in {:?}", text),
            WakeMatch::Bare => {
                log::info!("Wake word heard");
                fx.push(Effect::StopRecognizer { id });
                fx.push(Effect::PlayCue(Cue::WakeWordDetected));
                append(fx, Sender::User, text);
                speak(s, ACKNOWLEDGEMENT.to_string(), fx);
            }
            WakeMatch::Command(command) => {
                log::info!("Wake word heard with command {:?}", command);
                fx.push(Effect::StopRecognizer { id });
                fx.push(Effect::PlayCue(Cue::WakeWordDetected));
                append(fx, Sender::User, text);
                process(s, command, fx);
            }
        },
        (
            Phase::WaitingForWakeWord {
                listener: Listener::Active(cur),
            },
            RecognitionResult {
                id,
                text,
                is_final: true,
            },
        ) if cur == id => {
            if config.wake_word.detect(&text) == WakeMatch::Absent {
                log::debug!("No wake word in {:?}", text);
            } else {
                log::info!("Wake word heard, opening remote session");
                fx.push(Effect::StopRecognizer { id });
                fx.push(Effect::PlayCue(Cue::WakeWordDetected));
                let session = s.mint();
                fx.push(Effect::OpenRemote { id: session });
                s.phase = Phase::Connecting { session };
            }
        }
        (
            Phase::Standby {
                listener: Listener::Active(cur),
            }
            | Phase::WaitingForWakeWord {
                listener: Listener::Active(cur),
            },
            RecognizerEnded { id },
        ) if cur == id => {
            fx.push(Effect::StopRecognizer { id });
            schedule_restart(config, s, fx);
        }
        (
            Phase::Standby {
                listener: Listener::Active(cur),
            }
            | Phase::WaitingForWakeWord {
                listener: Listener::Active(cur),
            },
            RecognizerFailed { id, error },
        ) if cur == id => match error.error_kind() {
            ErrorKind::PermissionDenied => fail(s, &current, error.to_string(), fx),
            ErrorKind::Unsupported => {
                log::warn!("Speech recognition unavailable: {}", error);
                fx.push(Effect::StopRecognizer { id });
                append(fx, Sender::Assistant, error.message);
                s.phase.set_listener(Listener::Idle);
            }
            _ => {
                log::debug!("Transient recognition error: {}", error);
                fx.push(Effect::StopRecognizer { id });
                schedule_restart(config, s, fx);
            }
        },
        (
            Phase::Standby {
                listener: Listener::Restarting(cur),
            }
            | Phase::WaitingForWakeWord {
                listener: Listener::Restarting(cur),
            },
            RestartDue { token },
        ) if cur == token => {
            let id = s.mint();
            fx.push(Effect::StartRecognizer {
                id,
                mode: listener_mode(config),
            });
            s.phase.set_listener(Listener::Active(id));
        }

        // -----------------
        // Manual activation (offline)
        // -----------------
        (Phase::Standby { .. } | Phase::Speaking { .. }, ActivateListening) if offline => {
            teardown(&current, fx);
            let recognizer = s.mint();
            let capture = s.mint();
            fx.push(Effect::StartRecognizer {
                id: recognizer,
                mode: RecognitionMode::SingleShot,
            });
            fx.push(Effect::OpenCapture {
                id: capture,
                route: CaptureRoute::Meter,
            });
            fx.push(Effect::PlayCue(Cue::ListeningStarted));
            s.phase = Phase::Listening {
                recognizer,
                capture,
            };
        }

        // -----------------
        // Listening
        // -----------------
        (
            Phase::Listening {
                recognizer,
                capture,
            },
            RecognitionResult {
                id,
                text,
                is_final: true,
            },
        ) if recognizer == id && !text.trim().is_empty() => {
            fx.push(Effect::StopRecognizer { id });
            fx.push(Effect::CloseCapture { id: capture });
            let command = text.trim().to_string();
            append(fx, Sender::User, text);
            process(s, command, fx);
        }
        (
            Phase::Listening {
                recognizer,
                capture,
            },
            RecognizerEnded { id },
        ) if recognizer == id => {
            log::debug!("Manual listening ended without a command");
            fx.push(Effect::StopRecognizer { id });
            fx.push(Effect::CloseCapture { id: capture });
            start_listener_loop(config, s, fx);
        }
        (
            Phase::Listening {
                recognizer,
                capture,
            },
            RecognizerFailed { id, error },
        ) if recognizer == id => match error.error_kind() {
            ErrorKind::PermissionDenied => fail(s, &current, error.to_string(), fx),
            ErrorKind::Unsupported => {
                fx.push(Effect::StopRecognizer { id });
                fx.push(Effect::CloseCapture { id: capture });
                append(fx, Sender::Assistant, error.message);
                s.phase = Phase::Standby {
                    listener: Listener::Idle,
                };
            }
            _ => {
                log::debug!("Transient recognition error while listening: {}", error);
                fx.push(Effect::StopRecognizer { id });
                fx.push(Effect::CloseCapture { id: capture });
                start_listener_loop(config, s, fx);
            }
        },

        // -----------------
        // Processing
        // -----------------
        (Phase::Processing { request }, ResponseReady { id, response }) if request == id => {
            append(fx, Sender::Assistant, response.text.clone());
            if let Some(intent) = response.intent {
                fx.push(Effect::OpenIntent(intent));
            }
            speak(s, response.text, fx);
        }

        // -----------------
        // Speaking
        // -----------------
        (Phase::Speaking { utterance }, SynthesisEnded { id }) if utterance == id => {
            fx.push(Effect::CancelSpeech { id });
            start_listener_loop(config, s, fx);
        }
        (Phase::Speaking { utterance }, SynthesisFailed { id, error }) if utterance == id => {
            log::warn!("Speech synthesis failed: {}", error);
            fx.push(Effect::CancelSpeech { id });
            start_listener_loop(config, s, fx);
        }
        (Phase::Speaking { .. }, StopSpeaking) => {
            teardown(&current, fx);
            start_listener_loop(config, s, fx);
        }

        // -----------------
        // Connecting / Connected
        // -----------------
        (Phase::Connecting { session }, RemoteOpened { id }) if session == id => {
            let capture = s.mint();
            fx.push(Effect::OpenCapture {
                id: capture,
                route: CaptureRoute::Remote { session },
            });
            fx.push(Effect::PlayCue(Cue::ListeningStarted));
            s.phase = Phase::Connected { session, capture };
        }
        (Phase::Connecting { session }, RemoteFailed { id, error })
        | (Phase::Connected { session, .. }, RemoteError { id, error })
            if session == id =>
        {
            remote_failure(s, &current, error, fx);
        }
        (Phase::Connected { session, .. }, RemoteClosed { id }) if session == id => {
            log::info!("Remote session closed by peer");
            teardown(&current, fx);
            fx.push(Effect::PlayCue(Cue::Disconnect));
            s.phase = Phase::Disconnected;
        }
        (Phase::Connected { session, .. }, RemoteAudio { id, chunk }) if session == id => {
            fx.push(Effect::PlayChunk { session, chunk });
        }
        (Phase::Connected { session, .. }, RemoteInputTranscript { id, text }) if session == id => {
            fx.push(Effect::Transcript(TranscriptOp::UpsertInProgress {
                sender: Sender::User,
                text,
            }));
        }
        (Phase::Connected { session, .. }, RemoteOutputTranscript { id, text })
            if session == id =>
        {
            fx.push(Effect::Transcript(TranscriptOp::UpsertInProgress {
                sender: Sender::Assistant,
                text,
            }));
        }
        (Phase::Connected { session, .. }, RemoteInterrupted { id }) if session == id => {
            fx.push(Effect::StopPlayback { session });
        }
        (Phase::Connected { session, .. }, RemoteInputComplete { id }) if session == id => {
            finalize(fx, Sender::User);
        }
        (Phase::Connected { session, .. }, RemoteTurnComplete { id }) if session == id => {
            finalize(fx, Sender::Assistant);
        }
        (Phase::Connected { session, .. }, StopSpeaking) => {
            fx.push(Effect::StopPlayback { session });
        }

        // -----------------
        // Capture
        // -----------------
        (_, CaptureOpened { id }) if current.capture() == Some(id) => {
            log::debug!("Capture {} open", id);
        }
        (_, CaptureFailed { id, error }) if current.capture() == Some(id) => {
            if error.kind() == ErrorKind::PermissionDenied || !offline {
                fail(s, &current, error.to_string(), fx);
            } else {
                // Listening continues without a meter
                log::warn!("Volume meter unavailable: {}", error);
                fx.push(Effect::CloseCapture { id });
            }
        }
        (Phase::Listening { capture, .. } | Phase::Connected { capture, .. }, Level { id, level })
            if capture == id =>
        {
            fx.push(Effect::PublishVolume(level));
        }
        (Phase::Speaking { utterance }, Level { id, level }) if utterance == id => {
            fx.push(Effect::PublishVolume(level));
        }

        // -----------------
        // Resources that opened after their phase was left
        // -----------------
        (_, RemoteOpened { id }) => {
            log::info!("Releasing late remote session {}", id);
            fx.push(Effect::CloseRemote { id });
        }
        (_, CaptureOpened { id }) => {
            log::debug!("Releasing late capture {}", id);
            fx.push(Effect::CloseCapture { id });
        }

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        (_, event) => log::trace!("Ignoring {:?} in {:?}", event, current.connection_state()),
    }
}

fn listener_mode(config: &MachineConfig) -> RecognitionMode {
    match config.variant {
        Variant::Offline => RecognitionMode::SingleShot,
        Variant::Remote => RecognitionMode::Continuous,
    }
}

/// Enter the variant's wake-word phase with a fresh recognizer
fn start_listener_loop(config: &MachineConfig, s: &mut Session, fx: &mut Vec<Effect>) {
    let id = s.mint();
    fx.push(Effect::StartRecognizer {
        id,
        mode: listener_mode(config),
    });
    let listener = Listener::Active(id);
    s.phase = match config.variant {
        Variant::Offline => Phase::Standby { listener },
        Variant::Remote => Phase::WaitingForWakeWord { listener },
    };
}

fn schedule_restart(config: &MachineConfig, s: &mut Session, fx: &mut Vec<Effect>) {
    let token = s.mint();
    fx.push(Effect::ScheduleRestart {
        token,
        delay: config.restart_delay,
    });
    s.phase.set_listener(Listener::Restarting(token));
}

fn speak(s: &mut Session, text: String, fx: &mut Vec<Effect>) {
    let utterance = s.mint();
    fx.push(Effect::Speak {
        id: utterance,
        text,
    });
    s.phase = Phase::Speaking { utterance };
}

fn process(s: &mut Session, command: String, fx: &mut Vec<Effect>) {
    let request = s.mint();
    fx.push(Effect::Respond {
        id: request,
        command,
    });
    s.phase = Phase::Processing { request };
}

fn append(fx: &mut Vec<Effect>, sender: Sender, text: String) {
    fx.push(Effect::Transcript(TranscriptOp::Append { sender, text }));
}

fn finalize(fx: &mut Vec<Effect>, sender: Sender) {
    fx.push(Effect::Transcript(TranscriptOp::Finalize { sender }));
}

fn fail(s: &mut Session, current: &Phase, message: String, fx: &mut Vec<Effect>) {
    log::error!("Entering error state: {}", message);
    teardown(current, fx);
    s.phase = Phase::Error { message };
}

fn remote_failure(s: &mut Session, current: &Phase, error: RemoteError, fx: &mut Vec<Effect>) {
    if error.kind() == ErrorKind::RemoteSessionClosed {
        log::info!("Remote session ended: {}", error);
        teardown(current, fx);
        fx.push(Effect::PlayCue(Cue::Disconnect));
        s.phase = Phase::Disconnected;
    } else {
        fail(s, current, error.to_string(), fx);
    }
}

/// Release everything the phase holds
fn teardown(phase: &Phase, fx: &mut Vec<Effect>) {
    match phase {
        Phase::Disconnected | Phase::Error { .. } | Phase::Processing { .. } => {}
        Phase::Standby { listener } | Phase::WaitingForWakeWord { listener } => match listener {
            Listener::Active(id) => fx.push(Effect::StopRecognizer { id: *id }),
            Listener::Restarting(token) => fx.push(Effect::CancelRestart { token: *token }),
            Listener::Idle => {}
        },
        Phase::Listening {
            recognizer,
            capture,
        } => {
            fx.push(Effect::StopRecognizer { id: *recognizer });
            fx.push(Effect::CloseCapture { id: *capture });
        }
        Phase::Speaking { utterance } => fx.push(Effect::CancelSpeech { id: *utterance }),
        Phase::Connecting { session } => fx.push(Effect::CloseRemote { id: *session }),
        Phase::Connected { session, capture } => {
            fx.push(Effect::CloseCapture { id: *capture });
            fx.push(Effect::CloseRemote { id: *session });
            fx.push(Effect::StopPlayback { session: *session });
            finalize(fx, Sender::User);
            finalize(fx, Sender::Assistant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecognitionErrorKind;

    fn offline() -> MachineConfig {
        MachineConfig::new(Variant::Offline, "jarvis", Duration::from_millis(100))
    }

    fn remote() -> MachineConfig {
        MachineConfig::new(Variant::Remote, "jarvis", Duration::from_millis(100))
    }

    /// Apply events in order, collecting every effect
    fn run(config: &MachineConfig, events: Vec<Event>) -> (Session, Vec<Effect>) {
        let mut session = Session::new();
        let mut all = Vec::new();
        for event in events {
            let (next, effects) = reduce(config, &session, event);
            assert!(
                next.connection_state().reachable_in(config.variant),
                "{:?} unreachable in {:?}",
                next.connection_state(),
                config.variant
            );
            session = next;
            all.extend(effects);
        }
        (session, all)
    }

    fn active_listener(session: &Session) -> Generation {
        match session.phase {
            Phase::Standby {
                listener: Listener::Active(id),
            }
            | Phase::WaitingForWakeWord {
                listener: Listener::Active(id),
            } => id,
            ref other => panic!("no active listener in {other:?}"),
        }
    }

    fn heard(id: Generation, text: &str) -> Event {
        Event::RecognitionResult {
            id,
            text: text.to_string(),
            is_final: true,
        }
    }

    fn denied() -> RecognitionError {
        RecognitionError::new(RecognitionErrorKind::PermissionDenied, "not-allowed")
    }

    #[test]
    fn toggle_on_offline_enters_standby() {
        let (session, effects) = run(&offline(), vec![Event::Toggle]);
        assert_eq!(session.connection_state(), ConnectionState::Standby);
        assert!(effects.contains(&Effect::PlayCue(Cue::SystemStart)));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartRecognizer {
                mode: RecognitionMode::SingleShot,
                ..
            }
        )));
        assert!(effects.contains(&Effect::EmitUi));
    }

    #[test]
    fn toggle_on_remote_waits_for_wake_word() {
        let (session, effects) = run(&remote(), vec![Event::Toggle]);
        assert_eq!(
            session.connection_state(),
            ConnectionState::WaitingForWakeWord
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::StartRecognizer {
                mode: RecognitionMode::Continuous,
                ..
            }
        )));
    }

    #[test]
    fn toggle_off_stops_recognizer() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (off, effects) = reduce(&config, &on, Event::Toggle);
        assert_eq!(off.phase, Phase::Disconnected);
        assert!(effects.contains(&Effect::StopRecognizer { id }));
        assert!(effects.contains(&Effect::PlayCue(Cue::Disconnect)));
    }

    #[test]
    fn wake_word_with_command_goes_to_processing() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (next, effects) = reduce(&config, &on, heard(id, "Jarvis what time is it"));
        assert_eq!(next.connection_state(), ConnectionState::Processing);
        assert!(effects.contains(&Effect::StopRecognizer { id }));
        assert!(effects.contains(&Effect::PlayCue(Cue::WakeWordDetected)));
        assert!(effects.contains(&Effect::Transcript(TranscriptOp::Append {
            sender: Sender::User,
            text: "Jarvis what time is it".into(),
        })));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Respond { command, .. } if command == "what time is it"
        )));
    }

    #[test]
    fn bare_wake_word_acknowledges() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (next, effects) = reduce(&config, &on, heard(id, "Jarvis"));
        assert_eq!(next.connection_state(), ConnectionState::Speaking);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Speak { text, .. } if text == ACKNOWLEDGEMENT)));
        // Only the user's words are transcribed
        let appended = effects
            .iter()
            .filter(|e| matches!(e, Effect::Transcript(_)))
            .count();
        assert_eq!(appended, 1);
    }

    #[test]
    fn speech_without_wake_word_is_ignored() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (next, effects) = reduce(&config, &on, heard(id, "what time is it"));
        assert_eq!(next, on);
        assert!(effects.is_empty());
    }

    #[test]
    fn full_offline_cycle_returns_to_standby() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let listener = active_listener(&on);

        let (processing, _) = reduce(&config, &on, heard(listener, "jarvis hello"));
        let Phase::Processing { request } = processing.phase else {
            panic!("expected processing");
        };

        let response = Response {
            text: "Greetings. All systems are nominal.".into(),
            intent: None,
        };
        let (speaking, effects) = reduce(
            &config,
            &processing,
            Event::ResponseReady {
                id: request,
                response,
            },
        );
        let Phase::Speaking { utterance } = speaking.phase else {
            panic!("expected speaking");
        };
        assert!(effects.contains(&Effect::Transcript(TranscriptOp::Append {
            sender: Sender::Assistant,
            text: "Greetings. All systems are nominal.".into(),
        })));

        let (standby, effects) =
            reduce(&config, &speaking, Event::SynthesisEnded { id: utterance });
        assert_eq!(standby.connection_state(), ConnectionState::Standby);
        assert!(effects.contains(&Effect::CancelSpeech { id: utterance }));
        assert!(effects.contains(&Effect::PublishVolume(0.0)));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartRecognizer { .. })));
    }

    #[test]
    fn intent_is_forwarded() {
        let config = offline();
        let session = Session {
            phase: Phase::Processing {
                request: Generation(5),
            },
            next_generation: 6,
        };
        let intent = Intent::OpenUrl {
            url: "https://www.youtube.com".into(),
        };
        let (_, effects) = reduce(
            &config,
            &session,
            Event::ResponseReady {
                id: Generation(5),
                response: Response {
                    text: "Opening YouTube.".into(),
                    intent: Some(intent.clone()),
                },
            },
        );
        assert!(effects.contains(&Effect::OpenIntent(intent)));
    }

    #[test]
    fn recognizer_end_schedules_debounced_restart() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (waiting, effects) = reduce(&config, &on, Event::RecognizerEnded { id });
        let Phase::Standby {
            listener: Listener::Restarting(token),
        } = waiting.phase
        else {
            panic!("expected restarting listener");
        };
        assert!(effects.contains(&Effect::ScheduleRestart {
            token,
            delay: Duration::from_millis(100)
        }));

        let (restarted, effects) = reduce(&config, &waiting, Event::RestartDue { token });
        let new_id = active_listener(&restarted);
        assert!(new_id > id);
        assert!(effects.contains(&Effect::StartRecognizer {
            id: new_id,
            mode: RecognitionMode::SingleShot
        }));
    }

    #[test]
    fn toggle_off_cancels_pending_restart() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let (waiting, _) = reduce(&config, &on, Event::RecognizerEnded { id });
        let Phase::Standby {
            listener: Listener::Restarting(token),
        } = waiting.phase
        else {
            panic!("expected restarting listener");
        };

        let (off, effects) = reduce(&config, &waiting, Event::Toggle);
        assert!(effects.contains(&Effect::CancelRestart { token }));

        // The timer firing anyway is ignored
        let (still_off, effects) = reduce(&config, &off, Event::RestartDue { token });
        assert_eq!(still_off.phase, Phase::Disconnected);
        assert!(effects.is_empty());
    }

    #[test]
    fn transient_errors_restart_the_loop() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (next, effects) = reduce(
            &config,
            &on,
            Event::RecognizerFailed {
                id,
                error: RecognitionError::new(RecognitionErrorKind::NoSpeech, ""),
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Standby);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleRestart { .. })));
    }

    #[test]
    fn permission_denial_is_terminal_until_toggled() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (error, effects) = reduce(&config, &on, Event::RecognizerFailed { id, error: denied() });
        assert_eq!(error.connection_state(), ConnectionState::Error);
        assert!(error.error_message().unwrap().contains("not-allowed"));
        assert!(effects.contains(&Effect::StopRecognizer { id }));

        for event in [
            Event::ActivateListening,
            Event::StopSpeaking,
            Event::RecognizerEnded { id },
        ] {
            let (same, effects) = reduce(&config, &error, event);
            assert_eq!(same, error);
            assert!(effects.is_empty());
        }

        let (off, _) = reduce(&config, &error, Event::Toggle);
        assert_eq!(off.phase, Phase::Disconnected);
        let (on_again, _) = reduce(&config, &off, Event::Toggle);
        assert_eq!(on_again.connection_state(), ConnectionState::Standby);
    }

    #[test]
    fn unsupported_recognition_is_announced_and_idle() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (next, effects) = reduce(
            &config,
            &on,
            Event::RecognizerFailed {
                id,
                error: RecognitionError::new(
                    RecognitionErrorKind::Unsupported,
                    "Speech Recognition not supported on this system.",
                ),
            },
        );
        assert_eq!(
            next.phase,
            Phase::Standby {
                listener: Listener::Idle
            }
        );
        assert!(effects.contains(&Effect::Transcript(TranscriptOp::Append {
            sender: Sender::Assistant,
            text: "Speech Recognition not supported on this system.".into(),
        })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleRestart { .. })));
    }

    #[test]
    fn stale_recognizer_callbacks_are_dropped() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let stale = Generation(id.0 + 100);

        for event in [
            heard(stale, "jarvis what time is it"),
            Event::RecognizerEnded { id: stale },
            Event::RecognizerFailed {
                id: stale,
                error: denied(),
            },
        ] {
            let (same, effects) = reduce(&config, &on, event);
            assert_eq!(same, on);
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn stop_speaking_returns_to_standby() {
        let config = offline();
        let session = Session {
            phase: Phase::Speaking {
                utterance: Generation(3),
            },
            next_generation: 4,
        };
        let (next, effects) = reduce(&config, &session, Event::StopSpeaking);
        assert_eq!(next.connection_state(), ConnectionState::Standby);
        assert_eq!(effects[0], Effect::CancelSpeech { id: Generation(3) });
        assert!(effects.contains(&Effect::PublishVolume(0.0)));

        // Late end from the cancelled utterance changes nothing
        let (same, effects) = reduce(&config, &next, Event::SynthesisEnded { id: Generation(3) });
        assert_eq!(same, next);
        assert!(effects.is_empty());
    }

    #[test]
    fn speaking_level_feeds_volume() {
        let config = offline();
        let session = Session {
            phase: Phase::Speaking {
                utterance: Generation(3),
            },
            next_generation: 4,
        };
        let (_, effects) = reduce(
            &config,
            &session,
            Event::Level {
                id: Generation(3),
                level: 42.0,
            },
        );
        assert_eq!(effects, vec![Effect::PublishVolume(42.0)]);
    }

    #[test]
    fn manual_activation_takes_first_result_verbatim() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let listener = active_listener(&on);

        let (listening, effects) = reduce(&config, &on, Event::ActivateListening);
        let Phase::Listening {
            recognizer,
            capture,
        } = listening.phase
        else {
            panic!("expected listening");
        };
        assert!(effects.contains(&Effect::StopRecognizer { id: listener }));
        assert!(effects.contains(&Effect::OpenCapture {
            id: capture,
            route: CaptureRoute::Meter
        }));
        assert!(effects.contains(&Effect::PlayCue(Cue::ListeningStarted)));

        let (processing, effects) = reduce(&config, &listening, heard(recognizer, "open youtube"));
        assert_eq!(processing.connection_state(), ConnectionState::Processing);
        assert!(effects.contains(&Effect::CloseCapture { id: capture }));
        assert!(effects.contains(&Effect::PublishVolume(0.0)));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Respond { command, .. } if command == "open youtube"
        )));
    }

    #[test]
    fn manual_listening_without_result_resumes_standby() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle, Event::ActivateListening]);
        let Phase::Listening {
            recognizer,
            capture,
        } = on.phase
        else {
            panic!("expected listening");
        };

        let (next, effects) = reduce(&config, &on, Event::RecognizerEnded { id: recognizer });
        assert_eq!(next.connection_state(), ConnectionState::Standby);
        assert!(effects.contains(&Effect::CloseCapture { id: capture }));
    }

    #[test]
    fn capture_denial_while_listening_is_fatal() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle, Event::ActivateListening]);
        let Phase::Listening {
            recognizer,
            capture,
        } = on.phase
        else {
            panic!("expected listening");
        };

        let (next, effects) = reduce(
            &config,
            &on,
            Event::CaptureFailed {
                id: capture,
                error: CaptureError::PermissionDenied("portal refused".into()),
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Error);
        assert!(effects.contains(&Effect::StopRecognizer { id: recognizer }));
        assert!(effects.contains(&Effect::CloseCapture { id: capture }));
    }

    #[test]
    fn activate_listening_is_ignored_in_remote_variant() {
        let config = remote();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let (next, effects) = reduce(&config, &on, Event::ActivateListening);
        assert_eq!(next, on);
        assert!(effects.is_empty());
    }

    fn connected(config: &MachineConfig) -> (Session, Generation, Generation) {
        let (on, _) = run(config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let (connecting, _) = reduce(config, &on, heard(id, "hey jarvis"));
        let Phase::Connecting { session } = connecting.phase else {
            panic!("expected connecting");
        };
        let (connected, _) = reduce(config, &connecting, Event::RemoteOpened { id: session });
        let Phase::Connected { capture, .. } = connected.phase else {
            panic!("expected connected");
        };
        (connected, session, capture)
    }

    #[test]
    fn remote_wake_word_connects_and_streams() {
        let config = remote();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);

        let (connecting, effects) = reduce(&config, &on, heard(id, "Jarvis, are you there?"));
        let Phase::Connecting { session } = connecting.phase else {
            panic!("expected connecting");
        };
        assert!(effects.contains(&Effect::StopRecognizer { id }));
        assert!(effects.contains(&Effect::OpenRemote { id: session }));

        let (connected, effects) = reduce(&config, &connecting, Event::RemoteOpened { id: session });
        let Phase::Connected { capture, .. } = connected.phase else {
            panic!("expected connected");
        };
        assert!(effects.contains(&Effect::OpenCapture {
            id: capture,
            route: CaptureRoute::Remote { session }
        }));
    }

    #[test]
    fn toggle_off_while_connecting_releases_late_session() {
        let config = remote();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let (connecting, _) = reduce(&config, &on, heard(id, "jarvis"));
        let Phase::Connecting { session } = connecting.phase else {
            panic!("expected connecting");
        };

        let (off, effects) = reduce(&config, &connecting, Event::Toggle);
        assert_eq!(off.phase, Phase::Disconnected);
        assert!(effects.contains(&Effect::CloseRemote { id: session }));

        let (still_off, effects) = reduce(&config, &off, Event::RemoteOpened { id: session });
        assert_eq!(still_off.phase, Phase::Disconnected);
        assert_eq!(effects, vec![Effect::CloseRemote { id: session }]);
    }

    #[test]
    fn late_capture_is_closed() {
        let config = remote();
        let (session, _, capture) = connected(&config);
        let (off, _) = reduce(&config, &session, Event::Toggle);
        let (_, effects) = reduce(&config, &off, Event::CaptureOpened { id: capture });
        assert_eq!(effects, vec![Effect::CloseCapture { id: capture }]);
    }

    #[test]
    fn remote_audio_and_transcripts() {
        let config = remote();
        let (connected, session, _) = connected(&config);

        let chunk = AudioChunk::silence(0.1, 24_000);
        let (_, effects) = reduce(
            &config,
            &connected,
            Event::RemoteAudio {
                id: session,
                chunk: chunk.clone(),
            },
        );
        assert_eq!(effects, vec![Effect::PlayChunk { session, chunk }]);

        let (_, effects) = reduce(
            &config,
            &connected,
            Event::RemoteInputTranscript {
                id: session,
                text: "what time".into(),
            },
        );
        assert_eq!(
            effects,
            vec![Effect::Transcript(TranscriptOp::UpsertInProgress {
                sender: Sender::User,
                text: "what time".into()
            })]
        );

        let (_, effects) = reduce(&config, &connected, Event::RemoteInputComplete { id: session });
        assert_eq!(
            effects,
            vec![Effect::Transcript(TranscriptOp::Finalize {
                sender: Sender::User
            })]
        );

        // The reply closes on its own; a user transcript still streaming stays open
        let (_, effects) = reduce(&config, &connected, Event::RemoteTurnComplete { id: session });
        assert_eq!(
            effects,
            vec![Effect::Transcript(TranscriptOp::Finalize {
                sender: Sender::Assistant
            })]
        );
    }

    #[test]
    fn stop_speaking_in_remote_session_stops_playback_only() {
        let config = remote();
        let (connected, session, _) = connected(&config);
        let (next, effects) = reduce(&config, &connected, Event::StopSpeaking);
        assert_eq!(next, connected);
        assert_eq!(effects, vec![Effect::StopPlayback { session }]);
    }

    #[test]
    fn remote_error_tears_down_into_error() {
        let config = remote();
        let (connected, session, capture) = connected(&config);
        let (next, effects) = reduce(
            &config,
            &connected,
            Event::RemoteError {
                id: session,
                error: RemoteError::Protocol("server_error".into()),
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Error);
        assert!(effects.contains(&Effect::CloseCapture { id: capture }));
        assert!(effects.contains(&Effect::CloseRemote { id: session }));
        assert!(effects.contains(&Effect::StopPlayback { session }));
    }

    #[test]
    fn remote_close_is_graceful() {
        let config = remote();
        let (connected, session, _) = connected(&config);
        let (next, effects) = reduce(&config, &connected, Event::RemoteClosed { id: session });
        assert_eq!(next.phase, Phase::Disconnected);
        assert!(effects.contains(&Effect::PlayCue(Cue::Disconnect)));
    }

    #[test]
    fn missing_api_key_is_fatal() {
        let config = remote();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let (connecting, _) = reduce(&config, &on, heard(id, "jarvis"));
        let Phase::Connecting { session } = connecting.phase else {
            panic!("expected connecting");
        };

        let (next, _) = reduce(
            &config,
            &connecting,
            Event::RemoteFailed {
                id: session,
                error: RemoteError::MissingApiKey,
            },
        );
        assert_eq!(next.connection_state(), ConnectionState::Error);
        assert!(next.error_message().unwrap().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn remote_wake_loop_only_restarts_while_waiting() {
        let config = remote();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let (connecting, _) = reduce(&config, &on, heard(id, "jarvis"));

        // The stopped wake-word recognizer reports its end after the transition
        let (same, effects) = reduce(&config, &connecting, Event::RecognizerEnded { id });
        assert_eq!(same, connecting);
        assert!(effects.is_empty());
    }

    #[test]
    fn generations_increase_monotonically() {
        let config = offline();
        let mut session = Session::new();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let (on, effects) = reduce(&config, &session, Event::Toggle);
            for e in &effects {
                if let Effect::StartRecognizer { id, .. } = e {
                    seen.push(*id);
                }
            }
            let (off, _) = reduce(&config, &on, Event::Toggle);
            session = off;
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exit_tears_down_without_cue() {
        let config = offline();
        let (on, _) = run(&config, vec![Event::Toggle]);
        let id = active_listener(&on);
        let (off, effects) = reduce(&config, &on, Event::Exit);
        assert_eq!(off.phase, Phase::Disconnected);
        assert!(effects.contains(&Effect::StopRecognizer { id }));
        assert!(!effects.contains(&Effect::PlayCue(Cue::Disconnect)));
    }
}
