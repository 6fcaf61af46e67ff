//! Silent synthesizer that paces each utterance by its estimated spoken length
//!
//! Used on hosts without a speech backend so the conversation loop still
//! advances; the reply itself is shown by the front end. The level it reports
//! is the synthetic speaking level, not a measurement.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SpeechHandle, SpeechSynthesizer, SynthesisEvent, VoicePreferences};
use crate::audio::level::synthetic_speaking_level;
use crate::error::SynthesisError;

/// Average speaking pace at rate 1.0
const WORDS_PER_SECOND: f64 = 2.5;

const MIN_DURATION: Duration = Duration::from_millis(600);

const LEVEL_INTERVAL: Duration = Duration::from_millis(50);

pub struct TimedSynthesizer {
    prefs: VoicePreferences,
    rng: Mutex<StdRng>,
}

impl TimedSynthesizer {
    pub fn new(prefs: VoicePreferences) -> Self {
        Self {
            prefs,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(prefs: VoicePreferences, seed: u64) -> Self {
        Self {
            prefs,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn estimate_duration(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count() as f64;
        let rate = if self.prefs.rate > 0.0 {
            self.prefs.rate as f64
        } else {
            1.0
        };
        Duration::from_secs_f64(words / (WORDS_PER_SECOND * rate)).max(MIN_DURATION)
    }

    fn child_rng(&self) -> StdRng {
        match self.rng.lock() {
            Ok(mut rng) => StdRng::from_rng(&mut *rng).unwrap_or_else(|_| StdRng::from_entropy()),
            Err(_) => StdRng::from_entropy(),
        }
    }
}

struct TimedUtterance {
    token: CancellationToken,
}

impl SpeechHandle for TimedUtterance {
    fn cancel(&mut self) {
        self.token.cancel();
    }
}

impl Drop for TimedUtterance {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl SpeechSynthesizer for TimedSynthesizer {
    fn speak(
        &self,
        text: &str,
        events: mpsc::UnboundedSender<SynthesisEvent>,
    ) -> Result<Box<dyn SpeechHandle>, SynthesisError> {
        let duration = self.estimate_duration(text);
        let mut rng = self.child_rng();
        let token = CancellationToken::new();
        let task_token = token.clone();

        log::debug!(
            "Speaking {:?} for {:?} (voice {:?}, pitch {})",
            text,
            duration,
            self.prefs.voice,
            self.prefs.pitch
        );

        tokio::spawn(async move {
            let _ = events.send(SynthesisEvent::Started);
            let done = tokio::time::sleep(duration);
            tokio::pin!(done);
            let mut ticker = tokio::time::interval(LEVEL_INTERVAL);

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = &mut done => {
                        let _ = events.send(SynthesisEvent::Ended);
                        return;
                    }
                    _ = ticker.tick() => {
                        let level = synthetic_speaking_level(&mut rng);
                        if events.send(SynthesisEvent::Level(level)).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::new(TimedUtterance { token }))
    }
}
