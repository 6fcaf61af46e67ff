//! Wake word matching on recognized text
//!
//! Detection is a plain case-folded substring match. Whatever follows the
//! trigger phrase is the command; when nothing follows, whatever preceded it
//! (minus a leading salutation) is used instead.

/// Salutations that commonly precede the trigger phrase and carry no command
const SALUTATIONS: &[&str] = &["hey", "hi", "hello", "ok", "okay", "yo"];

/// Outcome of checking one transcript for the wake word
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeMatch {
    /// Trigger phrase absent
    Absent,
    /// Trigger phrase alone ("Jarvis?")
    Bare,
    /// Trigger phrase with a trailing (or leading) command
    Command(String),
}

#[derive(Debug, Clone)]
pub struct WakeWord {
    phrase: String,
}

impl WakeWord {
    pub fn new(phrase: &str) -> Self {
        let phrase = phrase.trim().to_lowercase();
        log::debug!("Wake word configured: {:?}", phrase);
        Self { phrase }
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn detect(&self, transcript: &str) -> WakeMatch {
        if self.phrase.is_empty() {
            return WakeMatch::Absent;
        }

        let lower = transcript.to_lowercase();
        let Some(at) = lower.find(&self.phrase) else {
            return WakeMatch::Absent;
        };

        let after = clean(&lower[at + self.phrase.len()..]);
        if !after.is_empty() {
            return WakeMatch::Command(after.to_string());
        }

        let before = strip_salutation(clean(&lower[..at]));
        if before.is_empty() {
            WakeMatch::Bare
        } else {
            WakeMatch::Command(before.to_string())
        }
    }
}

fn clean(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | ':' | ';'))
}

fn strip_salutation(s: &str) -> &str {
    for word in SALUTATIONS {
        if let Some(rest) = s.strip_prefix(word) {
            if rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == ',') {
                return clean(rest);
            }
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jarvis() -> WakeWord {
        WakeWord::new("Jarvis")
    }

    #[test]
    fn case_insensitive_substring_match() {
        assert_eq!(
            jarvis().detect("Hey JARVIS please"),
            WakeMatch::Command("please".into())
        );
        assert_eq!(
            jarvis().detect("jarvis please"),
            WakeMatch::Command("please".into())
        );
    }

    #[test]
    fn trailing_command_is_payload() {
        assert_eq!(
            jarvis().detect("Jarvis, what time is it?"),
            WakeMatch::Command("what time is it?".into())
        );
    }

    #[test]
    fn bare_wake_word() {
        assert_eq!(jarvis().detect("Jarvis"), WakeMatch::Bare);
        assert_eq!(jarvis().detect("hey jarvis."), WakeMatch::Bare);
        assert_eq!(jarvis().detect("  JARVIS!  "), WakeMatch::Bare);
    }

    #[test]
    fn leading_command_is_used_when_nothing_follows() {
        assert_eq!(
            jarvis().detect("what is the date jarvis"),
            WakeMatch::Command("what is the date".into())
        );
    }

    #[test]
    fn absent_wake_word() {
        assert_eq!(jarvis().detect("what time is it"), WakeMatch::Absent);
        assert_eq!(jarvis().detect(""), WakeMatch::Absent);
    }

    #[test]
    fn multi_word_phrase() {
        let wake = WakeWord::new("Hey Orin");
        assert_eq!(
            wake.detect("hey orin open youtube"),
            WakeMatch::Command("open youtube".into())
        );
        assert_eq!(wake.detect("orin"), WakeMatch::Absent);
    }

    #[test]
    fn empty_phrase_never_matches() {
        assert_eq!(WakeWord::new("  ").detect("anything"), WakeMatch::Absent);
    }
}
