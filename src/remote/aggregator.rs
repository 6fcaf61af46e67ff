//! Per-turn transcript aggregation
//!
//! The realtime API streams both sides of the conversation as deltas and
//! then, usually, an authoritative completed transcript. Deltas append;
//! a completed transcript replaces whatever was accumulated.

#[derive(Debug, Clone, Default)]
pub struct StreamingText {
    partial: String,
    completed: Option<String>,
    delta_count: u64,
}

impl StreamingText {
    /// Append a delta and return the best text so far
    pub fn delta(&mut self, delta: &str) -> &str {
        if !delta.is_empty() {
            self.partial.push_str(delta);
            self.delta_count += 1;
            if self.delta_count % 10 == 0 {
                log::debug!(
                    "StreamingText: {} deltas, {} chars accumulated",
                    self.delta_count,
                    self.partial.len()
                );
            }
        }
        self.current()
    }

    /// Replace accumulated text with the authoritative transcript
    pub fn complete(&mut self, transcript: &str) -> &str {
        log::debug!(
            "StreamingText: completed with {} chars (had {} deltas)",
            transcript.len(),
            self.delta_count
        );
        self.completed = Some(transcript.trim().to_string());
        self.current()
    }

    pub fn current(&self) -> &str {
        self.completed.as_deref().unwrap_or(&self.partial)
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    pub fn reset(&mut self) {
        self.partial.clear();
        self.completed = None;
        self.delta_count = 0;
    }
}

/// The user's utterance and the assistant's reply currently being streamed
///
/// The two sides close independently: the user's transcription can complete
/// before, during or after the reply it prompted.
#[derive(Debug, Clone, Default)]
pub struct TurnAggregator {
    pub input: StreamingText,
    pub output: StreamingText,
}

impl TurnAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// End the user's utterance; true when it had any text
    pub fn close_input(&mut self) -> bool {
        let had_text = !self.input.is_empty();
        self.input.reset();
        had_text
    }

    /// End the assistant's reply
    pub fn close_output(&mut self) {
        self.output.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate() {
        let mut text = StreamingText::default();
        text.delta("It is");
        text.delta("");
        assert_eq!(text.delta(" noon."), "It is noon.");
    }

    #[test]
    fn completed_overrides_partial() {
        let mut text = StreamingText::default();
        text.delta("Helo");
        text.delta(" wrld");
        assert_eq!(text.complete(" Hello world "), "Hello world");

        // Late deltas don't disturb the authoritative text
        text.delta("!");
        assert_eq!(text.current(), "Hello world");
    }

    #[test]
    fn sides_close_independently() {
        let mut turn = TurnAggregator::new();
        turn.input.complete("what time is it");
        turn.output.delta("It is");

        turn.close_output();
        assert!(turn.output.is_empty());
        assert_eq!(turn.input.current(), "what time is it");

        assert!(turn.close_input());
        assert!(turn.input.is_empty());
        assert!(!turn.close_input());
    }

    #[test]
    fn closed_input_accepts_next_utterance_deltas() {
        let mut turn = TurnAggregator::new();
        turn.input.complete("first question");
        turn.close_input();
        assert_eq!(turn.input.delta("sec"), "sec");
    }
}
