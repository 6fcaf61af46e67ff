//! Offline command responder
//!
//! Table-driven keyword rules checked in priority order. The first matching
//! rule produces the reply; commands that would open something return an
//! `Intent` for the UI layer instead of acting.

use chrono::{DateTime, Local};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

const FALLBACK_REPLIES: &[&str] = &[
    "I am limited to offline commands, sir.",
    "I didn't catch that. Could you repeat?",
    "My processing is local only. I cannot answer complex queries.",
];

/// Side effect requested by a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Intent {
    OpenUrl { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub text: String,
    pub intent: Option<Intent>,
}

impl Response {
    fn say(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: None,
        }
    }

    fn open(text: impl Into<String>, url: String) -> Self {
        Self {
            text: text.into(),
            intent: Some(Intent::OpenUrl { url }),
        }
    }
}

pub struct Responder {
    rng: StdRng,
}

impl Responder {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn respond(&mut self, command: &str) -> Response {
        self.respond_at(command, Local::now())
    }

    /// `respond` with an explicit clock
    pub fn respond_at(&mut self, command: &str, now: DateTime<Local>) -> Response {
        let lower = command.to_lowercase();

        let response = if lower.contains("time") {
            Response::say(format!("It is currently {}.", now.format("%-I:%M:%S %p")))
        } else if lower.contains("date") || lower.contains("day") {
            Response::say(format!("Today is {}.", now.format("%A, %B %-d")))
        } else if lower.contains("who are you") || lower.contains("identify") {
            Response::say(
                "I am Jarvis. An offline assistant running on your local machine.",
            )
        } else if has_word(&lower, "hello") || has_word(&lower, "hi") {
            Response::say("Greetings. All systems are nominal.")
        } else if let Some(query) = search_query(&lower) {
            let url = format!(
                "https://www.google.com/search?q={}",
                urlencoding::encode(&query)
            );
            Response::open(format!("Searching the web for {}.", query), url)
        } else if lower.contains("open youtube") {
            Response::open("Opening YouTube.", "https://www.youtube.com".to_string())
        } else if lower.contains("stop") || lower.contains("cancel") {
            Response::say("Cancelling.")
        } else {
            let reply = FALLBACK_REPLIES
                .choose(&mut self.rng)
                .copied()
                .unwrap_or(FALLBACK_REPLIES[0]);
            Response::say(reply)
        };

        log::debug!("Responder: {:?} -> {:?}", command, response.text);
        response
    }
}

fn has_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .any(|w| w == word)
}

fn search_query(lower: &str) -> Option<String> {
    let (_, rest) = lower.split_once("search for")?;
    let query = rest
        .trim()
        .trim_end_matches(|c: char| matches!(c, '.' | '?' | '!'))
        .trim();
    if query.is_empty() {
        None
    } else {
        Some(query.to_string())
    }
}
