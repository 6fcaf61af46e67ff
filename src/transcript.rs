//! Conversation transcript
//!
//! Finalized utterances are kept in the order they became permanent. While a
//! remote session streams partial text, each sender owns at most one
//! in-progress item under a reserved id; those items always trail the
//! finalized ones and are replaced in place until `finalize()` gives them a
//! fresh id.

use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

/// Reserved id of the user's in-progress item
pub const CURRENT_USER_ID: &str = "current-user";

/// Reserved id of the assistant's in-progress item
pub const CURRENT_ASSISTANT_ID: &str = "current-assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    fn in_progress_id(self) -> &'static str {
        match self {
            Sender::User => CURRENT_USER_ID,
            Sender::Assistant => CURRENT_ASSISTANT_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptItem {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub is_complete: bool,
    pub timestamp: DateTime<Local>,
}

impl TranscriptItem {
    /// A finished utterance with a fresh permanent id
    pub fn complete(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            text: text.into(),
            is_complete: true,
            timestamp: Local::now(),
        }
    }

    fn in_progress(sender: Sender, text: String) -> Self {
        Self {
            id: sender.in_progress_id().to_string(),
            sender,
            text,
            is_complete: false,
            timestamp: Local::now(),
        }
    }
}

/// Mutation requested by the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptOp {
    Append { sender: Sender, text: String },
    UpsertInProgress { sender: Sender, text: String },
    Finalize { sender: Sender },
}

#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    items: Vec<TranscriptItem>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[TranscriptItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn apply(&mut self, op: TranscriptOp) {
        match op {
            TranscriptOp::Append { sender, text } => {
                self.append(TranscriptItem::complete(sender, text))
            }
            TranscriptOp::UpsertInProgress { sender, text } => {
                self.upsert_in_progress(sender, text)
            }
            TranscriptOp::Finalize { sender } => self.finalize(sender),
        }
    }

    /// Add a finished item after every finalized item
    pub fn append(&mut self, item: TranscriptItem) {
        let at = self.first_in_progress();
        self.items.insert(at, item);
    }

    /// Replace the sender's in-progress text, creating the slot if needed
    pub fn upsert_in_progress(&mut self, sender: Sender, text: impl Into<String>) {
        let text = text.into();
        match self.in_progress_index(sender) {
            Some(idx) => self.items[idx].text = text,
            None => self.items.push(TranscriptItem::in_progress(sender, text)),
        }
    }

    /// Make the sender's in-progress item permanent. No-op without one.
    pub fn finalize(&mut self, sender: Sender) {
        let Some(idx) = self.in_progress_index(sender) else {
            return;
        };
        let mut item = self.items.remove(idx);
        item.id = Uuid::new_v4().to_string();
        item.is_complete = true;
        item.timestamp = Local::now();
        self.append(item);
    }

    pub fn in_progress(&self, sender: Sender) -> Option<&TranscriptItem> {
        self.in_progress_index(sender).map(|idx| &self.items[idx])
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    fn in_progress_index(&self, sender: Sender) -> Option<usize> {
        self.items
            .iter()
            .position(|item| !item.is_complete && item.sender == sender)
    }

    fn first_in_progress(&self) -> usize {
        self.items
            .iter()
            .position(|item| !item.is_complete)
            .unwrap_or(self.items.len())
    }
}
