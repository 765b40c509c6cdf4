//! Transcript Aggregator
//!
//! An append-only, insertion-ordered log of dialogue turns. Entries are never
//! edited once appended; [`Transcript::clear`] is the only way to shorten it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Who produced a transcript turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for TranscriptRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptRole::User => write!(f, "user"),
            TranscriptRole::Assistant => write!(f, "assistant"),
            TranscriptRole::System => write!(f, "system"),
        }
    }
}

/// Identifier of a transcript entry. Strictly increasing for the lifetime of
/// a [`Transcript`], including across clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub role: TranscriptRole,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Entries sit behind an [`Arc`] so views can be handed out without copying;
/// the first append after a view was taken copies the log once.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Arc<Vec<TranscriptEntry>>,
    next_id: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a turn and returns its id.
    pub fn append(&mut self, role: TranscriptRole, text: impl Into<String>) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        Arc::make_mut(&mut self.entries).push(TranscriptEntry {
            id,
            role,
            text: text.into(),
            created_at: Utc::now(),
        });
        id
    }

    /// Empties the log. Ids keep counting from where they were.
    pub fn clear(&mut self) {
        self.entries = Arc::default();
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// A cheap, immutable view of the current entries.
    pub fn view(&self) -> Arc<Vec<TranscriptEntry>> {
        Arc::clone(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
