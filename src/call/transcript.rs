//! # Call Transcript
//!
//! Append-only list of turns. Timestamps never go backwards: a turn stamped
//! earlier than its predecessor (clock skew between the adapters) is clamped
//! to the previous timestamp so consumers can rely on ordering.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Speaker {
    Caller,
    Assistant,
    HumanAgent,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Caller => "caller",
            Speaker::Assistant => "assistant",
            Speaker::HumanAgent => "human-agent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Filler utterances the speech model reports for background noise.
const NOISE_PATTERNS: &[&str] = &[
    "thank you", "thanks", "bye", "okay", "ok", "yeah", "yes", "no", "um", "uh", "hmm", "mhm",
    "ah",
];
const MIN_TRANSCRIPT_LENGTH: usize = 3;
const MAX_NOISE_LENGTH: usize = 15;

/// Whether a transcript is worth recording.
///
/// Anything shorter than three characters is dropped. Short caller utterances
/// that are just a filler word are dropped too; assistant and operator text
/// is always kept.
pub fn is_meaningful(speaker: Speaker, text: &str) -> bool {
    let cleaned = text.trim().to_lowercase();
    if cleaned.chars().count() < MIN_TRANSCRIPT_LENGTH {
        return false;
    }
    if speaker != Speaker::Caller || cleaned.chars().count() > MAX_NOISE_LENGTH {
        return true;
    }

    !NOISE_PATTERNS.iter().any(|pattern| {
        cleaned == *pattern
            || cleaned.starts_with(&format!("{} ", pattern))
            || cleaned.ends_with(&format!(" {}", pattern))
    })
}

#[derive(Debug, Default)]
pub struct Transcript {
    turns: RwLock<Vec<TranscriptTurn>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn stamped now (clamped to stay monotonic).
    pub fn append(&self, speaker: Speaker, text: impl Into<String>) -> TranscriptTurn {
        self.append_at(speaker, text, Utc::now())
    }

    pub fn append_at(
        &self,
        speaker: Speaker,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> TranscriptTurn {
        let mut turns = self.turns.write();
        let timestamp = match turns.last() {
            Some(last) if last.timestamp > timestamp => last.timestamp,
            _ => timestamp,
        };
        let turn = TranscriptTurn {
            speaker,
            text: text.into(),
            timestamp,
        };
        turns.push(turn.clone());
        turn
    }

    pub fn snapshot(&self) -> Vec<TranscriptTurn> {
        self.turns.read().clone()
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }
}
