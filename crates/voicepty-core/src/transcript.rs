//! Audio-channel wire type: `{"text", "type", "is_final"}`.

use serde::{Deserialize, Serialize};

/// Kind tag carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Partial,
    Final,
    Error,
}

/// Result of one audio-chunk transcription attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: TranscriptKind,
    pub is_final: bool,
}

impl TranscriptEvent {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: TranscriptKind::Final,
            is_final: true,
        }
    }

    /// Error events carry no text.
    pub fn error() -> Self {
        Self {
            text: String::new(),
            kind: TranscriptKind::Error,
            is_final: false,
        }
    }

    /// Whether this event should be handed to the command dispatcher.
    pub fn is_dispatchable(&self) -> bool {
        self.is_final && self.kind == TranscriptKind::Final && !self.text.is_empty()
    }
}
