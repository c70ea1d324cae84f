//! Spoken phrase → keystroke mapping.
//!
//! Recognized phrases map to literal control sequences; anything else is
//! wrapped verbatim into a `tell "..."` instruction for the CLI.

/// Built-in phrase table. Keys are already normalized (trimmed, lowercase).
const DEFAULT_COMMANDS: &[(&str, &str)] = &[
    ("stop", "\x03"),
    ("background", "b"),
    ("apply changes", ":apply\n"),
    ("apply", ":apply\n"),
    ("quit", ":quit\n"),
    ("help", ":help\n"),
];

/// What a transcript resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A table hit: the phrase and its literal sequence.
    Keystrokes {
        phrase: &'static str,
        sequence: &'static str,
    },
    /// Free text wrapped into a generic instruction.
    Instruction(String),
}

impl Resolved {
    /// Bytes to write into the session.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Resolved::Keystrokes { sequence, .. } => sequence.as_bytes(),
            Resolved::Instruction(s) => s.as_bytes(),
        }
    }
}

/// Immutable phrase table.
#[derive(Debug, Clone)]
pub struct VoiceCommandTable {
    entries: &'static [(&'static str, &'static str)],
}

impl Default for VoiceCommandTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_COMMANDS,
        }
    }
}

impl VoiceCommandTable {
    /// Look up a phrase after normalization.
    pub fn lookup(&self, text: &str) -> Option<(&'static str, &'static str)> {
        let normalized = normalize(text);
        self.entries
            .iter()
            .find(|(phrase, _)| *phrase == normalized)
            .copied()
    }

    /// Resolve a transcript to what should be typed into the session.
    pub fn resolve(&self, text: &str) -> Resolved {
        match self.lookup(text) {
            Some((phrase, sequence)) => Resolved::Keystrokes { phrase, sequence },
            None => Resolved::Instruction(instruction(text)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trim and lowercase.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Wrap free text into the CLI's generic instruction. The text is kept as-is.
pub fn instruction(text: &str) -> String {
    format!("tell \"{text}\"\n")
}
