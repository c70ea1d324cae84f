//! Voice command dispatch into the shared session.

use crate::session::SessionManager;
use std::sync::Arc;
use tracing::{info, warn};
use voicepty_core::{Resolved, VoiceCommandTable, VoiceResult};

/// Turns transcribed phrases into session input.
pub struct CommandDispatcher {
    sessions: Arc<SessionManager>,
    table: VoiceCommandTable,
}

impl CommandDispatcher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            table: VoiceCommandTable::default(),
        }
    }

    /// Resolve `text` and write it to whatever session is live.
    ///
    /// Known phrases become their keystroke sequence; anything else is
    /// wrapped verbatim in an instruction. Returns the generation written to.
    pub async fn execute(&self, text: &str) -> VoiceResult<u64> {
        let resolved = self.table.resolve(text);
        match &resolved {
            Resolved::Keystrokes { phrase, .. } => info!(%phrase, "voice command"),
            Resolved::Instruction(_) => info!(text, "voice instruction"),
        }

        self.sessions
            .write_current(resolved.as_bytes())
            .await
            .inspect_err(|e| warn!(error = %e, "failed to send voice command to session"))
    }
}
