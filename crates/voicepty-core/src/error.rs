use thiserror::Error;

/// Errors produced by the terminal bridge and voice pipeline.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("{program} not found in PATH")]
    ExecutableNotFound { program: String },

    #[error("backend not running: {0}")]
    BackendNotRunning(String),

    #[error("failed to start session: {0}")]
    SpawnFailed(String),

    #[error("no live session")]
    NoSession,

    #[error("socket error: {0}")]
    Socket(String),

    #[error("audio chunk too small: {len} bytes (min {min})")]
    ChunkTooSmall { len: usize, min: usize },

    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Whether this error came out of session startup (and therefore deserves
    /// a terminal diagnostic rather than a log line only).
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            VoiceError::ExecutableNotFound { .. }
                | VoiceError::BackendNotRunning(_)
                | VoiceError::SpawnFailed(_)
        )
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(e: serde_json::Error) -> Self {
        VoiceError::Other(format!("json error: {e}"))
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
