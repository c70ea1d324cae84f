//! voicepty-core: shared pieces for the voice-driven terminal bridge.
//!
//! Provides the error taxonomy, WAV framing for PCM audio, the spoken
//! command table, the transcript event wire type, and HS256 signed tokens.

pub mod commands;
pub mod error;
pub mod token;
pub mod transcript;
pub mod wav;

// Re-export commonly used items at crate root.
pub use commands::{Resolved, VoiceCommandTable};
pub use error::{VoiceError, VoiceResult};
pub use token::{create_token, generate_secret, verify_token, Claims};
pub use transcript::{TranscriptEvent, TranscriptKind};
pub use wav::{encode_pcm, PcmFormat};
