//! Speech-to-text for the audio channel.
//!
//! [`Transcriber`] is the seam to the external service; [`WhisperClient`]
//! speaks the OpenAI-compatible multipart API. [`TranscriptionPipeline`]
//! turns one raw PCM chunk into a client event and, when there is text, a
//! dispatched command.

pub mod client;
pub mod pipeline;

pub use client::WhisperClient;
pub use pipeline::TranscriptionPipeline;

use std::future::Future;
use std::pin::Pin;
use voicepty_core::VoiceResult;

/// Something that turns a WAV container into text.
pub trait Transcriber: Send + Sync {
    /// Transcribe one complete WAV file.
    fn transcribe<'a>(
        &'a self,
        wav: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = VoiceResult<String>> + Send + 'a>>;
}
