//! Whisper transcription over HTTP.

use super::Transcriber;
use crate::config::TranscriptionSection;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};
use voicepty_core::{VoiceError, VoiceResult};

/// Successful response body. Only `text` is used.
#[derive(Debug, Deserialize)]
struct WhisperResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Client for `POST /v1/audio/transcriptions`.
pub struct WhisperClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    language: String,
    response_format: String,
}

impl WhisperClient {
    /// Build a client from the transcription settings. Fails when no API
    /// key is configured.
    pub fn new(settings: &TranscriptionSection) -> VoiceResult<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::Config("transcription API key not configured".into()))?;

        let http = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| VoiceError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: settings.endpoint.clone(),
            api_key,
            model: settings.model.clone(),
            language: settings.language.clone(),
            response_format: settings.response_format.clone(),
        })
    }

    async fn request(&self, wav: Vec<u8>) -> VoiceResult<String> {
        let size = wav.len();
        let file = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::TranscriptionFailed(e.to_string()))?;

        let form = Form::new()
            .part("file", file)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", self.response_format.clone());

        debug!(bytes = size, endpoint = %self.endpoint, "submitting audio for transcription");

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::TranscriptionFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|r| r.error.message)
                .unwrap_or(body);
            warn!(status = status.as_u16(), %message, "transcription API error");
            return Err(VoiceError::TranscriptionFailed(format!(
                "API error ({}): {message}",
                status.as_u16()
            )));
        }

        let parsed: WhisperResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::TranscriptionFailed(format!("bad response: {e}")))?;
        debug!(chars = parsed.text.len(), "transcription succeeded");
        Ok(parsed.text)
    }
}

impl Transcriber for WhisperClient {
    fn transcribe<'a>(
        &'a self,
        wav: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = VoiceResult<String>> + Send + 'a>> {
        Box::pin(self.request(wav))
    }
}
