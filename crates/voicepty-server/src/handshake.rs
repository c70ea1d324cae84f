//! WebSocket upgrade decision.
//!
//! Runs inside tungstenite's handshake callback: picks the channel from the
//! request path, checks the token, and either completes the upgrade
//! (echoing the `jwt-` subprotocol when one was offered) or answers with a
//! plain HTTP error.

use crate::auth::Authenticator;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tracing::{debug, warn};

pub const TERMINAL_PATH: &str = "/ws/pty";
pub const AUDIO_PATH: &str = "/ws/audio";

/// Which kind of connection an upgrade produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Terminal,
    Audio,
}

impl ChannelKind {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            TERMINAL_PATH => Some(ChannelKind::Terminal),
            AUDIO_PATH => Some(ChannelKind::Audio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Terminal => "terminal",
            ChannelKind::Audio => "audio",
        }
    }
}

/// Decide whether to accept an upgrade request.
pub fn accept_upgrade(
    req: &Request,
    mut response: Response,
    auth: &Authenticator,
    audio_enabled: bool,
) -> Result<(ChannelKind, Response), ErrorResponse> {
    let path = req.uri().path();
    let kind = ChannelKind::from_path(path).ok_or_else(|| {
        debug!(path, "upgrade for unknown path");
        error_response(StatusCode::NOT_FOUND, "Not Found")
    })?;

    let protocol = auth.authorize(req).map_err(|e| {
        warn!(path, error = %e, "unauthorized upgrade");
        error_response(StatusCode::UNAUTHORIZED, "Unauthorized")
    })?;

    if kind == ChannelKind::Audio && !audio_enabled {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Transcription API key not configured",
        ));
    }

    if let Some(protocol) = protocol {
        if let Ok(value) = HeaderValue::from_str(&protocol) {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
    }
    Ok((kind, response))
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}
