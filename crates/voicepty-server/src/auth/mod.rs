//! Token check for WebSocket upgrades.
//!
//! The token comes from the `token` query parameter or from a
//! `Sec-WebSocket-Protocol: jwt-<token>` entry. Insecure mode skips the
//! signature check entirely.

use tokio_tungstenite::tungstenite::handshake::server::Request;
use tracing::debug;
use voicepty_core::token::DEFAULT_TOKEN_TTL_SECS;
use voicepty_core::{VoiceError, VoiceResult};

/// Subprotocol prefix browsers use to smuggle the token.
const PROTOCOL_PREFIX: &str = "jwt-";

/// Token returned by `issue` when auth is disabled.
pub const INSECURE_TOKEN: &str = "insecure-mode";

/// Where a request's token was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Query(String),
    /// The full `jwt-...` protocol entry, echoed back on the response.
    Protocol(String),
}

impl TokenSource {
    fn token(&self) -> &str {
        match self {
            TokenSource::Query(t) => t,
            TokenSource::Protocol(p) => &p[PROTOCOL_PREFIX.len()..],
        }
    }
}

/// Validates upgrade requests against the signing secret.
#[derive(Clone)]
pub struct Authenticator {
    secret: Vec<u8>,
    insecure: bool,
}

impl Authenticator {
    pub fn new(secret: impl Into<Vec<u8>>, insecure: bool) -> Self {
        Self {
            secret: secret.into(),
            insecure,
        }
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Check the request. On success returns the subprotocol to echo, if
    /// the client offered one.
    pub fn authorize(&self, req: &Request) -> VoiceResult<Option<String>> {
        let source = extract_token(req);
        let protocol = match &source {
            Some(TokenSource::Protocol(p)) => Some(p.clone()),
            _ => None,
        };

        if self.insecure {
            return Ok(protocol);
        }

        let source = source.ok_or_else(|| VoiceError::Token("missing JWT token".into()))?;
        voicepty_core::verify_token(&self.secret, source.token()).map_err(|e| {
            debug!(error = %e, "token rejected");
            VoiceError::Token("invalid JWT token".into())
        })?;
        Ok(protocol)
    }

    /// Issue a token for a browser client.
    pub fn issue(&self) -> String {
        if self.insecure {
            return INSECURE_TOKEN.to_string();
        }
        voicepty_core::create_token(&self.secret, DEFAULT_TOKEN_TTL_SECS)
    }
}

/// Find the token: query parameter first, then the subprotocol header.
pub fn extract_token(req: &Request) -> Option<TokenSource> {
    let from_query = req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    });
    if let Some(token) = from_query {
        return Some(TokenSource::Query(token));
    }

    req.headers()
        .get_all("sec-websocket-protocol")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|p| p.len() > PROTOCOL_PREFIX.len() && p.starts_with(PROTOCOL_PREFIX))
        .map(|p| TokenSource::Protocol(p.to_string()))
}
