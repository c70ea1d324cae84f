//! HS256 signed tokens for the WebSocket endpoints.
//!
//! JWT compact form: `base64url(header).base64url(claims).base64url(hmac)`,
//! no padding. Only `HS256` is accepted; claims are `iat` and `exp`.

use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

/// Default token lifetime (24 hours).
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

/// Token claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: u64,
    pub exp: u64,
}

/// Issue a token valid for `ttl_secs` from now.
pub fn create_token(secret: &[u8], ttl_secs: u64) -> String {
    create_token_at(secret, unix_now(), ttl_secs)
}

fn create_token_at(secret: &[u8], iat: u64, ttl_secs: u64) -> String {
    let header = Header {
        alg: "HS256".into(),
        typ: Some("JWT".into()),
    };
    let claims = Claims {
        iat,
        exp: iat + ttl_secs,
    };
    // Serializing these two plain structs cannot fail.
    let header_json = serde_json::to_vec(&header).unwrap_or_default();
    let claims_json = serde_json::to_vec(&claims).unwrap_or_default();

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, signing_input.as_bytes());
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref()))
}

/// Verify signature, algorithm and expiry. Returns the claims on success.
pub fn verify_token(secret: &[u8], token: &str) -> VoiceResult<Claims> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) if parts.next().is_none() => (h, c, s),
        _ => return Err(VoiceError::Token("malformed token".into())),
    };

    let header: Header = decode_segment(header_b64)?;
    if header.alg != "HS256" {
        return Err(VoiceError::Token(format!(
            "unexpected signing method: {}",
            header.alg
        )));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| VoiceError::Token("invalid signature encoding".into()))?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
    hmac::verify(&key, signing_input.as_bytes(), &signature)
        .map_err(|_| VoiceError::Token("invalid token signature".into()))?;

    let claims: Claims = decode_segment(claims_b64)?;
    if unix_now() > claims.exp {
        return Err(VoiceError::Token("token expired".into()));
    }
    Ok(claims)
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> VoiceResult<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| VoiceError::Token("invalid base64 segment".into()))?;
    serde_json::from_slice(&bytes).map_err(|e| VoiceError::Token(format!("invalid segment: {e}")))
}

/// Generate a random signing secret (32 bytes, hex-encoded).
pub fn generate_secret() -> VoiceResult<String> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = [0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| VoiceError::Other("RNG failure".into()))?;
    Ok(hex::encode(secret))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let token = create_token(secret.as_bytes(), 3600);
        assert_eq!(token.split('.').count(), 3);
        let claims = verify_token(secret.as_bytes(), &token).unwrap();
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn wrong_secret() {
        let token = create_token(b"secret-one", 3600);
        assert!(verify_token(b"secret-two", &token).is_err());
    }

    #[test]
    fn expired_token() {
        let token = create_token_at(b"secret", 1_000, 60);
        match verify_token(b"secret", &token) {
            Err(VoiceError::Token(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected expiry error, got {other:?}"),
        }
    }

    #[test]
    fn tampered_claims() {
        let token = create_token(b"secret", 60);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"iat":0,"exp":99999999999}"#);
        parts[1] = &forged;
        assert!(verify_token(b"secret", &parts.join(".")).is_err());
    }

    #[test]
    fn rejects_other_algorithms() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let claims = URL_SAFE_NO_PAD.encode(br#"{"iat":0,"exp":99999999999}"#);
        let token = format!("{header}.{claims}.");
        assert!(verify_token(b"secret", &token).is_err());
    }

    #[test]
    fn malformed() {
        assert!(verify_token(b"secret", "").is_err());
        assert!(verify_token(b"secret", "a.b").is_err());
        assert!(verify_token(b"secret", "a.b.c.d").is_err());
    }

    #[test]
    fn secret_is_hex() {
        let secret = generate_secret().unwrap();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
