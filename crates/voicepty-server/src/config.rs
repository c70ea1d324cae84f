//! Server configuration: TOML file + environment / CLI overrides.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use voicepty_core::wav::PcmFormat;
use voicepty_core::{VoiceError, VoiceResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub transcription: TranscriptionSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            cert: default_cert_path(),
            key: default_key_path(),
            insecure: false,
            jwt_secret: None,
        }
    }
}

/// `[session]` section: which CLI to run and how to babysit it.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Arguments for the backend liveness probe (`<program> <probe_args>`).
    #[serde(default = "default_probe_args")]
    pub probe_args: Vec<String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Recent output kept for terminals that attach later.
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    /// Shown when the program is not on PATH.
    #[serde(default = "default_install_hint")]
    pub install_hint: String,
    /// Shown when the probe fails.
    #[serde(default = "default_start_hint")]
    pub start_hint: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            probe_args: default_probe_args(),
            rows: default_rows(),
            cols: default_cols(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            scrollback_bytes: default_scrollback_bytes(),
            install_hint: default_install_hint(),
            start_hint: default_start_hint(),
        }
    }
}

impl SessionSection {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// `[transcription]` section: the speech-to-text HTTP API.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_response_format")]
    pub response_format: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_min_chunk_bytes")]
    pub min_chunk_bytes: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_bits_per_sample")]
    pub bits_per_sample: u16,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

impl Default for TranscriptionSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model: default_model(),
            language: default_language(),
            response_format: default_response_format(),
            timeout_secs: default_timeout_secs(),
            min_chunk_bytes: default_min_chunk_bytes(),
            sample_rate: default_sample_rate(),
            bits_per_sample: default_bits_per_sample(),
            channels: default_channels(),
        }
    }
}

impl TranscriptionSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::new(self.sample_rate, self.bits_per_sample, self.channels)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

fn default_addr() -> String {
    ":8000".to_string()
}
fn default_cert_path() -> String {
    "cert.pem".to_string()
}
fn default_key_path() -> String {
    "key.pem".to_string()
}
fn default_program() -> String {
    "plandex".to_string()
}
fn default_args() -> Vec<String> {
    vec!["repl".to_string()]
}
fn default_probe_args() -> Vec<String> {
    vec!["version".to_string()]
}
fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}
fn default_shutdown_grace_secs() -> u64 {
    3
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_scrollback_bytes() -> usize {
    64 * 1024
}
fn default_install_hint() -> String {
    "curl -sL https://plandex.ai/install.sh | bash".to_string()
}
fn default_start_hint() -> String {
    "plandex server start".to_string()
}
fn default_endpoint() -> String {
    "https://api.openai.com/v1/audio/transcriptions".to_string()
}
fn default_model() -> String {
    "whisper-1".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_response_format() -> String {
    "json".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_min_chunk_bytes() -> usize {
    1024
}
fn default_sample_rate() -> u32 {
    16_000
}
fn default_bits_per_sample() -> u16 {
    16
}
fn default_channels() -> u16 {
    1
}

/// Values coming from the command line (or its environment fallbacks).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub addr: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub insecure: bool,
    pub jwt_secret: Option<String>,
    pub api_key: Option<String>,
}

/// Resolved server configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub insecure: bool,
    pub jwt_secret: String,
    /// The secret was generated at boot, so tokens die with the process.
    pub ephemeral_secret: bool,
    pub session: SessionSection,
    pub transcription: TranscriptionSection,
}

impl ServerConfig {
    /// Load config from TOML file, then apply overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> VoiceResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| VoiceError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with overrides.
    pub fn resolve(file_config: ConfigFile, overrides: &Overrides) -> VoiceResult<Self> {
        let ConfigFile {
            server,
            session,
            mut transcription,
        } = file_config;

        let addr_str = overrides.addr.clone().unwrap_or(server.addr);
        let addr = parse_listen_addr(&addr_str)?;
        let cert_str = overrides.cert.clone().unwrap_or(server.cert);
        let key_str = overrides.key.clone().unwrap_or(server.key);
        let insecure = overrides.insecure || server.insecure;

        let (jwt_secret, ephemeral_secret) = match overrides.jwt_secret.clone().or(server.jwt_secret) {
            Some(secret) if !secret.is_empty() => (secret, false),
            _ => (voicepty_core::generate_secret()?, true),
        };

        if let Some(key) = overrides.api_key.clone().filter(|k| !k.is_empty()) {
            transcription.api_key = Some(key);
        }

        if session.program.trim().is_empty() {
            return Err(VoiceError::Config("session.program is empty".into()));
        }
        if session.rows == 0 || session.cols == 0 {
            return Err(VoiceError::Config("session size must be non-zero".into()));
        }
        transcription.pcm_format().validate()?;

        Ok(Self {
            addr,
            cert_path: expand_tilde_str(&cert_str),
            key_path: expand_tilde_str(&key_str),
            insecure,
            jwt_secret,
            ephemeral_secret,
            session,
            transcription,
        })
    }
}

/// Accept both `host:port` and the bare `:port` shorthand.
pub fn parse_listen_addr(s: &str) -> VoiceResult<SocketAddr> {
    let full = if s.starts_with(':') {
        format!("0.0.0.0{s}")
    } else {
        s.to_string()
    };
    full.parse()
        .map_err(|e| VoiceError::Config(format!("invalid listen address {s:?}: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
