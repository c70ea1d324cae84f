//! voicepty-server: voice-driven terminal bridge.
//!
//! Serves one PTY-backed CLI session to browser terminals over WebSocket and
//! turns streamed microphone audio into commands typed into that session.

mod auth;
mod config;
mod dispatch;
mod handshake;
mod relay;
mod server;
mod session;
mod transcription;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::VoiceServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// voicepty-server: voice-driven terminal bridge
#[derive(Parser, Debug)]
#[command(name = "voicepty-server", version, about = "Voice-driven terminal bridge")]
struct Cli {
    /// Listen address (`host:port` or `:port`)
    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long, env = "TLS_CERT")]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long, env = "TLS_KEY")]
    key: Option<String>,

    /// Signing secret for access tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Serve plain WebSocket without TLS and skip token checks
    #[arg(long, env = "INSECURE", value_parser = clap::builder::FalseyValueParser::new())]
    insecure: bool,

    /// API key for the transcription service
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.voicepty/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Print an access token for browser clients and exit
    #[arg(long)]
    issue_token: bool,

    /// Run the startup checks, print them as JSON and exit
    #[arg(long)]
    check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting voicepty-server");

    let (cert, key) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c.display().to_string()), Some(k.display().to_string()))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = Overrides {
        addr: cli.addr.clone(),
        cert,
        key,
        insecure: cli.insecure,
        jwt_secret: cli.jwt_secret.clone(),
        api_key: cli.openai_api_key.clone(),
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if server_config.ephemeral_secret && !server_config.insecure {
        warn!("no jwt_secret configured, generated one for this run; issued tokens will not survive a restart");
    }

    let tls_acceptor = if server_config.insecure || cli.issue_token || cli.check {
        None
    } else {
        match load_tls_config(&server_config.cert_path, &server_config.key_path) {
            Ok(cfg) => Some(TlsAcceptor::from(Arc::new(cfg))),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        }
    };

    let voice_server = match VoiceServer::new(server_config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    if cli.issue_token {
        println!("{}", voice_server.authenticator().issue());
        return;
    }

    let health = voice_server.health().await;
    if cli.check {
        match serde_json::to_string_pretty(&health) {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "failed to encode health report"),
        }
        std::process::exit(if health.is_ready() { 0 } else { 1 });
    }

    info!(
        program = %health.backend.program,
        cli_available = health.backend.cli_available,
        backend_running = health.backend.backend_running,
        transcription = health.transcription_configured,
        "startup checks"
    );
    if tls_acceptor.is_none() {
        warn!("running in insecure mode without TLS");
    }

    let listener = match voice_server.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let accept_loop = tokio::spawn(voice_server.clone().run(listener, tls_acceptor, shutdown.clone()));

    shutdown_signal().await;
    info!("received shutdown signal");
    shutdown.cancel();
    if let Err(e) = accept_loop.await {
        warn!(error = %e, "accept loop ended abnormally");
    }

    match voice_server.sessions().shutdown().await {
        Some(done) => match done.await {
            Ok(outcome) => info!(?outcome, "session terminated"),
            Err(e) => warn!(error = %e, "session shutdown task failed"),
        },
        None => info!("no live session to terminate"),
    }

    info!("voicepty-server stopped");
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let mut tls_config =
        rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

    // WebSocket upgrades ride on HTTP/1.1.
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".voicepty");
    std::fs::create_dir_all(&dir)?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "voicepty-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
