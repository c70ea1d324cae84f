//! Core server: accepts connections and routes them to the terminal or audio
//! channel.
//!
//! Owns the authenticator, the shared session manager and, when an API key
//! is configured, the transcription pipeline.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::dispatch::CommandDispatcher;
use crate::handshake::{accept_upgrade, ChannelKind};
use crate::relay;
use crate::session::{BackendHealth, SessionManager};
use crate::transcription::{Transcriber, TranscriptionPipeline, WhisperClient};
use crate::transport::{ConnectionWriter, MAX_WS_MESSAGE_SIZE};
use futures_util::StreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voicepty_core::{VoiceError, VoiceResult};

/// What `--check` prints and what is logged at startup.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    #[serde(flatten)]
    pub backend: BackendHealth,
    pub transcription_configured: bool,
    pub insecure: bool,
}

impl HealthReport {
    /// Whether a terminal connection would get a session right now.
    pub fn is_ready(&self) -> bool {
        self.backend.cli_available && self.backend.backend_running
    }
}

/// The voicepty server instance.
pub struct VoiceServer {
    config: ServerConfig,
    auth: Authenticator,
    sessions: Arc<SessionManager>,
    /// `None` when transcription is not configured; the audio channel then
    /// answers 503.
    pipeline: Option<Arc<TranscriptionPipeline>>,
}

impl VoiceServer {
    /// Create a server, with Whisper transcription if an API key is set.
    pub fn new(config: ServerConfig) -> VoiceResult<Self> {
        let transcriber: Option<Arc<dyn Transcriber>> = if config.transcription.is_configured() {
            Some(Arc::new(WhisperClient::new(&config.transcription)?))
        } else {
            None
        };
        Ok(Self::with_transcriber(config, transcriber))
    }

    pub fn with_transcriber(config: ServerConfig, transcriber: Option<Arc<dyn Transcriber>>) -> Self {
        let sessions = Arc::new(SessionManager::new(config.session.clone()));
        let auth = Authenticator::new(config.jwt_secret.clone().into_bytes(), config.insecure);
        let pipeline = transcriber.map(|transcriber| {
            Arc::new(TranscriptionPipeline::new(
                transcriber,
                Arc::new(CommandDispatcher::new(sessions.clone())),
                config.transcription.pcm_format(),
                config.transcription.min_chunk_bytes,
            ))
        });

        Self {
            config,
            auth,
            sessions,
            pipeline,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    pub fn transcription_enabled(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Startup checks, without starting the session.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            backend: self.sessions.health().await,
            transcription_configured: self.transcription_enabled(),
            insecure: self.auth.is_insecure(),
        }
    }

    /// Bind the listening socket. Failure here is fatal to the process.
    pub async fn bind(&self) -> VoiceResult<TcpListener> {
        TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| VoiceError::Socket(format!("bind {} failed: {e}", self.config.addr)))
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>, shutdown: CancellationToken) {
        let local = listener.local_addr().ok();
        info!(
            addr = ?local,
            tls = tls.is_some(),
            insecure = self.auth.is_insecure(),
            transcription = self.transcription_enabled(),
            "voicepty-server ready"
        );

        loop {
            let (tcp, remote) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                        continue;
                    }
                },
            };

            let server = self.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(stream) => server.serve(stream, remote).await,
                        Err(e) => debug!(remote = %remote, error = %e, "TLS handshake failed"),
                    },
                    None => server.serve(tcp, remote).await,
                }
            });
        }

        info!("listener stopped");
    }

    /// Run the upgrade handshake and hand the socket to its channel.
    async fn serve<S>(self: Arc<Self>, stream: S, remote: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let audio_enabled = self.transcription_enabled();
        let mut channel = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let (kind, response) = accept_upgrade(req, response, &self.auth, audio_enabled)?;
            channel = Some(kind);
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config())).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(remote = %remote, error = %e, "WebSocket handshake failed");
                return;
            }
        };
        let Some(kind) = channel else {
            return;
        };

        info!(remote = %remote, channel = kind.as_str(), "WebSocket connection established");
        match kind {
            ChannelKind::Terminal => self.handle_terminal(ws).await,
            ChannelKind::Audio => self.handle_audio(ws).await,
        }
        debug!(remote = %remote, channel = kind.as_str(), "WebSocket connection finished");
    }

    /// Start (or reuse) the session and relay until either side goes away.
    async fn handle_terminal<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let writer = ConnectionWriter::new(sink);

        let handle = match self.sessions.ensure_live().await {
            Ok(_) => self.sessions.current_handle().await.ok_or(VoiceError::NoSession),
            Err(e) => Err(e),
        };
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                if e.is_startup() {
                    warn!(error = %e, "session failed to start");
                } else {
                    error!(error = %e, "session unavailable for terminal");
                }
                if let Err(e) = writer.send_text(self.sessions.diagnostic(&e)).await {
                    debug!(error = %e, "failed to send diagnostic");
                }
                writer.close().await;
                return;
            }
        };

        relay::run(stream, writer, self.sessions.clone(), handle).await;
    }

    /// Spawn one pipeline run per binary frame until the client goes away.
    async fn handle_audio<S>(&self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(pipeline) = self.pipeline.clone() else {
            return;
        };
        let (sink, mut stream) = ws.split();
        let writer = ConnectionWriter::new(sink);

        while let Some(next) = stream.next().await {
            match next {
                Ok(Message::Binary(chunk)) => {
                    pipeline.spawn_chunk(chunk, writer.clone());
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "audio WebSocket read error");
                    break;
                }
            }
        }
        info!("audio connection closed");
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_WS_MESSAGE_SIZE);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionSection, TranscriptionSection};
    use futures_util::SinkExt;
    use std::future::Future;
    use std::path::PathBuf;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
    use tokio_tungstenite::tungstenite::Error as WsError;
    use voicepty_core::TranscriptEvent;

    struct EchoTranscriber;

    impl Transcriber for EchoTranscriber {
        fn transcribe<'a>(
            &'a self,
            wav: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = VoiceResult<String>> + Send + 'a>> {
            Box::pin(async move { Ok(format!("heard {} bytes", wav.len())) })
        }
    }

    fn config(session: SessionSection, insecure: bool) -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            insecure,
            jwt_secret: "test-secret".into(),
            ephemeral_secret: false,
            session,
            transcription: TranscriptionSection::default(),
        }
    }

    fn shell(script: &str) -> SessionSection {
        SessionSection {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            probe_args: vec![],
            shutdown_grace_secs: 1,
            ..SessionSection::default()
        }
    }

    async fn start(server: VoiceServer) -> (SocketAddr, Arc<VoiceServer>, CancellationToken) {
        let server = Arc::new(server);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.clone().run(listener, None, shutdown.clone()));
        (addr, server, shutdown)
    }

    async fn rejected_with(url: String) -> StatusCode {
        match tokio_tungstenite::connect_async(url).await {
            Err(WsError::Http(response)) => response.status(),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("upgrade unexpectedly accepted"),
        }
    }

    #[tokio::test]
    async fn health_report_shape() {
        let session = SessionSection {
            probe_args: vec!["-c".into(), "exit 1".into()],
            ..shell("cat")
        };
        let server = VoiceServer::with_transcriber(config(session, true), Some(Arc::new(EchoTranscriber)));
        let report = server.health().await;
        assert!(!report.is_ready());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["program"], "sh");
        assert_eq!(json["cli_available"], true);
        assert_eq!(json["backend_running"], false);
        assert_eq!(json["session_live"], false);
        assert_eq!(json["transcription_configured"], true);
        assert_eq!(json["insecure"], true);
    }

    #[tokio::test]
    async fn rejects_bad_upgrades() {
        let server = VoiceServer::with_transcriber(config(shell("cat"), false), None);
        let (addr, _server, shutdown) = start(server).await;

        assert_eq!(rejected_with(format!("ws://{addr}/nope")).await, StatusCode::NOT_FOUND);
        assert_eq!(
            rejected_with(format!("ws://{addr}/ws/pty?token=forged")).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(rejected_with(format!("ws://{addr}/ws/pty")).await, StatusCode::UNAUTHORIZED);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn audio_without_transcriber_is_unavailable() {
        let server = VoiceServer::with_transcriber(config(shell("cat"), true), None);
        assert!(!server.transcription_enabled());
        let (addr, _server, shutdown) = start(server).await;

        assert_eq!(
            rejected_with(format!("ws://{addr}/ws/audio")).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        shutdown.cancel();
    }

    #[tokio::test]
    async fn missing_cli_gets_diagnostic_then_close() {
        let session = SessionSection {
            program: "no-such-binary-voicepty".into(),
            ..SessionSection::default()
        };
        let server = VoiceServer::with_transcriber(config(session, true), None);
        let (addr, _server, shutdown) = start(server).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/pty"))
            .await
            .unwrap();
        let first = ws.next().await.unwrap().unwrap();
        let text = first.to_text().unwrap();
        assert!(text.starts_with("🚨"));
        assert!(text.contains("CLI not found"));
        assert!(matches!(ws.next().await, Some(Ok(Message::Close(_))) | None));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn terminal_round_trip_with_protocol_token() {
        let server = VoiceServer::with_transcriber(config(shell("cat"), false), None);
        let (addr, server, shutdown) = start(server).await;

        let entry = format!("jwt-{}", server.authenticator().issue());
        let mut request = format!("ws://{addr}/ws/pty").into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_str(&entry).unwrap());
        let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(
            response.headers().get("Sec-WebSocket-Protocol").unwrap(),
            entry.as_str()
        );

        ws.send(Message::Text("voice-bridge\n".into())).await.unwrap();
        let mut seen = String::new();
        let read = async {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    seen.push_str(&text);
                    if seen.contains("voice-bridge") {
                        break;
                    }
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), read).await.unwrap();
        assert!(seen.contains("voice-bridge"));

        shutdown.cancel();
        if let Some(done) = server.sessions().shutdown().await {
            let _ = done.await;
        }
    }

    #[tokio::test]
    async fn audio_chunk_produces_transcript_event() {
        let server = VoiceServer::with_transcriber(config(shell("cat"), true), Some(Arc::new(EchoTranscriber)));
        let (addr, _server, shutdown) = start(server).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/audio"))
            .await
            .unwrap();
        ws.send(Message::Binary(vec![0; 100])).await.unwrap();
        ws.send(Message::Binary(vec![0; 2000])).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let event: TranscriptEvent = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        // 44-byte header + 2000 bytes of PCM; the short chunk produced nothing.
        assert_eq!(event, TranscriptEvent::final_text("heard 2044 bytes"));
        shutdown.cancel();
    }
}
