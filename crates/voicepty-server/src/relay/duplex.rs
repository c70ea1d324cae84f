//! Per-connection duplex relay.
//!
//! Two tasks share one terminal connection:
//! - **Inbound** (browser → session): each text or binary frame is written to
//!   the session under its guard, in arrival order.
//! - **Outbound** (session → browser): the scrollback captured at attach is
//!   sent first, then output chunks from the session's broadcast are framed
//!   and sent in read order. A 100 ms tick checks that the attached
//!   generation is still live.
//!
//! Whichever loop ends first reports on a capacity-2 channel; the attach
//! point then cancels the peer and closes the socket. A dead session ends
//! the relay; it is never restarted from here.

use super::framing::Utf8Framer;
use crate::session::{SessionHandle, SessionManager, SessionOutput};
use crate::transport::{payload_of, ConnectionWriter};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the outbound loop re-checks cancellation and liveness.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long teardown waits on a send stuck behind a browser that stopped reading.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a relay loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// Browser sent Close or the stream ended.
    ClientClosed,
    /// Reading from the browser failed.
    ClientReadFailed,
    /// Sending to the browser failed.
    ClientWriteFailed,
    /// Writing into the session failed.
    SessionWriteFailed,
    /// The process behind the PTY exited.
    SessionExited,
    /// The attached generation was shut down or replaced.
    SessionReplaced,
    /// The peer loop finished first.
    Cancelled,
}

/// Attach a terminal connection to the session and relay until either side
/// goes away. Returns the reason the first loop ended.
pub async fn run<S>(
    stream: SplitStream<WebSocketStream<S>>,
    writer: ConnectionWriter<S>,
    sessions: Arc<SessionManager>,
    handle: SessionHandle,
) -> RelayExit
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let SessionHandle {
        generation,
        replay,
        output,
    } = handle;
    let (done_tx, mut done_rx) = mpsc::channel::<RelayExit>(2);
    let cancel = CancellationToken::new();

    info!(generation, "terminal attached");

    let inbound = {
        let sessions = sessions.clone();
        let cancel = cancel.clone();
        let done = done_tx.clone();
        tokio::spawn(async move {
            let exit = inbound_loop(stream, &sessions, generation, &cancel).await;
            let _ = done.try_send(exit);
        })
    };

    let outbound = {
        let writer = writer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let exit = outbound_loop(replay, output, &writer, &sessions, generation, &cancel).await;
            let _ = done_tx.try_send(exit);
        })
    };

    // Both senders live in the tasks, so this only yields None if both
    // tasks died without reporting.
    let exit = done_rx.recv().await.unwrap_or(RelayExit::Cancelled);
    cancel.cancel();

    let outbound_abort = outbound.abort_handle();
    if tokio::time::timeout(TEARDOWN_TIMEOUT, writer.close()).await.is_err() {
        debug!(generation, "terminal close timed out");
    }
    match tokio::time::timeout(TEARDOWN_TIMEOUT, outbound).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(generation, error = %e, "outbound relay task failed"),
        Err(_) => {
            outbound_abort.abort();
            debug!(generation, "outbound relay stuck on send, aborted");
        }
    }
    if let Err(e) = inbound.await {
        warn!(generation, error = %e, "inbound relay task failed");
    }

    info!(generation, reason = ?exit, "terminal detached");
    exit
}

async fn inbound_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    sessions: &SessionManager,
    generation: u64,
    cancel: &CancellationToken,
) -> RelayExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayExit::Cancelled,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Close(_))) | None => {
                debug!(generation, "browser closed terminal connection");
                return RelayExit::ClientClosed;
            }
            Some(Ok(message)) => {
                let Some(data) = payload_of(message) else {
                    continue;
                };
                if let Err(e) = sessions.write(generation, &data).await {
                    warn!(generation, error = %e, "PTY write error");
                    return RelayExit::SessionWriteFailed;
                }
            }
            Some(Err(e)) => {
                debug!(generation, error = %e, "terminal WebSocket read error");
                return RelayExit::ClientReadFailed;
            }
        }
    }
}

async fn outbound_loop<S>(
    replay: Vec<u8>,
    mut output: broadcast::Receiver<SessionOutput>,
    writer: &ConnectionWriter<S>,
    sessions: &SessionManager,
    generation: u64,
    cancel: &CancellationToken,
) -> RelayExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = Utf8Framer::new();
    if !replay.is_empty() {
        debug!(generation, bytes = replay.len(), "replaying scrollback");
        if let Some(frame) = framer.push(&replay) {
            if let Err(e) = writer.send(frame).await {
                debug!(generation, error = %e, "terminal WebSocket write error");
                return RelayExit::ClientWriteFailed;
            }
        }
    }

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return RelayExit::Cancelled,
            received = output.recv() => match received {
                Ok(SessionOutput::Data(chunk)) => {
                    let Some(frame) = framer.push(&chunk) else {
                        continue;
                    };
                    if let Err(e) = writer.send(frame).await {
                        debug!(generation, error = %e, "terminal WebSocket write error");
                        return RelayExit::ClientWriteFailed;
                    }
                }
                Ok(SessionOutput::Closed) | Err(RecvError::Closed) => {
                    info!(generation, "PTY reached EOF, process has exited");
                    if let Some(tail) = framer.finish() {
                        if let Err(e) = writer.send(tail).await {
                            debug!(generation, error = %e, "terminal WebSocket write error");
                            return RelayExit::ClientWriteFailed;
                        }
                    }
                    return RelayExit::SessionExited;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(generation, skipped, "terminal fell behind, output dropped");
                }
            },
            _ = ticker.tick() => {
                if !sessions.is_current(generation) {
                    debug!(generation, "attached session is no longer live");
                    return RelayExit::SessionReplaced;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSection;
    use crate::transport::websocket::test_support::ws_pair;
    use futures_util::SinkExt;

    fn manager(script: &str) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(SessionSection {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            probe_args: vec![],
            shutdown_grace_secs: 1,
            ..SessionSection::default()
        }))
    }

    async fn attach(
        sessions: &Arc<SessionManager>,
    ) -> (
        tokio::task::JoinHandle<RelayExit>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        sessions.ensure_live().await.unwrap();
        let handle = sessions.current_handle().await.unwrap();
        let (server, client) = ws_pair().await;
        let (sink, stream) = server.split();
        let writer = ConnectionWriter::new(sink);
        let relay = tokio::spawn(run(stream, writer, sessions.clone(), handle));
        (relay, client)
    }

    #[tokio::test]
    async fn browser_input_reaches_process_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("typed.txt");
        let sessions = manager(&format!("cat > {}", out.display()));
        let (relay, mut client) = attach(&sessions).await;

        client.send(Message::Text("echo one\n".into())).await.unwrap();
        client.send(Message::Binary(b"echo two\n".to_vec())).await.unwrap();
        client.send(Message::Text("three\n".into())).await.unwrap();

        let expected = "echo one\necho two\nthree\n";
        let mut got = String::new();
        for _ in 0..100 {
            got = std::fs::read_to_string(&out).unwrap_or_default();
            if got == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(got, expected);

        client.close(None).await.unwrap();
        assert_eq!(relay.await.unwrap(), RelayExit::ClientClosed);
        let _ = sessions.shutdown().await;
    }

    #[tokio::test]
    async fn process_output_reaches_browser_and_exit_ends_relay() {
        let sessions = manager("sleep 0.3; printf hello-browser");
        let (relay, mut client) = attach(&sessions).await;

        let mut received = String::new();
        while let Some(Ok(msg)) = client.next().await {
            match msg {
                Message::Text(text) => received.push_str(&text),
                Message::Close(_) => break,
                _ => {}
            }
        }
        assert!(received.contains("hello-browser"));
        assert_eq!(relay.await.unwrap(), RelayExit::SessionExited);
    }

    async fn collect_until_close(client: &mut WebSocketStream<tokio::io::DuplexStream>) -> Vec<u8> {
        let mut received = Vec::new();
        while let Some(Ok(msg)) = client.next().await {
            match msg {
                Message::Text(text) => received.extend_from_slice(text.as_bytes()),
                Message::Binary(data) => received.extend(data),
                Message::Close(_) => break,
                _ => {}
            }
        }
        received
    }

    #[tokio::test]
    async fn output_printed_before_attach_is_replayed_first() {
        let sessions = manager("printf early-banner; sleep 0.5; printf later");
        sessions.ensure_live().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (relay, mut client) = attach(&sessions).await;
        let received = collect_until_close(&mut client).await;
        assert_eq!(String::from_utf8_lossy(&received), "early-bannerlater");
        assert_eq!(relay.await.unwrap(), RelayExit::SessionExited);
    }

    #[tokio::test]
    async fn split_character_at_exit_is_flushed() {
        // Only the first two bytes of "☃" (e2 98 83) before the process exits.
        let sessions = manager("sleep 0.3; printf 'end\\342\\230'");
        let (relay, mut client) = attach(&sessions).await;

        let received = collect_until_close(&mut client).await;
        assert_eq!(received, b"end\xe2\x98");
        assert_eq!(relay.await.unwrap(), RelayExit::SessionExited);
    }

    #[tokio::test]
    async fn shutdown_detaches_relay() {
        let sessions = manager("sleep 30");
        let (relay, _client) = attach(&sessions).await;

        let termination = sessions.shutdown().await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            exit,
            RelayExit::SessionReplaced | RelayExit::SessionExited
        ));
        let _ = termination.await;
    }
}
