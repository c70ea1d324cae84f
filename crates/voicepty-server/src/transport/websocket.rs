//! WebSocket plumbing shared by the terminal and audio channels.
//!
//! [`ConnectionWriter`] owns the write half of a connection behind a mutex so
//! that concurrently produced frames (relay output, transcript events,
//! diagnostics) go out one whole frame at a time.

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use voicepty_core::{VoiceError, VoiceResult};

/// Maximum inbound message size (1 MiB); larger audio chunks are refused
/// by tungstenite before they reach the pipeline.
pub const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Exclusive-write handle for one WebSocket connection.
pub struct ConnectionWriter<S> {
    sink: Arc<Mutex<WsSink<S>>>,
}

impl<S> Clone for ConnectionWriter<S> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(sink: WsSink<S>) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Send one frame. The guard is held for the whole send + flush.
    pub async fn send(&self, message: Message) -> VoiceResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|e| VoiceError::Socket(format!("WS send failed: {e}")))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        self.send(Message::Text(text.into())).await
    }

    /// Serialize `value` and send it as a single text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> VoiceResult<()> {
        let json = serde_json::to_string(value)?;
        self.send(Message::Text(json)).await
    }

    /// Best-effort close; errors mean the peer is already gone.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(error = %e, "WS close failed");
        }
    }
}

/// Bytes carried by a data frame, `None` for control frames.
pub fn payload_of(message: Message) -> Option<Vec<u8>> {
    match message {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(data) => Some(data),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ws_pair;
    use super::*;
    use futures_util::StreamExt;
    use voicepty_core::TranscriptEvent;

    #[tokio::test]
    async fn concurrent_json_events_arrive_whole() {
        let (server, mut client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = ConnectionWriter::new(sink);

        let mut tasks = Vec::new();
        for i in 0..32 {
            let w = writer.clone();
            tasks.push(tokio::spawn(async move {
                let text = format!("event-{i}-{}", "x".repeat(2000));
                w.send_json(&TranscriptEvent::final_text(text)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..32 {
            let msg = client.next().await.unwrap().unwrap();
            let event: TranscriptEvent = serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert!(event.is_final);
            seen.push(event.text);
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn payloads() {
        assert_eq!(payload_of(Message::Text("ls\n".into())), Some(b"ls\n".to_vec()));
        assert_eq!(payload_of(Message::Binary(vec![3])), Some(vec![3]));
        assert_eq!(payload_of(Message::Ping(vec![])), None);
        assert_eq!(payload_of(Message::Close(None)), None);
    }
}
