//! One audio chunk → one transcript event (+ maybe one command).
//!
//! Every binary frame on an audio connection gets its own run on its own
//! task. Runs are not serialized against each other, so when service latency
//! varies, chunk B's event and command can land before chunk A's. Only the
//! individual event writes are atomic (see [`ConnectionWriter`]).

use super::Transcriber;
use crate::dispatch::CommandDispatcher;
use crate::transport::ConnectionWriter;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use voicepty_core::wav::{encode_pcm, PcmFormat};
use voicepty_core::{TranscriptEvent, VoiceError, VoiceResult};

pub struct TranscriptionPipeline {
    transcriber: Arc<dyn Transcriber>,
    dispatcher: Arc<CommandDispatcher>,
    format: PcmFormat,
    min_chunk_bytes: usize,
}

impl TranscriptionPipeline {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        dispatcher: Arc<CommandDispatcher>,
        format: PcmFormat,
        min_chunk_bytes: usize,
    ) -> Self {
        Self {
            transcriber,
            dispatcher,
            format,
            min_chunk_bytes,
        }
    }

    /// Run one chunk to completion.
    ///
    /// Returns the event that was sent to the client, or `ChunkTooSmall`
    /// when the chunk was skipped without sending anything.
    pub async fn process_chunk<S>(
        &self,
        chunk: Vec<u8>,
        writer: &ConnectionWriter<S>,
    ) -> VoiceResult<TranscriptEvent>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if chunk.len() < self.min_chunk_bytes {
            debug!(len = chunk.len(), min = self.min_chunk_bytes, "skipping short audio chunk");
            return Err(VoiceError::ChunkTooSmall {
                len: chunk.len(),
                min: self.min_chunk_bytes,
            });
        }

        let wav = encode_pcm(&chunk, self.format);
        let event = match self.transcriber.transcribe(wav).await {
            Ok(text) => TranscriptEvent::final_text(text),
            Err(e) => {
                warn!(error = %e, "transcription failed");
                TranscriptEvent::error()
            }
        };

        // A closed audio socket does not cancel the command.
        if let Err(e) = writer.send_json(&event).await {
            debug!(error = %e, "failed to send transcript event");
        }

        if event.is_dispatchable() {
            // Failure is logged by the dispatcher.
            let _ = self.dispatcher.execute(&event.text).await;
        }
        Ok(event)
    }

    /// Start a run for `chunk` on its own task.
    pub fn spawn_chunk<S>(self: &Arc<Self>, chunk: Vec<u8>, writer: ConnectionWriter<S>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let _ = pipeline.process_chunk(chunk, &writer).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSection;
    use crate::session::SessionManager;
    use crate::transport::websocket::test_support::ws_pair;
    use futures_util::StreamExt;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use voicepty_core::TranscriptKind;

    /// Replies with a fixed result and records the WAV it was given.
    struct FakeTranscriber {
        reply: Result<&'static str, ()>,
        calls: AtomicUsize,
        last_wav: std::sync::Mutex<Option<Vec<u8>>>,
    }

    impl FakeTranscriber {
        fn new(reply: Result<&'static str, ()>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
                last_wav: std::sync::Mutex::new(None),
            })
        }
    }

    impl Transcriber for FakeTranscriber {
        fn transcribe<'a>(
            &'a self,
            wav: Vec<u8>,
        ) -> Pin<Box<dyn Future<Output = VoiceResult<String>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                *self.last_wav.lock().unwrap() = Some(wav);
                self.reply
                    .map(str::to_string)
                    .map_err(|_| VoiceError::TranscriptionFailed("fake outage".into()))
            })
        }
    }

    fn pipeline(transcriber: Arc<FakeTranscriber>, sessions: Arc<SessionManager>) -> TranscriptionPipeline {
        TranscriptionPipeline::new(
            transcriber,
            Arc::new(CommandDispatcher::new(sessions)),
            PcmFormat::default(),
            1024,
        )
    }

    fn idle_sessions() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(SessionSection::default()))
    }

    #[tokio::test]
    async fn short_chunk_is_skipped_silently() {
        let fake = FakeTranscriber::new(Ok("stop"));
        let pipeline = pipeline(fake.clone(), idle_sessions());
        let (server, _client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = ConnectionWriter::new(sink);

        let err = pipeline.process_chunk(vec![0; 1023], &writer).await.unwrap_err();
        assert!(matches!(err, VoiceError::ChunkTooSmall { len: 1023, min: 1024 }));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_sends_final_event_with_framed_audio() {
        let fake = FakeTranscriber::new(Ok("hello there"));
        let pipeline = pipeline(fake.clone(), idle_sessions());
        let (server, mut client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = ConnectionWriter::new(sink);

        let samples: Vec<i16> = (0..1024).map(|i| (i * 31) as i16).collect();
        let chunk: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let event = pipeline.process_chunk(chunk, &writer).await.unwrap();
        assert_eq!(event.kind, TranscriptKind::Final);

        let wav = fake.last_wav.lock().unwrap().take().unwrap();
        let mut reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!((spec.sample_rate, spec.bits_per_sample, spec.channels), (16_000, 16, 1));
        let decoded: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(decoded, samples);

        let msg = client.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"text": "hello there", "type": "final", "is_final": true})
        );
    }

    #[tokio::test]
    async fn failure_sends_error_event() {
        let fake = FakeTranscriber::new(Err(()));
        let pipeline = pipeline(fake, idle_sessions());
        let (server, mut client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = ConnectionWriter::new(sink);

        let event = pipeline.process_chunk(vec![0; 4096], &writer).await.unwrap();
        assert_eq!(event, TranscriptEvent::error());

        let msg = client.next().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"text": "", "type": "error", "is_final": false})
        );
    }

    #[tokio::test]
    async fn final_text_is_dispatched_to_session() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("voice.txt");
        let sessions = Arc::new(SessionManager::new(SessionSection {
            program: "sh".into(),
            args: vec!["-c".into(), format!("cat > {}", out.display())],
            probe_args: vec![],
            shutdown_grace_secs: 1,
            ..SessionSection::default()
        }));
        sessions.ensure_live().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let pipeline = Arc::new(pipeline(FakeTranscriber::new(Ok(" Quit ")), sessions.clone()));
        let (server, _client) = ws_pair().await;
        let (sink, _stream) = server.split();
        let writer = ConnectionWriter::new(sink);

        pipeline.spawn_chunk(vec![0; 2048], writer).await.unwrap();

        let mut got = String::new();
        for _ in 0..100 {
            got = std::fs::read_to_string(&out).unwrap_or_default();
            if got == ":quit\n" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(got, ":quit\n");
        let _ = sessions.shutdown().await;
    }
}
