//! PTY wrapper using portable-pty.
//!
//! Spawns the CLI attached to a fresh pseudo-terminal and exposes the
//! write side, a one-shot reader for the output pump, and process control.

use super::ring_buffer::RingBuffer;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use voicepty_core::{VoiceError, VoiceResult};

/// Size of each read from the PTY master.
const READ_BUF_SIZE: usize = 4096;

/// One item of session output as seen by attached relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Data(Vec<u8>),
    /// The PTY reached end-of-stream; the process has exited.
    Closed,
}

struct FeedState {
    scrollback: RingBuffer,
    closed: bool,
}

/// Everything one session prints: recent history plus the live stream.
///
/// Publishing and attaching share one lock, so a replay snapshot and the
/// receiver handed out with it cover the output exactly once between them.
pub struct OutputFeed {
    state: Mutex<FeedState>,
    tx: broadcast::Sender<SessionOutput>,
}

impl OutputFeed {
    pub fn new(scrollback_bytes: usize, channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self {
            state: Mutex::new(FeedState {
                scrollback: RingBuffer::new(scrollback_bytes),
                closed: false,
            }),
            tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, chunk: &[u8]) {
        let mut state = self.state();
        state.scrollback.write(chunk);
        // No receivers is fine: the scrollback still has it.
        let _ = self.tx.send(SessionOutput::Data(chunk.to_vec()));
    }

    /// Mark end-of-stream and tell attached relays.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        let _ = self.tx.send(SessionOutput::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Snapshot the scrollback and subscribe to what comes after it.
    pub fn attach(&self) -> (Vec<u8>, broadcast::Receiver<SessionOutput>) {
        let state = self.state();
        (state.scrollback.snapshot(), self.tx.subscribe())
    }
}

/// A managed PTY instance.
pub struct PtyHandle {
    writer: Option<Box<dyn Write + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    /// Held so the master side stays open; dropped on close.
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    cols: u16,
    rows: u16,
}

impl PtyHandle {
    /// Spawn `program args...` on a new PTY of the given size.
    pub fn spawn(program: &Path, args: &[String], cols: u16, rows: u16) -> VoiceResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| VoiceError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| VoiceError::SpawnFailed(format!("failed to spawn command: {e}")))?;
        // The child has its own copy of the slave fd.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| VoiceError::SpawnFailed(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| VoiceError::SpawnFailed(format!("failed to take PTY writer: {e}")))?;

        info!(program = %program.display(), cols, rows, pid = ?child.process_id(), "PTY spawned");

        Ok(Self {
            writer: Some(writer),
            reader: Some(reader),
            master: Some(pair.master),
            child,
            cols,
            rows,
        })
    }

    /// Write to the PTY input. Callers hold the session guard.
    pub fn write_all(&mut self, data: &[u8]) -> VoiceResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| VoiceError::Io(std::io::ErrorKind::BrokenPipe.into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Take the output reader. Only the first call returns it.
    pub fn take_reader(&mut self) -> Option<Box<dyn Read + Send>> {
        self.reader.take()
    }

    /// Non-blocking exit check. `Ok(None)` while the process runs.
    pub fn try_wait(&mut self) -> std::io::Result<Option<portable_pty::ExitStatus>> {
        self.child.try_wait()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Ask the process to exit (SIGTERM on unix).
    pub fn terminate(&mut self) -> VoiceResult<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid() {
                send_signal(pid, libc::SIGTERM)?;
                return Ok(());
            }
        }
        self.kill()
    }

    /// Force the process down (SIGKILL on unix).
    pub fn kill(&mut self) -> VoiceResult<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid() {
                send_signal(pid, libc::SIGKILL)?;
                return Ok(());
            }
        }
        self.child
            .kill()
            .map_err(|e| VoiceError::Other(format!("kill failed: {e}")))
    }

    /// Drop our writer and master handle.
    ///
    /// The output pump reads through its own duplicate of the master fd, so
    /// the PTY itself stays open until the pump sees EOF. That happens once
    /// every holder of the slave side (the child and anything it spawned)
    /// has exited.
    pub fn close(&mut self) {
        self.writer.take();
        self.master.take();
        debug!("PTY master closed");
    }

    /// Current terminal size as (cols, rows).
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> VoiceResult<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    // Already gone.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(VoiceError::Io(err))
}

/// Start the thread that moves PTY output into `feed`.
///
/// Closes the feed once the reader hits end-of-stream or an error (Linux
/// reports EIO after the child exits).
pub fn spawn_output_pump(
    mut reader: Box<dyn Read + Send>,
    feed: Arc<OutputFeed>,
    generation: u64,
) -> VoiceResult<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{generation}"))
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(generation, "PTY reached EOF");
                        break;
                    }
                    Ok(n) => feed.publish(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        if e.raw_os_error() != Some(EIO) {
                            warn!(generation, error = %e, "PTY read error");
                        }
                        break;
                    }
                }
            }
            feed.close();
            info!(generation, "PTY output closed, process may have exited");
        })
        .map_err(|e| VoiceError::SpawnFailed(format!("failed to start PTY reader: {e}")))
}

#[cfg(unix)]
const EIO: i32 = libc::EIO;
#[cfg(not(unix))]
const EIO: i32 = 5;
