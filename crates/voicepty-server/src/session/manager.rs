//! Lifecycle of the single shared CLI session.
//!
//! One session is live at a time. Starting is serialized by `start_lock`
//! (check, lock, re-check, start); the session itself sits behind `slot`,
//! which every write and every (re)install goes through. `slot` is never
//! held across the liveness probe.

use super::pty::{spawn_output_pump, OutputFeed, PtyHandle, SessionOutput};
use crate::config::SessionSection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voicepty_core::{VoiceError, VoiceResult};

/// Buffered output chunks per attached relay before it starts lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// How often the shutdown timer checks whether the process is gone.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long shutdown waits for the output pump to drain after the exit.
const PUMP_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// A live attachment to the CLI process.
pub struct Session {
    generation: u64,
    pty: PtyHandle,
    output: Arc<OutputFeed>,
    started_at: Instant,
}

impl Session {
    fn is_alive(&mut self) -> bool {
        if self.output.is_closed() {
            return false;
        }
        matches!(self.pty.try_wait(), Ok(None))
    }
}

struct Slot {
    current: Option<Session>,
    generation: u64,
}

/// What a relay captures at attach time.
#[derive(Debug)]
pub struct SessionHandle {
    pub generation: u64,
    /// Scrollback printed before the attach, oldest first.
    pub replay: Vec<u8>,
    /// Everything printed after `replay`.
    pub output: broadcast::Receiver<SessionOutput>,
}

/// How the process went away after [`SessionManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period.
    Exited,
    /// Still running after the grace period and was force-killed.
    Killed,
}

/// Result of the startup checks without starting anything.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub program: String,
    pub cli_available: bool,
    pub backend_running: bool,
    pub session_live: bool,
    pub generation: u64,
}

/// Owns the CLI process and its PTY.
pub struct SessionManager {
    settings: SessionSection,
    slot: Mutex<Slot>,
    start_lock: Mutex<()>,
    /// Generation of the live session, 0 when none. Lets relays poll
    /// liveness without taking `slot`.
    live_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(settings: SessionSection) -> Self {
        Self {
            settings,
            slot: Mutex::new(Slot {
                current: None,
                generation: 0,
            }),
            start_lock: Mutex::new(()),
            live_generation: AtomicU64::new(0),
        }
    }

    /// Make sure a live session exists, starting one if needed.
    ///
    /// Returns the generation of the live session.
    pub async fn ensure_live(&self) -> VoiceResult<u64> {
        if let Some(generation) = self.live().await {
            return Ok(generation);
        }

        let _starting = self.start_lock.lock().await;
        if let Some(generation) = self.live().await {
            return Ok(generation);
        }

        let (pty, program) = self.start().await?;
        self.install(pty, &program).await
    }

    /// Check the current session, reaping it if the process has exited.
    async fn live(&self) -> Option<u64> {
        let mut slot = self.slot.lock().await;
        let alive = match slot.current.as_mut() {
            Some(session) => session.is_alive(),
            None => return None,
        };
        if alive {
            return slot.current.as_ref().map(|s| s.generation);
        }
        if let Some(mut dead) = slot.current.take() {
            info!(
                generation = dead.generation,
                uptime_secs = dead.started_at.elapsed().as_secs(),
                "session process exited"
            );
            dead.pty.close();
        }
        self.live_generation.store(0, Ordering::SeqCst);
        None
    }

    /// Resolve, probe and spawn. Does not touch `slot`.
    async fn start(&self) -> VoiceResult<(PtyHandle, PathBuf)> {
        let program = resolve_executable(&self.settings.program).ok_or_else(|| {
            VoiceError::ExecutableNotFound {
                program: self.settings.program.clone(),
            }
        })?;

        self.probe(&program).await?;

        let pty = PtyHandle::spawn(
            &program,
            &self.settings.args,
            self.settings.cols,
            self.settings.rows,
        )?;
        Ok((pty, program))
    }

    async fn install(&self, mut pty: PtyHandle, program: &Path) -> VoiceResult<u64> {
        let mut slot = self.slot.lock().await;
        let generation = slot.generation + 1;

        let reader = pty
            .take_reader()
            .ok_or_else(|| VoiceError::SpawnFailed("PTY reader unavailable".into()))?;
        let output = Arc::new(OutputFeed::new(
            self.settings.scrollback_bytes,
            OUTPUT_CHANNEL_CAPACITY,
        ));
        if let Err(e) = spawn_output_pump(reader, output.clone(), generation) {
            let _ = pty.kill();
            pty.close();
            return Err(e);
        }

        slot.generation = generation;
        slot.current = Some(Session {
            generation,
            pty,
            output,
            started_at: Instant::now(),
        });
        self.live_generation.store(generation, Ordering::SeqCst);

        let (cols, rows) = slot.current.as_ref().map(|s| s.pty.size()).unwrap_or_default();
        info!(generation, program = %program.display(), cols, rows, "session started");
        Ok(generation)
    }

    /// Run `<program> <probe_args>` and require a zero exit.
    async fn probe(&self, program: &Path) -> VoiceResult<()> {
        if self.settings.probe_args.is_empty() {
            return Ok(());
        }

        let mut cmd = Command::new(program);
        cmd.args(&self.settings.probe_args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let probe_line = format!("{} {}", self.settings.program, self.settings.probe_args.join(" "));
        debug!(probe = %probe_line, "probing backend");

        match tokio::time::timeout(self.settings.probe_timeout(), cmd.status()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(VoiceError::BackendNotRunning(format!(
                "`{probe_line}` exited with {status}"
            ))),
            Ok(Err(e)) => Err(VoiceError::BackendNotRunning(format!(
                "`{probe_line}` could not run: {e}"
            ))),
            Err(_) => Err(VoiceError::BackendNotRunning(format!(
                "`{probe_line}` timed out"
            ))),
        }
    }

    /// Subscribe to the live session, or `None` if nothing is live.
    ///
    /// The handle carries the scrollback so output printed while no terminal
    /// was attached is not lost.
    pub async fn current_handle(&self) -> Option<SessionHandle> {
        let mut slot = self.slot.lock().await;
        let session = slot.current.as_mut()?;
        // Subscribe before the EOF check so a concurrent Closed is not missed.
        let (replay, output) = session.output.attach();
        if !session.is_alive() {
            return None;
        }
        Some(SessionHandle {
            generation: session.generation,
            replay,
            output,
        })
    }

    /// Write to the session a relay attached to. Fails if that generation
    /// is no longer the live one.
    pub async fn write(&self, generation: u64, data: &[u8]) -> VoiceResult<()> {
        let mut slot = self.slot.lock().await;
        match slot.current.as_mut() {
            Some(session) if session.generation == generation => session.pty.write_all(data),
            _ => Err(VoiceError::NoSession),
        }
    }

    /// Write to whatever session is live right now.
    pub async fn write_current(&self, data: &[u8]) -> VoiceResult<u64> {
        let mut slot = self.slot.lock().await;
        let session = slot.current.as_mut().ok_or(VoiceError::NoSession)?;
        session.pty.write_all(data)?;
        Ok(session.generation)
    }

    /// Whether `generation` is still the live session. Lock-free.
    pub fn is_current(&self, generation: u64) -> bool {
        generation != 0 && self.live_generation.load(Ordering::SeqCst) == generation
    }

    /// Generation of the most recently started session (0 if none yet).
    pub async fn generation(&self) -> u64 {
        self.slot.lock().await.generation
    }

    pub async fn is_live(&self) -> bool {
        self.live().await.is_some()
    }

    /// Terminate the live session: SIGTERM, close the PTY, then force-kill
    /// after the grace period on a background task. The task resolves once
    /// the process is gone and the output pump has closed the feed (bounded
    /// by [`PUMP_CLOSE_TIMEOUT`]).
    ///
    /// Returns `None` when there was nothing to shut down.
    pub async fn shutdown(&self) -> Option<JoinHandle<Termination>> {
        let mut session = {
            let mut slot = self.slot.lock().await;
            self.live_generation.store(0, Ordering::SeqCst);
            slot.current.take()?
        };

        let generation = session.generation;
        info!(generation, pid = ?session.pty.pid(), "terminating session process");
        if let Err(e) = session.pty.terminate() {
            warn!(generation, error = %e, "failed to signal session process");
        }
        session.pty.close();

        let grace = self.settings.shutdown_grace();
        Some(tokio::spawn(async move {
            let outcome = wait_for_exit(&mut session, grace).await;
            wait_for_pump(&session.output, generation).await;
            outcome
        }))
    }

    /// Run the startup checks without spawning the session.
    pub async fn health(&self) -> BackendHealth {
        let resolved = resolve_executable(&self.settings.program);
        let backend_running = match &resolved {
            Some(program) => self.probe(program).await.is_ok(),
            None => false,
        };
        BackendHealth {
            program: self.settings.program.clone(),
            cli_available: resolved.is_some(),
            backend_running,
            session_live: self.is_live().await,
            generation: self.generation().await,
        }
    }

    /// Terminal-ready text explaining a startup failure.
    pub fn diagnostic(&self, err: &VoiceError) -> String {
        let program = &self.settings.program;
        match err {
            VoiceError::ExecutableNotFound { .. } => format!(
                "🚨 {program} CLI not found!\r\n\r\nPlease install {program}:\r\n  {}\r\n\r\nThen refresh this page to reconnect.\r\n",
                self.settings.install_hint
            ),
            VoiceError::BackendNotRunning(_) => format!(
                "🚨 {program} server is not running!\r\n\r\nPlease start the server first:\r\n  {}\r\n\r\nThen refresh this page to reconnect.\r\n",
                self.settings.start_hint
            ),
            other => format!(
                "🚨 Failed to start {program}: {other}\r\n\r\nPlease check your {program} installation and try again.\r\n"
            ),
        }
    }
}

async fn wait_for_exit(session: &mut Session, grace: Duration) -> Termination {
    let generation = session.generation;
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !matches!(session.pty.try_wait(), Ok(None)) {
            debug!(generation, "session process exited after SIGTERM");
            return Termination::Exited;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    warn!(generation, grace_ms = grace.as_millis() as u64, "session process ignored SIGTERM, killing");
    if let Err(e) = session.pty.kill() {
        warn!(generation, error = %e, "force kill failed");
    }
    // Reap so it does not linger as a zombie.
    for _ in 0..20 {
        if !matches!(session.pty.try_wait(), Ok(None)) {
            break;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    Termination::Killed
}

/// The pump holds its own master fd; give it a moment to see EOF so the
/// PTY is released before shutdown reports done.
async fn wait_for_pump(output: &OutputFeed, generation: u64) {
    let deadline = tokio::time::Instant::now() + PUMP_CLOSE_TIMEOUT;
    while !output.is_closed() {
        if tokio::time::Instant::now() >= deadline {
            warn!(
                generation,
                "PTY output still open after exit, a child process may hold the terminal"
            );
            return;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Find `program` the way a shell would: paths with a separator are taken
/// as-is, bare names are searched in `PATH`.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
