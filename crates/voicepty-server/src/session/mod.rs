//! Session management: the shared CLI process, its PTY, and output fan-out.

pub mod manager;
pub mod pty;
pub mod ring_buffer;

pub use manager::{BackendHealth, SessionHandle, SessionManager, Termination};
pub use pty::{PtyHandle, SessionOutput};
