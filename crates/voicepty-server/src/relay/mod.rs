//! Terminal relay: moves bytes between one WebSocket and the shared session.

pub mod duplex;
pub mod framing;

pub use duplex::{run, RelayExit};
pub use framing::Utf8Framer;
