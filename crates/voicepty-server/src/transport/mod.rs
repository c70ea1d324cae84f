//! Transports: WebSocket framing and per-connection write serialization.

pub mod websocket;

pub use websocket::{payload_of, ConnectionWriter, MAX_WS_MESSAGE_SIZE};
