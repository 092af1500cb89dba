//! # Relay Transport
//!
//! The WebSocket transport wrapper (`websocket`) and the duplex byte stream
//! built on top of it (`stream`). Everything above this crate talks to a
//! relay in terms of `HybridConnectionStream`, never `tokio-tungstenite`
//! directly.

pub mod stream;
pub mod websocket;

pub use stream::{HybridConnectionStream, WriteMode};
pub use websocket::{CRATE_VERSION, RelayWsStream, UpgradeHeaders, connect, connect_reject};
