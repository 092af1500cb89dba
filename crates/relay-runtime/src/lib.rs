//! # Relay Runtime
//!
//! Ambient stack for the relay engine: layered YAML configuration
//! (`config`) and structured logging setup (`logging`). Neither module
//! touches the wire protocol; both exist so an embedding application gets a
//! real configuration/observability story instead of hand-rolled globals.

pub mod config;
pub mod logging;

pub use config::RelayConfig;
