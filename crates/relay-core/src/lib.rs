//! # Relay Core
//!
//! Foundational types for the Hybrid Connections relay engine: the error
//! taxonomy, tracking-context identity, security tokens, the wire command
//! format, the bounded async queue, and bit-exact URL construction.
//!
//! Higher-level components — the control connection, rendezvous engine, and
//! HTTP tunnel — live in `relay-listener`; the single-shot send side lives
//! in `relay-client`; the WebSocket transport wrapper lives in
//! `relay-transport`. This crate has no networking of its own.

pub mod command;
pub mod config;
pub mod error;
pub mod queue;
pub mod token;
pub mod tracking;
pub mod url;

pub use command::{AcceptCommand, Command, CommandError, RemoteEndpoint, RenewTokenCommand, RequestCommand, ResponseCommand};
pub use config::{ClientConfig, ListenerConfig};
pub use error::{RelayError, RelayErrorKind, RelayResult, kind_from_http_status};
pub use queue::{BoundedAsyncQueue, ItemDisposer, OnDequeue, QueueOutcome};
pub use token::{SecurityToken, TokenProvider, TokenProviderError, build_sas_token, jwt_expiry};
pub use tracking::TrackingContext;
