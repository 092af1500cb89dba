//! # Relay Listener
//!
//! The receiving side of a Hybrid Connection: a durable control channel
//! ([`control`]) with its token lifecycle ([`renewer`]), a rendezvous
//! engine that promotes `accept` commands to data WebSockets ([`rendezvous`]),
//! an HTTP-over-rendezvous tunnel ([`http_tunnel`]), and the public
//! [`listener::Listener`] API that wires them together.

pub mod control;
pub mod http_tunnel;
pub mod listener;
pub mod rendezvous;
pub mod renewer;

pub use http_tunnel::{HttpTunnelRequest, RequestHandler, ResponseWriter};
pub use listener::{Listener, ListenerRuntimeInfo, ListenerStatus};
pub use rendezvous::{AcceptHandler, ListenerContext};
pub use renewer::{RenewalEvent, TokenRenewer};
