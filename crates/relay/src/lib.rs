//! # Relay
//!
//! Azure Relay Hybrid Connections for Rust: a durable listener control
//! plane, a rendezvous engine for promoted connections, HTTP-over-rendezvous
//! tunneling, and a single-shot client connect.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  accept / request   ┌──────────────────┐
//! │  Listener  │─────────────────────▶│  AcceptHandler /  │──▶ your code
//! │ (control)  │◀─────────────────────│  RequestHandler   │
//! └────────────┘   renewToken, pump   └──────────────────┘
//! ```
//!
//! - [`Listener`] owns the durable control channel and promotes `accept`
//!   commands into [`HybridConnectionStream`]s handed back through
//!   [`Listener::accept_connection`].
//! - [`HybridConnectionClient`] is the other end: one call, one token, one
//!   WebSocket, no reconnect.
//! - [`relay_core::TokenProvider`] is the one trait callers must implement
//!   themselves; everything else here is ready to use.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use relay::prelude::*;
//! use std::sync::Arc;
//!
//! struct AcceptEverything;
//!
//! #[async_trait::async_trait]
//! impl AcceptHandler for AcceptEverything {
//!     async fn on_accept(&self, _ctx: &ListenerContext) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider: Arc<dyn TokenProvider> = todo!("your SAS or AAD token provider");
//!     let listener = Arc::new(Listener::new("sb://ns.servicebus.windows.net/hc1", provider, ListenerConfig::default())?);
//!     listener.set_accept_handler(Arc::new(AcceptEverything)).await;
//!
//!     let cancel = tokio_util::sync::CancellationToken::new();
//!     listener.open(&cancel).await?;
//!
//!     let stream = listener.accept_connection(&cancel).await;
//!     Ok(())
//! }
//! ```

pub use relay_client::HybridConnectionClient;
pub use relay_core::{
    ClientConfig, ListenerConfig, RelayError, RelayErrorKind, RelayResult, SecurityToken, TokenProvider, TokenProviderError, TrackingContext,
};
pub use relay_listener::{
    AcceptHandler, HttpTunnelRequest, Listener, ListenerContext, ListenerRuntimeInfo, ListenerStatus, RequestHandler, ResponseWriter,
};
pub use relay_runtime::RelayConfig;
pub use relay_transport::{HybridConnectionStream, WriteMode};

/// Convenience re-exports for embedding applications.
///
/// ```rust,ignore
/// use relay::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AcceptHandler, ClientConfig, HybridConnectionClient, HybridConnectionStream, Listener, ListenerConfig, ListenerContext,
        ListenerStatus, RelayError, RequestHandler, TokenProvider,
    };
}
