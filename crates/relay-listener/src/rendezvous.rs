//! RendezvousEngine (§4.4, C4): promotes an `accept` command into either a
//! second WebSocket handed to the application, or a rejected rendezvous.
//!
//! Runs off the control pump: each `accept` is handled on its own spawned
//! task so a slow or panicking `AcceptHandler` never blocks the receive
//! loop that keeps the control channel alive.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use relay_core::{
    AcceptCommand, BoundedAsyncQueue, RelayError, RelayErrorKind, RemoteEndpoint, TrackingContext, config::RENDEZVOUS_CONNECT_TIMEOUT, url,
};
use relay_transport::{HybridConnectionStream, UpgradeHeaders, WriteMode};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Everything an [`AcceptHandler`] needs to decide whether to accept an
/// inbound connection.
pub struct ListenerContext {
    pub tracking: TrackingContext,
    pub connect_headers: HashMap<String, String>,
    pub remote_endpoint: Option<RemoteEndpoint>,
    reject_status: Mutex<(u16, String)>,
}

impl ListenerContext {
    fn from_accept(accept: &AcceptCommand, tracking: TrackingContext) -> Self {
        Self {
            tracking,
            connect_headers: accept.connect_headers.clone(),
            remote_endpoint: accept.remote_endpoint.clone(),
            reject_status: Mutex::new((410, "Endpoint not found".to_string())),
        }
    }

    /// Overrides the status a rejected connection reports to the client.
    /// Has no effect if the handler ultimately accepts.
    pub fn set_reject_status(&self, status_code: u16, description: impl Into<String>) {
        *self.reject_status.lock() = (status_code, description.into());
    }

    fn reject_status(&self) -> (u16, String) {
        self.reject_status.lock().clone()
    }

    fn negotiated_sub_protocol(&self) -> Option<String> {
        header_case_insensitive(&self.connect_headers, "Sec-WebSocket-Protocol")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()))
    }
}

fn header_case_insensitive<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// User-supplied decision callback: accept or reject an inbound connection.
#[async_trait]
pub trait AcceptHandler: Send + Sync {
    async fn on_accept(&self, ctx: &ListenerContext) -> bool;
}

/// Builds the rendezvous wire URL from the `address` the service attached to
/// the `accept` command, not the listener's own endpoint: the service may
/// route the rendezvous to a different host than the one the control
/// channel is on. `ctx.tracking.address()` carries that service-provided
/// address.
fn rendezvous_url(ctx: &ListenerContext, action: url::Action) -> Result<String, RelayError> {
    let address = ctx
        .tracking
        .address()
        .ok_or_else(|| RelayError::new(RelayErrorKind::Relay, "accept command carried no rendezvous address", ctx.tracking.clone()))?;
    let (host, port, path, query) =
        url::parse_endpoint(address).map_err(|e| RelayError::new(RelayErrorKind::Relay, e.to_string(), ctx.tracking.clone()))?;
    let id = ctx.tracking.tracking_id().to_string();
    Ok(url::build_url(&host, port, &path, &query, action, &id))
}

pub struct RendezvousEngine;

impl RendezvousEngine {
    pub fn new() -> Self {
        Self
    }

    /// Handles one `accept` command. Intended to be spawned, not awaited
    /// inline from the control pump.
    pub async fn handle_accept(
        &self,
        accept: AcceptCommand,
        handler: Arc<dyn AcceptHandler>,
        queue: Arc<BoundedAsyncQueue<HybridConnectionStream>>,
        cancel: CancellationToken,
    ) {
        let tracking = TrackingContext::create(accept.id.clone(), Some(accept.address.clone()));
        let ctx = ListenerContext::from_accept(&accept, tracking.clone());

        let decision = std::panic::AssertUnwindSafe(handler.on_accept(&ctx)).catch_unwind().await;

        match decision {
            Ok(true) => self.accept(&ctx, &cancel, queue).await,
            Ok(false) => {
                let (status_code, description) = ctx.reject_status();
                self.reject(&ctx, status_code, &description, &cancel).await;
            }
            Err(_) => {
                error!(tracking = %tracking, "accept handler panicked");
                self.reject(&ctx, 502, "Internal Server Error", &cancel).await;
            }
        }
    }

    async fn accept(&self, ctx: &ListenerContext, cancel: &CancellationToken, queue: Arc<BoundedAsyncQueue<HybridConnectionStream>>) {
        let url = match rendezvous_url(ctx, url::Action::Accept) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, tracking = %ctx.tracking, "failed to build rendezvous accept url");
                return;
            }
        };
        let sub_protocol = ctx.negotiated_sub_protocol();
        let headers = UpgradeHeaders { sub_protocol: sub_protocol.clone(), ..Default::default() };

        let connect = relay_transport::connect(&url, &headers, RENDEZVOUS_CONNECT_TIMEOUT, false, &ctx.tracking);
        let socket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = connect => result,
        };

        match socket {
            Ok(socket) => {
                let stream = HybridConnectionStream::new(socket, WriteMode::Binary, ctx.tracking.clone());
                queue.enqueue_and_dispatch(stream, None);
            }
            Err(e) => warn!(error = %e, tracking = %ctx.tracking, "rendezvous accept connect failed"),
        }
    }

    async fn reject(&self, ctx: &ListenerContext, status_code: u16, description: &str, cancel: &CancellationToken) {
        let base = match rendezvous_url(ctx, url::Action::Accept) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, tracking = %ctx.tracking, "failed to build rendezvous reject url");
                return;
            }
        };
        let url = url::with_reject_status(&base, status_code, description);

        let connect = relay_transport::connect_reject(&url, RENDEZVOUS_CONNECT_TIMEOUT, &ctx.tracking);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = connect => result,
        };
        if let Err(e) = result {
            warn!(error = %e, tracking = %ctx.tracking, "rendezvous reject connect failed");
        }
    }
}

impl Default for RendezvousEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiated_sub_protocol_takes_first_token() {
        let mut headers = HashMap::new();
        headers.insert("Sec-WebSocket-Protocol".to_string(), "relay.v1, relay.v2".to_string());
        let accept = AcceptCommand { address: "a".into(), id: "id".into(), connect_headers: headers, remote_endpoint: None };
        let ctx = ListenerContext::from_accept(&accept, TrackingContext::new(None));
        assert_eq!(ctx.negotiated_sub_protocol(), Some("relay.v1".to_string()));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("sec-websocket-protocol".to_string(), "relay.v1".to_string());
        assert_eq!(header_case_insensitive(&headers, "Sec-WebSocket-Protocol"), Some("relay.v1"));
    }

    #[test]
    fn default_reject_status_is_410() {
        let accept = AcceptCommand { address: "a".into(), id: "id".into(), connect_headers: HashMap::new(), remote_endpoint: None };
        let ctx = ListenerContext::from_accept(&accept, TrackingContext::new(None));
        assert_eq!(ctx.reject_status(), (410, "Endpoint not found".to_string()));
    }

    #[test]
    fn rendezvous_url_is_built_from_the_service_provided_address_not_the_engine() {
        let tracking = TrackingContext::create("track-1", Some("wss://other-node.example.net/$hc/hc1?sb-hc-action=accept&sb-hc-id=old".to_string()));
        let accept = AcceptCommand { address: "wss://other-node.example.net/$hc/hc1".into(), id: "track-1".into(), connect_headers: HashMap::new(), remote_endpoint: None };
        let ctx = ListenerContext::from_accept(&accept, tracking);
        let url = rendezvous_url(&ctx, url::Action::Accept).unwrap();
        assert!(url.starts_with("wss://other-node.example.net/$hc/hc1?"));
        assert!(url.contains("sb-hc-action=accept"));
        assert!(url.contains("sb-hc-id=track-1"));
    }

    #[test]
    fn rendezvous_url_errors_without_a_service_address() {
        let ctx = ListenerContext::from_accept(
            &AcceptCommand { address: "a".into(), id: "id".into(), connect_headers: HashMap::new(), remote_endpoint: None },
            TrackingContext::new(None),
        );
        assert!(rendezvous_url(&ctx, url::Action::Accept).is_err());
    }

    #[test]
    fn set_reject_status_overrides_default() {
        let accept = AcceptCommand { address: "a".into(), id: "id".into(), connect_headers: HashMap::new(), remote_endpoint: None };
        let ctx = ListenerContext::from_accept(&accept, TrackingContext::new(None));
        ctx.set_reject_status(403, "Forbidden");
        assert_eq!(ctx.reject_status(), (403, "Forbidden".to_string()));
    }
}
