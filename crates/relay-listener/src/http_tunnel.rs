//! HybridHttpConnection (§4.5, C5): HTTP-over-rendezvous tunneling.
//!
//! A request arrives as a `request` command, optionally followed by its body
//! either inline on the control channel or over a rendezvous socket opened
//! for this exchange. The response is buffered up to
//! [`relay_core::config::MAX_CONTROL_BODY_BYTES`] and flushed on the control
//! channel if it stays under that size and no rendezvous was already needed;
//! otherwise (or after [`relay_core::config::RESPONSE_FLUSH_DELAY`] with
//! buffered-but-unsent bytes) the same rendezvous socket used for the
//! request is (lazily) opened and the response streams over it, terminated
//! by an empty `Binary` end-of-message frame.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use relay_core::{
    Command, RelayError, RelayErrorKind, RemoteEndpoint, RequestCommand, ResponseCommand, TrackingContext,
    config::{MAX_CONTROL_BODY_BYTES, RENDEZVOUS_CONNECT_TIMEOUT, RESPONSE_FLUSH_DELAY},
    url,
};
use relay_transport::{HybridConnectionStream, UpgradeHeaders, WriteMode};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::control::ControlConnection;

/// Builds the rendezvous wire URL from the `address` the service attached to
/// the `request` command, not the listener's own endpoint: the service may
/// route the rendezvous to a different host than the one the control
/// channel is on.
fn rendezvous_url(address: Option<&str>, id: &str, tracking: &TrackingContext) -> Result<String, RelayError> {
    let address = address.ok_or_else(|| RelayError::new(RelayErrorKind::Relay, "request carried no rendezvous address", tracking.clone()))?;
    let (host, port, path, query) =
        url::parse_endpoint(address).map_err(|e| RelayError::new(RelayErrorKind::Relay, e.to_string(), tracking.clone()))?;
    Ok(url::build_url(&host, port, &path, &query, url::Action::Accept, id))
}

/// An inbound tunneled HTTP request.
pub struct HttpTunnelRequest {
    pub id: String,
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub remote_endpoint: Option<RemoteEndpoint>,
    pub body: Vec<u8>,
}

/// User-supplied HTTP request handler.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: HttpTunnelRequest, response: ResponseWriter);
}

struct ResponseState {
    request_id: String,
    status_code: SyncMutex<u16>,
    status_description: SyncMutex<String>,
    headers: SyncMutex<HashMap<String, String>>,
    buffer: Mutex<Vec<u8>>,
    sent_response_command: AtomicBool,
    rendezvous: Mutex<Option<Arc<HybridConnectionStream>>>,
    control: Arc<ControlConnection>,
    rendezvous_address: Option<String>,
    tracking: TrackingContext,
    flush_timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Handed to the [`RequestHandler`] to produce a response. Buffers writes
/// and transparently promotes to a rendezvous stream per §4.5's thresholds.
#[derive(Clone)]
pub struct ResponseWriter {
    state: Arc<ResponseState>,
}

impl ResponseWriter {
    pub fn set_status(&self, code: u16, description: impl Into<String>) {
        *self.state.status_code.lock() = code;
        *self.state.status_description.lock() = description.into();
    }

    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state.headers.lock().insert(name.into(), value.into());
    }

    /// Buffers `chunk`, promoting to a rendezvous socket if the buffer
    /// exceeds [`MAX_CONTROL_BODY_BYTES`], a rendezvous is already open, or
    /// the flush timer armed by the first buffered byte has fired.
    pub async fn write(&self, chunk: &[u8]) -> Result<(), RelayError> {
        let already_rendezvous = self.state.rendezvous.lock().await.is_some();
        let mut buffer = self.state.buffer.lock().await;
        let was_empty = buffer.is_empty();
        buffer.extend_from_slice(chunk);
        let size = buffer.len();
        drop(buffer);

        if was_empty {
            self.arm_flush_timer();
        }

        if already_rendezvous || size > MAX_CONTROL_BODY_BYTES {
            self.promote_and_flush().await?;
        }
        Ok(())
    }

    fn arm_flush_timer(&self) {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(RESPONSE_FLUSH_DELAY).await;
            let writer = ResponseWriter { state };
            if let Err(e) = writer.promote_and_flush().await {
                warn!(error = %e, "flush-timer promotion to rendezvous failed");
            }
        });
        if let Ok(mut guard) = self.state.flush_timer.try_lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
    }

    async fn promote_and_flush(&self) -> Result<(), RelayError> {
        let rendezvous = self.ensure_rendezvous().await?;
        let mut buffer = self.state.buffer.lock().await;
        if !buffer.is_empty() {
            rendezvous.write(&buffer).await?;
            buffer.clear();
        }
        Ok(())
    }

    async fn ensure_rendezvous(&self) -> Result<Arc<HybridConnectionStream>, RelayError> {
        let mut guard = self.state.rendezvous.lock().await;
        if let Some(existing) = guard.as_ref() {
            return Ok(Arc::clone(existing));
        }
        self.send_response_command(true).await?;
        let id = self.state.tracking.tracking_id().to_string();
        let url = rendezvous_url(self.state.rendezvous_address.as_deref(), &id, &self.state.tracking)?;
        let socket = relay_transport::connect(&url, &UpgradeHeaders::default(), RENDEZVOUS_CONNECT_TIMEOUT, false, &self.state.tracking).await?;
        let stream = Arc::new(HybridConnectionStream::new(socket, WriteMode::Binary, self.state.tracking.clone()));
        *guard = Some(Arc::clone(&stream));
        Ok(stream)
    }

    async fn send_response_command(&self, body: bool) -> Result<(), RelayError> {
        if self.state.sent_response_command.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cmd = Command::Response(ResponseCommand {
            request_id: self.state.request_id.clone(),
            status_code: *self.state.status_code.lock(),
            status_description: self.state.status_description.lock().clone(),
            response_headers: self.state.headers.lock().clone(),
            body,
        });
        self.state.control.send_command_and_optional_stream(cmd, None, &CancellationToken::new()).await
    }

    /// Called once the handler has finished producing the response body.
    async fn finish(&self) -> Result<(), RelayError> {
        if let Some(handle) = self.state.flush_timer.lock().await.take() {
            handle.abort();
        }

        let rendezvous = self.state.rendezvous.lock().await.clone();
        match rendezvous {
            Some(stream) => {
                let mut buffer = self.state.buffer.lock().await;
                if !buffer.is_empty() {
                    stream.write(&buffer).await?;
                    buffer.clear();
                }
                drop(buffer);
                stream.write(&[]).await?;
                stream.close().await
            }
            None => {
                let buffer = self.state.buffer.lock().await;
                let has_body = !buffer.is_empty();
                let cmd = Command::Response(ResponseCommand {
                    request_id: self.state.request_id.clone(),
                    status_code: *self.state.status_code.lock(),
                    status_description: self.state.status_description.lock().clone(),
                    response_headers: self.state.headers.lock().clone(),
                    body: has_body,
                });
                let body = if has_body { Some(buffer.as_slice()) } else { None };
                self.state.control.send_command_and_optional_stream(cmd, body, &CancellationToken::new()).await
            }
        }
    }
}

/// Source of a request body that arrives inline on the control channel.
pub type ControlBodyReceiver = mpsc::UnboundedReceiver<(Vec<u8>, bool)>;

pub struct HybridHttpConnection {
    control: Arc<ControlConnection>,
}

impl HybridHttpConnection {
    pub fn new(control: Arc<ControlConnection>) -> Self {
        Self { control }
    }

    /// Drives one request to completion: acquires the body (inline from the
    /// control channel, over a rendezvous, or not at all), invokes `handler`,
    /// and sends the response.
    pub async fn handle_request(
        &self,
        request: RequestCommand,
        handler: Arc<dyn RequestHandler>,
        control_body: Option<ControlBodyReceiver>,
    ) {
        let tracking = TrackingContext::create(request.id.clone(), request.address.clone());

        let (body, rendezvous) = match self.acquire_body(&request, &tracking, control_body).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, tracking = %tracking, "failed to acquire request body");
                self.send_error_response(&request.id, 500, "Internal Server Error").await;
                return;
            }
        };

        let state = Arc::new(ResponseState {
            request_id: request.id.clone(),
            status_code: SyncMutex::new(200),
            status_description: SyncMutex::new("OK".to_string()),
            headers: SyncMutex::new(HashMap::new()),
            buffer: Mutex::new(Vec::new()),
            sent_response_command: AtomicBool::new(false),
            rendezvous: Mutex::new(rendezvous),
            control: Arc::clone(&self.control),
            rendezvous_address: request.address.clone(),
            tracking: tracking.clone(),
            flush_timer: Mutex::new(None),
        });
        let writer = ResponseWriter { state };

        let tunnel_request = HttpTunnelRequest {
            id: request.id,
            method: request.method,
            target: request.request_target,
            headers: request.request_headers,
            remote_endpoint: request.remote_endpoint,
            body,
        };

        handler.handle(tunnel_request, writer.clone()).await;

        if let Err(e) = writer.finish().await {
            warn!(error = %e, tracking = %tracking, "failed to send response");
        }
    }

    async fn acquire_body(
        &self,
        request: &RequestCommand,
        tracking: &TrackingContext,
        control_body: Option<ControlBodyReceiver>,
    ) -> Result<(Vec<u8>, Option<Arc<HybridConnectionStream>>), RelayError> {
        if request.body != Some(true) {
            return Ok((Vec::new(), None));
        }

        if let Some(mut rx) = control_body {
            let mut buffer = Vec::new();
            while let Some((chunk, eom)) = rx.recv().await {
                buffer.extend_from_slice(&chunk);
                if eom {
                    break;
                }
            }
            return Ok((buffer, None));
        }

        let url = rendezvous_url(request.address.as_deref(), request.id.as_str(), tracking)?;
        let socket = relay_transport::connect(&url, &UpgradeHeaders::default(), RENDEZVOUS_CONNECT_TIMEOUT, false, tracking).await?;
        let stream = Arc::new(HybridConnectionStream::new(socket, WriteMode::Binary, tracking.clone()));

        let mut buffer = Vec::new();
        let mut chunk = vec![0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
        }
        Ok((buffer, Some(stream)))
    }

    async fn send_error_response(&self, request_id: &str, status_code: u16, description: &str) {
        let cmd = Command::Response(ResponseCommand {
            request_id: request_id.to_string(),
            status_code,
            status_description: description.to_string(),
            response_headers: HashMap::new(),
            body: false,
        });
        let _ = self.control.send_command_and_optional_stream(cmd, None, &CancellationToken::new()).await;
    }

    /// Reports that no request handler was configured (§4.5: missing handler
    /// maps to 501).
    pub async fn handle_unhandled(&self, request_id: &str) {
        self.send_error_response(request_id, 501, "Not Implemented").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendezvous_url_is_built_from_the_request_address_not_a_fixed_endpoint() {
        let tracking = TrackingContext::new(None);
        let url = rendezvous_url(Some("wss://other-node.example.net/$hc/hc1"), "req-1", &tracking).unwrap();
        assert!(url.starts_with("wss://other-node.example.net/$hc/hc1?"));
        assert!(url.contains("sb-hc-action=accept"));
        assert!(url.contains("sb-hc-id=req-1"));
    }

    #[test]
    fn rendezvous_url_errors_without_an_address() {
        let tracking = TrackingContext::new(None);
        assert!(rendezvous_url(None, "req-1", &tracking).is_err());
    }
}
