//! Public `Listener` API (§6.5) tying together the control connection, the
//! rendezvous engine, and the HTTP tunnel.
//!
//! Status is a single broadcast channel rather than three separate
//! delegates (§9): `on_connecting`/`on_online`/`on_offline` are thin
//! filters over [`ListenerStatus`] events for callers that want the
//! familiar three-callback shape.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use relay_core::{BoundedAsyncQueue, Command, ListenerConfig, QueueOutcome, RelayError, RelayErrorKind, TokenProvider, TrackingContext, url};
use relay_transport::HybridConnectionStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::control::{ControlConnection, ControlEvent};
use crate::http_tunnel::{HybridHttpConnection, RequestHandler};
use crate::rendezvous::{AcceptHandler, RendezvousEngine};

#[derive(Debug, Clone)]
pub enum ListenerStatus {
    Connecting,
    Online,
    Offline(RelayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeState {
    Connecting,
    Online,
    Offline,
}

/// A snapshot of the listener's current state, per `get_runtime_info` (§6.5).
#[derive(Debug, Clone)]
pub struct ListenerRuntimeInfo {
    pub online: bool,
    pub queued_connections: usize,
}

pub struct Listener {
    host: String,
    port: Option<u16>,
    path: String,
    query: String,
    provider: Arc<dyn TokenProvider>,
    config: ListenerConfig,
    control: Mutex<Option<Arc<ControlConnection>>>,
    accept_handler: Mutex<Option<Arc<dyn AcceptHandler>>>,
    request_handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    queue: Arc<BoundedAsyncQueue<HybridConnectionStream>>,
    status_tx: broadcast::Sender<ListenerStatus>,
    state: AtomicU8,
    current_control_body: Mutex<Option<mpsc::UnboundedSender<(Vec<u8>, bool)>>>,
}

impl Listener {
    /// `address` is a logical `sb://host[:port]/path[?query]` endpoint;
    /// `provider` supplies tokens for its audience (§3).
    pub fn new(address: &str, provider: Arc<dyn TokenProvider>, config: ListenerConfig) -> Result<Self, RelayError> {
        let (host, port, path, query) = url::parse_endpoint(address)
            .map_err(|e| RelayError::new(RelayErrorKind::Relay, e.to_string(), TrackingContext::new(None)))?;
        let (status_tx, _rx) = broadcast::channel(32);
        Ok(Self {
            host,
            port,
            path,
            query,
            provider,
            config,
            control: Mutex::new(None),
            accept_handler: Mutex::new(None),
            request_handler: Mutex::new(None),
            queue: Arc::new(BoundedAsyncQueue::new()),
            status_tx,
            state: AtomicU8::new(RuntimeState::Offline as u8),
            current_control_body: Mutex::new(None),
        })
    }

    pub async fn set_accept_handler(&self, handler: Arc<dyn AcceptHandler>) {
        *self.accept_handler.lock().await = Some(handler);
    }

    pub async fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.request_handler.lock().await = Some(handler);
    }

    /// A broadcast receiver of every status transition.
    pub fn status_events(&self) -> broadcast::Receiver<ListenerStatus> {
        self.status_tx.subscribe()
    }

    pub fn on_connecting<F: Fn() + Send + 'static>(&self, f: F) {
        self.watch_status(f, |s| matches!(s, ListenerStatus::Connecting));
    }

    pub fn on_online<F: Fn() + Send + 'static>(&self, f: F) {
        self.watch_status(f, |s| matches!(s, ListenerStatus::Online));
    }

    pub fn on_offline<F: Fn(&RelayError) + Send + 'static>(&self, f: F) {
        let mut rx = self.status_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(status) = rx.recv().await {
                if let ListenerStatus::Offline(e) = status {
                    f(&e);
                }
            }
        });
    }

    fn watch_status<F: Fn() + Send + 'static>(&self, f: F, matches: fn(&ListenerStatus) -> bool) {
        let mut rx = self.status_tx.subscribe();
        tokio::spawn(async move {
            while let Ok(status) = rx.recv().await {
                if matches(&status) {
                    f();
                }
            }
        });
    }

    pub async fn open(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), RelayError> {
        let (control, mut events) = ControlConnection::new(
            self.host.clone(),
            self.port,
            self.path.clone(),
            self.query.clone(),
            Arc::clone(&self.provider),
            self.config.clone(),
        );

        self.state.store(RuntimeState::Connecting as u8, Ordering::SeqCst);
        let _ = self.status_tx.send(ListenerStatus::Connecting);
        control.open(cancel).await?;
        *self.control.lock().await = Some(Arc::clone(&control));

        let this = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_control_event(event, &cancel).await;
            }
        });

        Ok(())
    }

    async fn handle_control_event(self: &Arc<Self>, event: ControlEvent, cancel: &CancellationToken) {
        match event {
            ControlEvent::Online => {
                self.state.store(RuntimeState::Online as u8, Ordering::SeqCst);
                let _ = self.status_tx.send(ListenerStatus::Online);
            }
            ControlEvent::Offline(e) => {
                self.state.store(RuntimeState::Offline as u8, Ordering::SeqCst);
                let _ = self.status_tx.send(ListenerStatus::Offline(e));
            }
            ControlEvent::Body { data, end_of_message } => {
                let mut guard = self.current_control_body.lock().await;
                if let Some(tx) = guard.as_ref() {
                    let _ = tx.send((data, end_of_message));
                    if end_of_message {
                        *guard = None;
                    }
                }
            }
            ControlEvent::Command(Command::Accept(accept)) => {
                let handler = self.accept_handler.lock().await.clone();
                let Some(handler) = handler else {
                    warn!("received accept command with no accept handler configured");
                    return;
                };
                let rendezvous = RendezvousEngine::new();
                let queue = Arc::clone(&self.queue);
                let cancel = cancel.clone();
                tokio::spawn(async move { rendezvous.handle_accept(accept, handler, queue, cancel).await });
            }
            ControlEvent::Command(Command::Request(request)) => {
                let control = self.control.lock().await.clone();
                let Some(control) = control else { return };
                let http = HybridHttpConnection::new(control);

                let handler = self.request_handler.lock().await.clone();
                let Some(handler) = handler else {
                    http.handle_unhandled(&request.id).await;
                    return;
                };

                let control_body = if request.body == Some(true) && request.address.is_none() {
                    let (tx, rx) = mpsc::unbounded_channel();
                    *self.current_control_body.lock().await = Some(tx);
                    Some(rx)
                } else {
                    None
                };

                tokio::spawn(async move { http.handle_request(request, handler, control_body).await });
            }
            ControlEvent::Command(Command::Response(_)) | ControlEvent::Command(Command::RenewToken(_)) => {
                warn!("received unexpected command on listener control channel");
            }
        }
    }

    /// Pulls the next accepted connection (§4.1, C1).
    pub async fn accept_connection(&self, cancel: &CancellationToken) -> QueueOutcome<HybridConnectionStream> {
        self.queue.dequeue(cancel).await
    }

    pub fn get_runtime_info(&self) -> ListenerRuntimeInfo {
        ListenerRuntimeInfo {
            online: self.state.load(Ordering::SeqCst) == RuntimeState::Online as u8,
            queued_connections: self.queue.total_len(),
        }
    }

    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        let control = self.control.lock().await.clone();
        self.queue.close();
        if let Some(control) = control {
            control.close(cancel).await?;
        }
        self.state.store(RuntimeState::Offline as u8, Ordering::SeqCst);
        Ok(())
    }
}
