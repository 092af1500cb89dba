//! ControlConnection (§4.3, C3): the durable control channel.
//!
//! One task owns the read half and drives the reconnect state machine;
//! writers serialize through a mutex around the send half so commands from
//! the rendezvous engine, the HTTP tunnel, and token renewal never
//! interleave a frame (§9: "async-mutex-around-shared-send-buffer").

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::{Command, ListenerConfig, RelayError, RelayErrorKind, TokenProvider, TrackingContext, config::KEEP_ALIVE_INTERVAL, url};
use relay_transport::{RelayWsStream, UpgradeHeaders};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::renewer::{RenewalEvent, TokenRenewer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Online,
    Closing,
    Closed,
    Offline,
}

/// What the control connection surfaces to its owner (the `Listener`).
#[derive(Debug)]
pub enum ControlEvent {
    Online,
    Offline(RelayError),
    Command(Command),
    /// A raw binary frame received on the control channel outside of a
    /// command's own body (the `ReadControlBody` path of §4.5).
    Body { data: Vec<u8>, end_of_message: bool },
}

type WriteHalf = SplitSink<RelayWsStream, Message>;
type ReadHalf = SplitStream<RelayWsStream>;

struct Endpoint {
    host: String,
    port: Option<u16>,
    path: String,
    query: String,
}

pub struct ControlConnection {
    endpoint: Endpoint,
    renewer: Arc<TokenRenewer>,
    config: ListenerConfig,
    state: Mutex<ConnState>,
    write: Mutex<Option<WriteHalf>>,
    events: mpsc::UnboundedSender<ControlEvent>,
    close_called: AtomicBool,
    reconnect_index: AtomicUsize,
    tracking: Mutex<TrackingContext>,
    reconnect_cancel: Mutex<CancellationToken>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlConnection {
    pub fn new(
        host: impl Into<String>,
        port: Option<u16>,
        path: impl Into<String>,
        query: impl Into<String>,
        provider: Arc<dyn TokenProvider>,
        config: ListenerConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ControlEvent>) {
        let host = host.into();
        let path = path_with_leading_slash(&path.into());
        let query = query.into();
        let address = format!("sb://{host}{path}");
        let tracking = TrackingContext::new(Some(address.clone()));
        let (renewer, mut renewal_rx) = TokenRenewer::new(provider, address, tracking.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            endpoint: Endpoint { host, port, path, query },
            renewer,
            config,
            state: Mutex::new(ConnState::Connecting),
            write: Mutex::new(None),
            events: tx,
            close_called: AtomicBool::new(false),
            reconnect_index: AtomicUsize::new(0),
            tracking: Mutex::new(tracking),
            reconnect_cancel: Mutex::new(CancellationToken::new()),
            pump_handle: Mutex::new(None),
        });

        let renewal_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            while let Some(event) = renewal_rx.recv().await {
                match event {
                    RenewalEvent::Renewed(token) => {
                        let cmd = Command::RenewToken(relay_core::RenewTokenCommand { token: token.token_string });
                        if let Err(e) = renewal_conn.send_command_and_optional_stream(cmd, None, &CancellationToken::new()).await {
                            warn!(error = %e, "failed to send renewToken command");
                        }
                    }
                    RenewalEvent::Failed(e) => warn!(error = %e, "token renewal failed"),
                }
            }
        });

        (conn, rx)
    }

    /// Opens the connection: blocks until the first `Online` transition or a
    /// terminal failure, then continues reconnecting in the background.
    pub async fn open(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), RelayError> {
        match self.connect_once().await {
            Ok((write, read)) => {
                *self.write.lock().await = Some(write);
                *self.state.lock().await = ConnState::Online;
                self.reconnect_index.store(0, Ordering::SeqCst);
                let _ = self.events.send(ControlEvent::Online);
                let reconnect_cancel = cancel.child_token();
                *self.reconnect_cancel.lock().await = reconnect_cancel.clone();
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.pump_and_reconnect(read, reconnect_cancel).await });
                *self.pump_handle.lock().await = Some(handle);
                Ok(())
            }
            Err(e) => {
                *self.state.lock().await = ConnState::Offline;
                Err(e)
            }
        }
    }

    async fn connect_once(&self) -> Result<(WriteHalf, ReadHalf), RelayError> {
        let tracking = self.tracking.lock().await.clone();
        let token = self
            .renewer
            .get_token()
            .await
            .map_err(|e| RelayError::new(e.kind, e.message, tracking.clone()))?;
        let id = tracking.tracking_id_without_suffix();
        let url = url::build_url(&self.endpoint.host, self.endpoint.port, &self.endpoint.path, &self.endpoint.query, url::Action::Listen, &id);
        let headers = UpgradeHeaders { service_bus_authorization: Some(token.token_string), ..Default::default() };
        let socket = relay_transport::connect(&url, &headers, self.config.operation_timeout, false, &tracking).await?;
        Ok(socket.split())
    }

    async fn pump_and_reconnect(self: Arc<Self>, mut read: ReadHalf, cancel: CancellationToken) {
        loop {
            let outcome = self.pump(&mut read, &cancel).await;
            if self.close_called.load(Ordering::SeqCst) {
                *self.state.lock().await = ConnState::Closed;
                return;
            }

            let reconnect_denied = matches!(&outcome, Err(e) if !e.transient());
            if let Err(e) = &outcome {
                let _ = self.events.send(ControlEvent::Offline(e.clone()));
            }
            if reconnect_denied {
                *self.state.lock().await = ConnState::Offline;
                return;
            }

            *self.state.lock().await = ConnState::Connecting;
            loop {
                let index = self.reconnect_index.fetch_add(1, Ordering::SeqCst);
                let delay = self.config.backoff_delay(index);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => { *self.state.lock().await = ConnState::Closed; return; }
                    }
                }
                match self.connect_once().await {
                    Ok((write, new_read)) => {
                        *self.write.lock().await = Some(write);
                        *self.state.lock().await = ConnState::Online;
                        self.reconnect_index.store(0, Ordering::SeqCst);
                        let _ = self.events.send(ControlEvent::Online);
                        read = new_read;
                        break;
                    }
                    Err(e) if !e.transient() => {
                        *self.state.lock().await = ConnState::Offline;
                        let _ = self.events.send(ControlEvent::Offline(e));
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "reconnect attempt failed, retrying");
                        continue;
                    }
                }
            }
        }
    }

    /// Reads frames until the connection drops or is closed. Returns the
    /// error that ended the pump, or `Ok(())` for a clean close-by-peer.
    async fn pump(&self, read: &mut ReadHalf, cancel: &CancellationToken) -> Result<(), RelayError> {
        let mut keep_alive = tokio::time::interval_at(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
        loop {
            let tracking = self.tracking.lock().await.clone();
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::cancelled(tracking)),
                _ = keep_alive.tick() => {
                    self.send_keep_alive_ping().await;
                    continue;
                }
                msg = read.next() => msg,
            };

            let message = match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), tracking)),
                Some(Ok(m)) => m,
            };

            match message {
                Message::Text(text) => {
                    if text.len() > self.config.connection_buffer_bytes {
                        return Err(RelayError::new(RelayErrorKind::Relay, "control command exceeded buffer size", tracking));
                    }
                    match Command::from_json(&text) {
                        Ok(cmd) => self.dispatch(cmd).await,
                        Err(e) => warn!(error = %e, "dropping malformed control command"),
                    }
                }
                Message::Binary(data) => {
                    let _ = self.events.send(ControlEvent::Body { data: data.to_vec(), end_of_message: true });
                }
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    /// Sends an active keep-alive ping (§5, §6.1); failures just get logged
    /// since the next read timeout (or a future ping) will surface a truly
    /// dead connection.
    async fn send_keep_alive_ping(&self) {
        let mut guard = self.write.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                warn!(error = %e, "failed to send keep-alive ping");
            }
        }
    }

    async fn dispatch(&self, cmd: Command) {
        if let Command::Accept(ref accept) = cmd {
            let mut tracking = self.tracking.lock().await;
            let suffixed = accept.id.clone();
            if TrackingContext::strip_suffix(&suffixed) != suffixed {
                tracking.set_tracking_id(suffixed);
            }
        }
        let _ = self.events.send(ControlEvent::Command(cmd));
    }

    /// Serializes `cmd` (and an optional binary body frame) onto the send
    /// half. Callers must not assume ordering across concurrent calls beyond
    /// "each call's frame(s) go out atomically" (§5 ordering guarantees).
    pub async fn send_command_and_optional_stream(
        &self,
        cmd: Command,
        body: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let tracking = self.tracking.lock().await.clone();
        let json = cmd.to_json().map_err(|e| RelayError::new(RelayErrorKind::Relay, e.to_string(), tracking.clone()))?;

        let mut guard = self.write.lock().await;
        let sink = guard.as_mut().ok_or_else(|| RelayError::new(RelayErrorKind::ConnectionLost, "control connection not open", tracking.clone()))?;

        let send_text = sink.send(Message::Text(json.into()));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayError::cancelled(tracking)),
            r = send_text => r.map_err(|e| RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), tracking.clone()))?,
        }

        if let Some(body) = body {
            let send_body = sink.send(Message::Binary(body.to_vec().into()));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::cancelled(tracking)),
                r = send_body => r.map_err(|e| RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), tracking))?,
            }
        }

        Ok(())
    }

    /// Closes the connection: cancels the renewer, cancels the reconnect
    /// loop, sends a close frame, and awaits the receive pump so it can't
    /// outlive the connection it was reading from. Marks `close_called` so
    /// the pump reports `Closed` rather than attempting to reconnect on the
    /// resulting close frame (§4.3 state diagram).
    pub async fn close(&self, cancel: &CancellationToken) -> Result<(), RelayError> {
        self.close_called.store(true, Ordering::SeqCst);
        *self.state.lock().await = ConnState::Closing;
        self.renewer.close().await;
        self.reconnect_cancel.lock().await.cancel();

        let tracking = self.tracking.lock().await.clone();
        {
            let mut guard = self.write.lock().await;
            if let Some(sink) = guard.as_mut() {
                let close_frame = Message::Close(Some(CloseFrame { code: CloseCode::Normal, reason: "".into() }));
                let send_close = sink.send(close_frame);
                let _ = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RelayError::cancelled(tracking)),
                    r = send_close => r,
                };
            }
        }

        if let Some(handle) = self.pump_handle.lock().await.take() {
            let _ = handle.await;
        }

        *self.state.lock().await = ConnState::Closed;
        Ok(())
    }

    pub async fn tracking(&self) -> TrackingContext {
        self.tracking.lock().await.clone()
    }
}

fn path_with_leading_slash(path: &str) -> String {
    if path.starts_with('/') { path.to_string() } else { format!("/{path}") }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_with_leading_slash_prefixes_bare_paths() {
        assert_eq!(path_with_leading_slash("hc1"), "/hc1");
        assert_eq!(path_with_leading_slash("/hc1"), "/hc1");
    }
}
