//! Duplex byte stream over one WebSocket (§4.7, C7).
//!
//! `shutdown()` sends a close-output frame but keeps the read side draining
//! until the peer's own close is observed; `close()` terminates both
//! directions. Each carries its own deadline, derived from `WriteTimeout`/
//! `ReadTimeout` respectively (§4.7 invariant).

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_core::{RelayError, RelayErrorKind, TrackingContext};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::websocket::RelayWsStream;

/// Whether application writes go out as WebSocket `Text` or `Binary`
/// frames (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfState {
    Open,
    ShutDown,
    Closed,
}

/// A duplex byte stream wrapping one WebSocket connection — either an
/// accepted rendezvous socket or a client's single-shot connect socket.
pub struct HybridConnectionStream {
    socket: Mutex<RelayWsStream>,
    write_mode: WriteMode,
    read_state: std::sync::atomic::AtomicU8,
    write_state: std::sync::atomic::AtomicU8,
    read_timeout: Duration,
    write_timeout: Duration,
    tracking: TrackingContext,
    read_buf: Mutex<Vec<u8>>,
}

fn state_to_u8(s: HalfState) -> u8 {
    match s {
        HalfState::Open => 0,
        HalfState::ShutDown => 1,
        HalfState::Closed => 2,
    }
}

fn u8_to_state(v: u8) -> HalfState {
    match v {
        0 => HalfState::Open,
        1 => HalfState::ShutDown,
        _ => HalfState::Closed,
    }
}

impl HybridConnectionStream {
    pub fn new(socket: RelayWsStream, write_mode: WriteMode, tracking: TrackingContext) -> Self {
        Self {
            socket: Mutex::new(socket),
            write_mode,
            read_state: std::sync::atomic::AtomicU8::new(state_to_u8(HalfState::Open)),
            write_state: std::sync::atomic::AtomicU8::new(state_to_u8(HalfState::Open)),
            read_timeout: Duration::from_secs(70),
            write_timeout: Duration::from_secs(70),
            tracking,
            read_buf: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeouts(mut self, read_timeout: Duration, write_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    pub fn set_write_mode(&mut self, mode: WriteMode) {
        self.write_mode = mode;
    }

    /// Reads up to `buf.len()` bytes. Returns `Ok(0)` once the peer's close
    /// has been observed and no more data remains.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        {
            let mut pending = self.read_buf.lock().await;
            if !pending.is_empty() {
                let n = buf.len().min(pending.len());
                buf[..n].copy_from_slice(&pending[..n]);
                pending.drain(..n);
                return Ok(n);
            }
        }

        if u8_to_state(self.read_state.load(std::sync::atomic::Ordering::Acquire)) == HalfState::Closed {
            return Ok(0);
        }

        let mut socket = self.socket.lock().await;
        let result = tokio::time::timeout(self.read_timeout, socket.next()).await;
        let message = match result {
            Err(_) => return Err(RelayError::new(RelayErrorKind::Timeout, "read timed out", self.tracking.clone())),
            Ok(None) => {
                self.read_state.store(state_to_u8(HalfState::Closed), std::sync::atomic::Ordering::Release);
                return Ok(0);
            }
            Ok(Some(Err(e))) => return Err(RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), self.tracking.clone())),
            Ok(Some(Ok(m))) => m,
        };

        match message {
            Message::Text(t) => self.deliver(buf, t.as_bytes()).await,
            Message::Binary(b) => self.deliver(buf, &b).await,
            Message::Close(_) => {
                self.read_state.store(state_to_u8(HalfState::Closed), std::sync::atomic::Ordering::Release);
                Ok(0)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(0),
        }
    }

    async fn deliver(&self, buf: &mut [u8], data: &[u8]) -> Result<usize, RelayError> {
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        if n < data.len() {
            let mut pending = self.read_buf.lock().await;
            pending.extend_from_slice(&data[n..]);
        }
        Ok(n)
    }

    /// Writes `data` as one frame in the stream's `WriteMode`.
    pub async fn write(&self, data: &[u8]) -> Result<usize, RelayError> {
        if u8_to_state(self.write_state.load(std::sync::atomic::Ordering::Acquire)) != HalfState::Open {
            return Err(RelayError::new(RelayErrorKind::ConnectionLost, "write side is shut down", self.tracking.clone()));
        }

        let message = match self.write_mode {
            WriteMode::Text => Message::Text(String::from_utf8_lossy(data).to_string().into()),
            WriteMode::Binary => Message::Binary(data.to_vec().into()),
        };

        let mut socket = self.socket.lock().await;
        let send = socket.send(message);
        match tokio::time::timeout(self.write_timeout, send).await {
            Err(_) => Err(RelayError::new(RelayErrorKind::Timeout, "write timed out", self.tracking.clone())),
            Ok(Err(e)) => Err(RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), self.tracking.clone())),
            Ok(Ok(())) => Ok(data.len()),
        }
    }

    /// Sends a close-output frame; reads continue to drain until the peer's
    /// close is observed.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        if u8_to_state(self.write_state.load(std::sync::atomic::Ordering::Acquire)) != HalfState::Open {
            return Ok(());
        }
        let mut socket = self.socket.lock().await;
        let frame = Message::Close(Some(CloseFrame { code: CloseCode::Normal, reason: "".into() }));
        let send = socket.send(frame);
        match tokio::time::timeout(self.write_timeout, send).await {
            Err(_) => Err(RelayError::new(RelayErrorKind::Timeout, "shutdown timed out", self.tracking.clone())),
            Ok(Err(e)) => Err(RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), self.tracking.clone())),
            Ok(Ok(())) => {
                self.write_state.store(state_to_u8(HalfState::ShutDown), std::sync::atomic::Ordering::Release);
                Ok(())
            }
        }
    }

    /// Full close-output and close: both directions become terminal.
    pub async fn close(&self) -> Result<(), RelayError> {
        self.shutdown().await.ok();
        let mut socket = self.socket.lock().await;
        let close = tokio::time::timeout(self.read_timeout, socket.close(None)).await;
        self.read_state.store(state_to_u8(HalfState::Closed), std::sync::atomic::Ordering::Release);
        self.write_state.store(state_to_u8(HalfState::Closed), std::sync::atomic::Ordering::Release);
        match close {
            Err(_) => Err(RelayError::new(RelayErrorKind::Timeout, "close timed out", self.tracking.clone())),
            Ok(Err(e)) => Err(RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), self.tracking.clone())),
            Ok(Ok(())) => Ok(()),
        }
    }

    pub fn tracking(&self) -> &TrackingContext {
        &self.tracking
    }
}
