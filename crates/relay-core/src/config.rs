//! Engine tuning knobs shared by listener and client (§3, §5).
//!
//! These are *engine* settings (timeouts, buffer sizes, backoff schedule) —
//! not connection-string or token-source configuration, both of which are
//! out of scope per §1 and supplied programmatically by the embedder.

use std::time::Duration;

/// Fixed reconnect backoff schedule (§3, §4.3): index resets to `-1`
/// (`None`) on every successful `Online` transition and saturates at the
/// last slot.
pub const RECONNECT_SCHEDULE: &[Duration] = &[
    Duration::from_secs(0),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Token renewal floor: any computed interval below this is clamped up to
/// it (§4.2).
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Maximum size the HTTP tunnel buffers on the control channel before it
/// is forced onto a rendezvous WebSocket (§4.5).
pub const MAX_CONTROL_BODY_BYTES: usize = 64 * 1024;

/// How long a buffered-but-unflushed response may sit before the tunnel
/// forces a rendezvous (§4.5).
pub const RESPONSE_FLUSH_DELAY: Duration = Duration::from_secs(2);

/// Deadline for opening a rendezvous WebSocket, independent of
/// `operation_timeout` (§4.4).
pub const RENDEZVOUS_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// WebSocket keep-alive ping interval (§5, §6.1).
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(210);

/// Returns the index'th backoff delay, saturating at the last entry.
pub fn backoff_delay(index: usize) -> Duration {
    RECONNECT_SCHEDULE[index.min(RECONNECT_SCHEDULE.len() - 1)]
}

/// Tuning for a [`relay_listener`]-style `ControlConnection`.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Deadline for listener management operations (open/close).
    pub operation_timeout: Duration,
    /// Receive-pump buffer size; a single logical command exceeding this is
    /// a protocol violation (§4.3).
    pub connection_buffer_bytes: usize,
    /// Reconnect backoff schedule; defaults to [`RECONNECT_SCHEDULE`].
    pub reconnect_schedule: Vec<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(60),
            connection_buffer_bytes: 64 * 1024,
            reconnect_schedule: RECONNECT_SCHEDULE.to_vec(),
        }
    }
}

impl ListenerConfig {
    pub fn backoff_delay(&self, index: usize) -> Duration {
        if self.reconnect_schedule.is_empty() {
            return Duration::from_secs(0);
        }
        self.reconnect_schedule[index.min(self.reconnect_schedule.len() - 1)]
    }
}

/// Tuning for [`relay_client`]'s single-shot connect.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the single-shot connect (default 70 s per §5).
    pub operation_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { operation_timeout: Duration::from_secs(70) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_saturates_at_last_slot() {
        assert_eq!(backoff_delay(0), Duration::from_secs(0));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn listener_config_default_matches_schedule() {
        let cfg = ListenerConfig::default();
        assert_eq!(cfg.backoff_delay(3), Duration::from_secs(5));
    }
}
