//! Unified error taxonomy for the relay engine.
//!
//! Every failure that can cross a component boundary (control connection,
//! rendezvous, HTTP tunnel, client connect) is mapped into a [`RelayError`]
//! carrying one of the [`RelayErrorKind`] variants before it leaves this
//! crate's callers. Message catalogs and exception hierarchies are left to
//! the embedding application; this is the mechanism, not the wording.

use std::fmt;

use thiserror::Error;

use crate::tracking::TrackingContext;

/// The kind of failure, independent of the tracking context that caused it.
///
/// `transient()` reports whether a retry could plausibly succeed; this
/// mirrors the reconnect predicate in the control connection (§4.3): all
/// kinds are transient except the four explicitly listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorKind {
    AuthorizationFailed,
    EndpointNotFound,
    EndpointAlreadyExists,
    QuotaExceeded,
    ServerBusy,
    ConnectionLost,
    Timeout,
    Cancelled,
    Relay,
}

impl RelayErrorKind {
    /// Whether a retry of the operation that produced this error could
    /// plausibly succeed without external intervention.
    pub fn transient(self) -> bool {
        !matches!(
            self,
            RelayErrorKind::AuthorizationFailed
                | RelayErrorKind::EndpointNotFound
                | RelayErrorKind::EndpointAlreadyExists
                | RelayErrorKind::QuotaExceeded
        )
    }
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayErrorKind::AuthorizationFailed => "AuthorizationFailed",
            RelayErrorKind::EndpointNotFound => "EndpointNotFound",
            RelayErrorKind::EndpointAlreadyExists => "EndpointAlreadyExists",
            RelayErrorKind::QuotaExceeded => "QuotaExceeded",
            RelayErrorKind::ServerBusy => "ServerBusy",
            RelayErrorKind::ConnectionLost => "ConnectionLost",
            RelayErrorKind::Timeout => "Timeout",
            RelayErrorKind::Cancelled => "Cancelled",
            RelayErrorKind::Relay => "Relay",
        };
        f.write_str(s)
    }
}

/// A taxonomy error carrying the tracking context of the operation that
/// failed, per §7: user-visible failures always include a trackable suffix.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message} ({tracking})")]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
    pub tracking: TrackingContext,
    /// The HTTP upgrade-response status that produced this error, when the
    /// failure came from a WebSocket handshake rejection. Lets callers
    /// branch on the actual status rather than matching on `message` text.
    pub http_status: Option<u16>,
}

impl RelayError {
    pub fn new(kind: RelayErrorKind, message: impl Into<String>, tracking: TrackingContext) -> Self {
        Self {
            kind,
            message: message.into(),
            tracking,
            http_status: None,
        }
    }

    pub fn from_http_status(kind: RelayErrorKind, status: u16, message: impl Into<String>, tracking: TrackingContext) -> Self {
        Self {
            kind,
            message: message.into(),
            tracking,
            http_status: Some(status),
        }
    }

    pub fn transient(&self) -> bool {
        self.kind.transient()
    }

    pub fn cancelled(tracking: TrackingContext) -> Self {
        Self::new(RelayErrorKind::Cancelled, "operation cancelled", tracking)
    }

    pub fn timeout(tracking: TrackingContext) -> Self {
        Self::new(RelayErrorKind::Timeout, "operation timed out", tracking)
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

/// Maps an HTTP upgrade-response status code to a [`RelayErrorKind`] per §6.4.
///
/// `is_reject_rendezvous` distinguishes the one context in which HTTP 410 is
/// a *success* signal (the rendezvous reject path, §4.4) rather than a
/// generic `Relay` failure.
pub fn kind_from_http_status(status: u16, is_reject_rendezvous: bool) -> Option<RelayErrorKind> {
    match status {
        401 => Some(RelayErrorKind::AuthorizationFailed),
        403 => Some(RelayErrorKind::QuotaExceeded),
        404 | 204 => Some(RelayErrorKind::EndpointNotFound),
        408 | 504 => Some(RelayErrorKind::Timeout),
        409 => Some(RelayErrorKind::EndpointAlreadyExists),
        410 if is_reject_rendezvous => None,
        410 => Some(RelayErrorKind::Relay),
        503 => Some(RelayErrorKind::ServerBusy),
        200..=299 => None,
        _ => Some(RelayErrorKind::Relay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds_are_not_transient() {
        for kind in [
            RelayErrorKind::AuthorizationFailed,
            RelayErrorKind::EndpointNotFound,
            RelayErrorKind::EndpointAlreadyExists,
            RelayErrorKind::QuotaExceeded,
        ] {
            assert!(!kind.transient(), "{kind} should not be transient");
        }
    }

    #[test]
    fn other_kinds_are_transient() {
        for kind in [
            RelayErrorKind::ServerBusy,
            RelayErrorKind::ConnectionLost,
            RelayErrorKind::Timeout,
            RelayErrorKind::Cancelled,
            RelayErrorKind::Relay,
        ] {
            assert!(kind.transient(), "{kind} should be transient");
        }
    }

    #[test]
    fn http_status_mapping_matches_table() {
        assert_eq!(
            kind_from_http_status(401, false),
            Some(RelayErrorKind::AuthorizationFailed)
        );
        assert_eq!(
            kind_from_http_status(404, false),
            Some(RelayErrorKind::EndpointNotFound)
        );
        assert_eq!(
            kind_from_http_status(204, false),
            Some(RelayErrorKind::EndpointNotFound)
        );
        assert_eq!(kind_from_http_status(409, false), Some(RelayErrorKind::EndpointAlreadyExists));
        assert_eq!(kind_from_http_status(503, false), Some(RelayErrorKind::ServerBusy));
        assert_eq!(kind_from_http_status(500, false), Some(RelayErrorKind::Relay));
    }

    #[test]
    fn reject_rendezvous_410_is_success() {
        assert_eq!(kind_from_http_status(410, true), None);
        assert_eq!(kind_from_http_status(410, false), Some(RelayErrorKind::Relay));
    }

    #[test]
    fn from_http_status_carries_the_status_code() {
        let e = RelayError::from_http_status(RelayErrorKind::Relay, 410, "upgrade rejected", TrackingContext::new(None));
        assert_eq!(e.http_status, Some(410));
        assert!(RelayError::new(RelayErrorKind::Relay, "boom", TrackingContext::new(None)).http_status.is_none());
    }
}
