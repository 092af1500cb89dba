//! Tracking context: stable correlation identity for log lines and error
//! messages, propagated across reconnects (§3).

use std::fmt;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Immutable identity used to correlate a connection's log output and error
/// messages across reconnects.
///
/// `tracking_id` starts equal to `activity_id` but may carry a `_G<n>`
/// service-assigned suffix; [`TrackingContext::strip_suffix`] removes it
/// before every reconnect attempt so the activity id survives the round
/// trip (§8 invariant 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingContext {
    activity_id: Uuid,
    tracking_id: String,
    address: Option<String>,
}

impl TrackingContext {
    /// Creates a fresh context with a new random activity id.
    pub fn new(address: Option<String>) -> Self {
        let activity_id = Uuid::new_v4();
        Self {
            activity_id,
            tracking_id: activity_id.to_string(),
            address,
        }
    }

    /// Creates a context from an existing tracking id string (e.g. echoed
    /// back by the service), extracting the activity id as its prefix up to
    /// the first `_G` suffix, if any.
    pub fn create(tracking_id: impl Into<String>, address: Option<String>) -> Self {
        let tracking_id = tracking_id.into();
        let activity_part = Self::strip_suffix(&tracking_id);
        let activity_id = Uuid::parse_str(&activity_part).unwrap_or_else(|_| Uuid::new_v4());
        Self {
            activity_id,
            tracking_id,
            address,
        }
    }

    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Removes a trailing `_G<n>` suffix (service-assigned dedup marker) from
    /// a tracking id, returning the bare activity id string. Pure function,
    /// usable independent of a `TrackingContext` instance (§8 invariant 4).
    pub fn strip_suffix(tracking_id: &str) -> String {
        match tracking_id.rfind("_G") {
            Some(idx) if tracking_id[idx + 2..].chars().all(|c| c.is_ascii_digit()) && idx + 2 < tracking_id.len() => {
                tracking_id[..idx].to_string()
            }
            _ => tracking_id.to_string(),
        }
    }

    /// The tracking id with any `_G<n>` suffix removed — used when building
    /// the `listen` action URL (§4.8: "id for listen must have any `_G<n>`
    /// suffix stripped").
    pub fn tracking_id_without_suffix(&self) -> String {
        Self::strip_suffix(&self.tracking_id)
    }

    /// Replaces the tracking id, typically with a service-assigned suffixed
    /// value received on an `accept`/`request` command.
    pub fn set_tracking_id(&mut self, tracking_id: impl Into<String>) {
        self.tracking_id = tracking_id.into();
    }
}

impl fmt::Display for TrackingContext {
    /// Renders the `TrackingId:<id>[, Address:<addr>], Timestamp:<iso8601>`
    /// suffix required on user-visible failures (§7).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackingId:{}", self.tracking_id)?;
        if let Some(addr) = &self.address {
            write!(f, ", Address:{addr}")?;
        }
        let ts: DateTime<Utc> = Utc::now();
        write!(f, ", Timestamp:{}", ts.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_round_trips_through_create_and_strip() {
        let ctx = TrackingContext::new(None);
        let suffixed = format!("{}_G3", ctx.tracking_id());
        let recreated = TrackingContext::create(suffixed, None);
        assert_eq!(
            TrackingContext::strip_suffix(recreated.tracking_id()),
            ctx.tracking_id()
        );
    }

    #[test]
    fn strip_suffix_is_noop_without_suffix() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(TrackingContext::strip_suffix(&id), id);
    }

    #[test]
    fn strip_suffix_requires_trailing_digits() {
        let id = "abc_Gxyz".to_string();
        assert_eq!(TrackingContext::strip_suffix(&id), id);
    }

    #[test]
    fn display_contains_tracking_id() {
        let ctx = TrackingContext::new(Some("sb://ns.example.net/hc1".into()));
        let rendered = ctx.to_string();
        assert!(rendered.contains("TrackingId:"));
        assert!(rendered.contains("Address:sb://ns.example.net/hc1"));
    }
}
