//! TokenRenewer (§4.2, C2).
//!
//! Schedules one token acquisition ahead of expiry and reports the outcome
//! on a channel so [`crate::control::ControlConnection`] can forward a
//! `renewToken` command without the renewer needing a back-reference into
//! the control connection (§9 "cyclic ownership" note).

use std::sync::Arc;
use std::time::Duration;

use relay_core::{RelayError, RelayErrorKind, SecurityToken, TokenProvider, TrackingContext, config::MIN_REFRESH_INTERVAL};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default lifetime requested from the provider on every acquisition.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// Outcome of a scheduled renewal, delivered to whoever owns the receiver
/// half (the control connection).
#[derive(Debug, Clone)]
pub enum RenewalEvent {
    Renewed(SecurityToken),
    Failed(RelayError),
}

pub struct TokenRenewer {
    provider: Arc<dyn TokenProvider>,
    audience: String,
    current: Mutex<Option<SecurityToken>>,
    events: mpsc::UnboundedSender<RenewalEvent>,
    timer: Mutex<Option<JoinHandle<()>>>,
    tracking: TrackingContext,
}

impl TokenRenewer {
    /// Creates a renewer and returns it along with the receiving half of its
    /// renewal-event channel.
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        audience: impl Into<String>,
        tracking: TrackingContext,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RenewalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let renewer = Arc::new(Self {
            provider,
            audience: audience.into(),
            current: Mutex::new(None),
            events: tx,
            timer: Mutex::new(None),
            tracking,
        });
        (renewer, rx)
    }

    /// Returns a currently valid token, acquiring one and (re)arming the
    /// renewal timer if none is held or the held one has expired.
    pub async fn get_token(self: &Arc<Self>) -> Result<SecurityToken, RelayError> {
        {
            let guard = self.current.lock().await;
            if let Some(token) = guard.as_ref() {
                if token.is_valid_at(chrono::Utc::now()) {
                    return Ok(token.clone());
                }
            }
        }
        self.acquire_and_schedule().await
    }

    async fn acquire_and_schedule(self: &Arc<Self>) -> Result<SecurityToken, RelayError> {
        let token = self
            .provider
            .get_token(&self.audience, DEFAULT_TOKEN_LIFETIME)
            .await
            .map_err(|e| RelayError::new(RelayErrorKind::AuthorizationFailed, e.0, self.tracking.clone()))?;

        {
            let mut guard = self.current.lock().await;
            *guard = Some(token.clone());
        }

        self.arm_timer(token.clone());
        Ok(token)
    }

    /// `max(expiresAt - MIN_REFRESH_INTERVAL - now, 0)` — fires the renewal
    /// no later than `MIN_REFRESH_INTERVAL` before expiry (§8 invariant 10).
    fn next_refresh_delay(expires_at: chrono::DateTime<chrono::Utc>, now: chrono::DateTime<chrono::Utc>) -> Duration {
        let refresh_at = expires_at - chrono::Duration::from_std(MIN_REFRESH_INTERVAL).unwrap_or_default();
        if refresh_at <= now {
            Duration::ZERO
        } else {
            (refresh_at - now).to_std().unwrap_or(Duration::ZERO)
        }
    }

    fn arm_timer(self: &Arc<Self>, token: SecurityToken) {
        let delay = Self::next_refresh_delay(token.expires_at_utc, chrono::Utc::now());
        debug!(delay_secs = delay.as_secs(), "scheduling token renewal");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match this.provider.get_token(&this.audience, DEFAULT_TOKEN_LIFETIME).await {
                Ok(token) => {
                    {
                        let mut guard = this.current.lock().await;
                        *guard = Some(token.clone());
                    }
                    let _ = this.events.send(RenewalEvent::Renewed(token.clone()));
                    this.arm_timer(token);
                }
                Err(e) => {
                    warn!(error = %e, "token renewal failed, not rescheduling");
                    let err = RelayError::new(RelayErrorKind::AuthorizationFailed, e.0, this.tracking.clone());
                    let _ = this.events.send(RenewalEvent::Failed(err));
                }
            }
        });

        if let Ok(mut guard) = self.timer.try_lock() {
            if let Some(old) = guard.replace(handle) {
                old.abort();
            }
        }
    }

    /// Cancels the pending timer, if any.
    pub async fn close(&self) {
        let mut guard = self.timer.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_core::TokenProviderError;

    struct FixedProvider {
        lifetime: Duration,
    }

    #[async_trait]
    impl TokenProvider for FixedProvider {
        async fn get_token(&self, audience: &str, valid_for: Duration) -> Result<SecurityToken, TokenProviderError> {
            let _ = valid_for;
            Ok(SecurityToken::new("tok", audience, chrono::Utc::now() + chrono::Duration::from_std(self.lifetime).unwrap()))
        }
    }

    #[tokio::test]
    async fn get_token_returns_cached_token_while_valid() {
        let provider = Arc::new(FixedProvider { lifetime: Duration::from_secs(3600) });
        let (renewer, _rx) = TokenRenewer::new(provider, "sb://ns/hc1", TrackingContext::new(None));
        let a = renewer.get_token().await.unwrap();
        let b = renewer.get_token().await.unwrap();
        assert_eq!(a.token_string, b.token_string);
    }

    #[test]
    fn refresh_delay_floors_at_min_refresh_interval_before_expiry() {
        let now = chrono::Utc::now();
        let expires = now + chrono::Duration::minutes(6);
        let delay = TokenRenewer::next_refresh_delay(expires, now);
        assert!(delay <= Duration::from_secs(65) && delay >= Duration::from_secs(55));
    }

    #[test]
    fn refresh_delay_is_zero_when_already_past_refresh_point() {
        let now = chrono::Utc::now();
        let expires = now + chrono::Duration::minutes(2);
        assert_eq!(TokenRenewer::next_refresh_delay(expires, now), Duration::ZERO);
    }
}
