//! # Relay Client
//!
//! The single-shot send side of a Hybrid Connection (§4.6, C6):
//! [`HybridConnectionClient::create_connection`] acquires a token, opens one
//! WebSocket with `sb-hc-action=connect`, and hands back a duplex stream.
//! There is no reconnect here — a dropped connection is the caller's to
//! retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{ClientConfig, RelayError, RelayErrorKind, TokenProvider, TrackingContext, url};
use relay_transport::{HybridConnectionStream, UpgradeHeaders, WriteMode};

/// Default lifetime requested from the provider for a single-shot connect.
const TOKEN_LIFETIME: Duration = Duration::from_secs(20 * 60);

pub struct HybridConnectionClient {
    host: String,
    port: Option<u16>,
    path: String,
    query: String,
    address: String,
    provider: Arc<dyn TokenProvider>,
    config: ClientConfig,
}

impl HybridConnectionClient {
    /// `address` is a logical `sb://host[:port]/path[?query]` endpoint.
    pub fn new(address: &str, provider: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self, RelayError> {
        let (host, port, path, query) = url::parse_endpoint(address)
            .map_err(|e| RelayError::new(RelayErrorKind::Relay, e.to_string(), TrackingContext::new(None)))?;
        Ok(Self { host, port, path, query, address: address.to_string(), provider, config })
    }

    /// Opens one connection within `OperationTimeout` (default 70s). Every
    /// call generates a fresh `sb-hc-id`; the tracking id is used verbatim
    /// on the wire, without the `_G<n>`-stripping `listen` applies (§9 Open
    /// Question: this asymmetry is reproduced as-is, not treated as an
    /// invariant).
    pub async fn create_connection(
        &self,
        request_headers: Option<HashMap<String, String>>,
    ) -> Result<HybridConnectionStream, RelayError> {
        let tracking = TrackingContext::new(Some(self.address.clone()));

        let token = self
            .provider
            .get_token(&self.address, TOKEN_LIFETIME)
            .await
            .map_err(|e| RelayError::new(RelayErrorKind::AuthorizationFailed, e.0, tracking.clone()))?;

        let id = tracking.tracking_id().to_string();
        let wire_url = url::build_url(&self.host, self.port, &self.path, &self.query, url::Action::Connect, &id);
        let headers = UpgradeHeaders {
            service_bus_authorization: Some(token.token_string),
            extra: request_headers.unwrap_or_default(),
            ..Default::default()
        };

        let socket = relay_transport::connect(&wire_url, &headers, self.config.operation_timeout, false, &tracking).await?;
        Ok(HybridConnectionStream::new(socket, WriteMode::Binary, tracking))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProvider;

    #[async_trait::async_trait]
    impl TokenProvider for NullProvider {
        async fn get_token(&self, audience: &str, _valid_for: Duration) -> Result<relay_core::SecurityToken, relay_core::TokenProviderError> {
            Ok(relay_core::SecurityToken::new("t", audience, chrono::Utc::now() + chrono::Duration::hours(1)))
        }
    }

    #[test]
    fn new_parses_the_logical_endpoint() {
        let client = HybridConnectionClient::new("sb://ns.example.net/hc1", Arc::new(NullProvider), ClientConfig::default()).unwrap();
        assert_eq!(client.host, "ns.example.net");
        assert_eq!(client.path, "/hc1");
    }

    #[test]
    fn new_rejects_malformed_endpoints() {
        assert!(HybridConnectionClient::new("not a url", Arc::new(NullProvider), ClientConfig::default()).is_err());
    }
}
