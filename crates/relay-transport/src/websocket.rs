//! WebSocket connect wrapper implementing the transport contract of §6.2
//! concretely against `tokio-tungstenite`, including the upgrade-header set
//! and HTTP-status-to-taxonomy mapping of §6.1/§6.4.

use std::collections::HashMap;
use std::time::Duration;

use relay_core::{RelayError, RelayErrorKind, TrackingContext, kind_from_http_status};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::client::IntoClientRequest, tungstenite::handshake::client::Request};

pub type RelayWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Crate version string embedded in the `Relay-User-Agent` header (§6.1).
pub const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headers to add on top of the standard `Sec-WebSocket-*` set, which
/// `tokio-tungstenite` already emits itself during the handshake.
#[derive(Debug, Clone, Default)]
pub struct UpgradeHeaders {
    pub service_bus_authorization: Option<String>,
    pub sub_protocol: Option<String>,
    /// Caller-supplied headers to forward on the upgrade request, e.g. the
    /// `request_headers` a client may pass to `create_connection` (§4.6).
    pub extra: HashMap<String, String>,
}

fn build_request(url: &str, headers: &UpgradeHeaders) -> Result<Request, tokio_tungstenite::tungstenite::Error> {
    let mut request = url.into_client_request()?;
    let map = request.headers_mut();
    let user_agent = format!("azure-relay/{CRATE_VERSION} ({}; rust)", std::env::consts::OS);
    map.insert("Relay-User-Agent", user_agent.parse().expect("ascii header value"));
    if let Some(token) = &headers.service_bus_authorization {
        map.insert(
            "ServiceBusAuthorization",
            token.parse().map_err(|_| {
                tokio_tungstenite::tungstenite::Error::Url(
                    tokio_tungstenite::tungstenite::error::UrlError::UnsupportedUrlScheme,
                )
            })?,
        );
    }
    if let Some(proto) = &headers.sub_protocol {
        map.insert("Sec-WebSocket-Protocol", proto.parse().expect("ascii header value"));
    }
    for (name, value) in &headers.extra {
        let header_name: tokio_tungstenite::tungstenite::http::HeaderName = name
            .parse()
            .map_err(|_| tokio_tungstenite::tungstenite::Error::Url(tokio_tungstenite::tungstenite::error::UrlError::UnsupportedUrlScheme))?;
        let header_value = value
            .parse()
            .map_err(|_| tokio_tungstenite::tungstenite::Error::Url(tokio_tungstenite::tungstenite::error::UrlError::UnsupportedUrlScheme))?;
        map.insert(header_name, header_value);
    }
    Ok(request)
}

/// Opens a WebSocket within `timeout`, mapping handshake failures through
/// the §6.4 status table. `is_reject_rendezvous` should be `true` only for
/// the rendezvous reject path, where HTTP 410 is success rather than error.
pub async fn connect(
    url: &str,
    headers: &UpgradeHeaders,
    timeout: Duration,
    is_reject_rendezvous: bool,
    tracking: &TrackingContext,
) -> Result<RelayWsStream, RelayError> {
    let request = build_request(url, headers)
        .map_err(|e| RelayError::new(RelayErrorKind::Relay, e.to_string(), tracking.clone()))?;

    let connect_fut = tokio_tungstenite::connect_async(request);
    let result = tokio::time::timeout(timeout, connect_fut).await;

    let outcome = match result {
        Err(_) => return Err(RelayError::new(RelayErrorKind::Timeout, "WebSocket connect timed out", tracking.clone())),
        Ok(r) => r,
    };

    match outcome {
        Ok((stream, _response)) => Ok(stream),
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            let kind = kind_from_http_status(status, is_reject_rendezvous).unwrap_or(RelayErrorKind::Relay);
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            Err(RelayError::from_http_status(kind, status, format!("upgrade rejected with HTTP {status}: {body}"), tracking.clone()))
        }
        Err(e) => Err(RelayError::new(RelayErrorKind::ConnectionLost, e.to_string(), tracking.clone())),
    }
}

/// Opens the rendezvous **reject** path connection, where a `410 Gone`
/// upgrade response is the expected, successful outcome (§4.4). Recognized
/// by the structured `http_status` the handshake failure carries, not by
/// matching on the error message.
pub async fn connect_reject(
    url: &str,
    timeout: Duration,
    tracking: &TrackingContext,
) -> Result<(), RelayError> {
    match connect(url, &UpgradeHeaders::default(), timeout, true, tracking).await {
        Ok(_stream) => Ok(()),
        Err(e) if e.http_status == Some(410) => Ok(()),
        Err(e) => Err(e),
    }
}
