//! Security tokens and the external `TokenProvider` contract (§3, §6.1).
//!
//! The token *sources* (SAS key signing, AAD, managed identity) are external
//! collaborators per §1; this module only defines the `TokenProvider` trait
//! the rest of the engine depends on, plus the two concrete token shapes
//! (SAS and JWT) and the helpers needed to synthesize/inspect them.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use sha2::Sha256;

/// An opaque bearer token plus its audience and absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken {
    pub token_string: String,
    pub audience: String,
    pub expires_at_utc: DateTime<Utc>,
}

impl SecurityToken {
    pub fn new(token_string: impl Into<String>, audience: impl Into<String>, expires_at_utc: DateTime<Utc>) -> Self {
        Self {
            token_string: token_string.into(),
            audience: audience.into(),
            expires_at_utc,
        }
    }

    /// A token is valid strictly before its expiry (§4.2 rationale: the
    /// renewer adds no extra safety margin of its own).
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at_utc
    }
}

/// External collaborator: given an audience and a requested lifetime,
/// produces a currently-valid [`SecurityToken`].
///
/// Implementations (SAS, AAD, managed identity) live outside this crate;
/// this trait is the seam the renewer (`relay-listener::renewer`) depends
/// on.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, audience: &str, valid_for: Duration) -> Result<SecurityToken, TokenProviderError>;
}

#[derive(Debug, thiserror::Error)]
#[error("token provider failed: {0}")]
pub struct TokenProviderError(pub String);

const FRAGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'%').add(b'&').add(b'=');

/// Synthesizes a `SharedAccessSignature sr=...&sig=...&se=...&skn=...` token
/// text from a key name and HMAC-SHA256 key, per §3.
pub fn build_sas_token(
    audience: &str,
    key_name: &str,
    key: &[u8],
    valid_for: Duration,
    now: DateTime<Utc>,
) -> SecurityToken {
    let expires_at_utc = now + chrono::Duration::from_std(valid_for).unwrap_or_default();
    let expiry_epoch = expires_at_utc.timestamp();
    let encoded_resource = utf8_percent_encode(audience, FRAGMENT).to_string();
    let string_to_sign = format!("{encoded_resource}\n{expiry_epoch}");

    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(string_to_sign.as_bytes());
    let signature = mac.finalize().into_bytes();
    let signature_b64 = base64::engine::general_purpose::STANDARD.encode(signature);
    let encoded_signature = utf8_percent_encode(&signature_b64, FRAGMENT).to_string();

    let token_string = format!(
        "SharedAccessSignature sr={encoded_resource}&sig={encoded_signature}&se={expiry_epoch}&skn={key_name}"
    );

    SecurityToken::new(token_string, audience, expires_at_utc)
}

/// Extracts the `exp` claim (seconds since epoch) from an opaque, unverified
/// JWT's base64url-encoded payload segment. Verification is the issuer's
/// responsibility; this engine only needs to know when to renew (§3).
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()?;
    let value: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    let exp = value.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sas_token_has_expected_shape() {
        let now = Utc::now();
        let token = build_sas_token(
            "sb://ns.example.net/hc1",
            "RootManageSharedAccessKey",
            b"super-secret-key",
            Duration::from_secs(3600),
            now,
        );
        assert!(token.token_string.starts_with("SharedAccessSignature sr="));
        assert!(token.token_string.contains("&sig="));
        assert!(token.token_string.contains("&se="));
        assert!(token.token_string.contains("&skn=RootManageSharedAccessKey"));
        assert_eq!(token.audience, "sb://ns.example.net/hc1");
    }

    #[test]
    fn jwt_expiry_extracts_exp_claim() {
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"alg\":\"none\"}");
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"{\"exp\":1700000000}");
        let token = format!("{header}.{payload}.sig");
        let expiry = jwt_expiry(&token).expect("exp claim should parse");
        assert_eq!(expiry.timestamp(), 1_700_000_000);
    }

    #[test]
    fn jwt_expiry_returns_none_for_malformed_token() {
        assert!(jwt_expiry("not-a-jwt").is_none());
    }

    #[test]
    fn is_valid_at_respects_expiry_boundary() {
        let now = Utc::now();
        let token = SecurityToken::new("t", "aud", now + chrono::Duration::seconds(5));
        assert!(token.is_valid_at(now));
        assert!(!token.is_valid_at(now + chrono::Duration::seconds(10)));
    }
}
