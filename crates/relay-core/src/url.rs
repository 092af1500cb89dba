//! Bit-exact URL construction and reserved-parameter stripping (§4.8, §6.1).

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use url::Url;

/// Query-parameter prefix reserved for the library's own use. Stripped
/// case-insensitively from user queries; emitted with exact case.
pub const RESERVED_PREFIX: &str = "sb-hc-";

const WWW_FORM: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'#').add(b'<').add(b'>').add(b'`');

/// The three actions a wire URL can be built for (§4.8, §6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Listen,
    Accept,
    Connect,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Listen => "listen",
            Action::Accept => "accept",
            Action::Connect => "connect",
        }
    }
}

/// Strips every query key matching `sb-hc-*` (case-insensitive), preserving
/// the relative order of the remaining keys and the exact byte encoding of
/// their values (§8 invariant 5).
pub fn filter_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with(RESERVED_PREFIX))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Builds the wire URL for a listener/rendezvous/client action.
///
/// `host`/`port`/`path`/`query` describe the logical `sb://` endpoint;
/// `query` is the user-supplied raw query string (may be empty). Per §4.8:
/// - `path` is prefixed with `/` if absent, then the whole path is prefixed
///   with `/$hc`.
/// - user query parameters with the reserved prefix are stripped.
/// - port is emitted only if not the default for `wss` (443).
/// - the result ends with exactly one `?`; reserved parameters are appended
///   after user parameters, with `sb-hc-id` last.
pub fn build_url(
    host: &str,
    port: Option<u16>,
    path: &str,
    query: &str,
    action: Action,
    id: &str,
) -> String {
    let path = if path.starts_with('/') { path.to_string() } else { format!("/{path}") };
    let full_path = format!("/$hc{path}");

    let authority = match port {
        Some(p) if p != 443 => format!("{host}:{p}"),
        _ => host.to_string(),
    };

    let mut pairs = filter_query(query);
    pairs.push(("sb-hc-action".to_string(), action.as_str().to_string()));
    pairs.push(("sb-hc-id".to_string(), id.to_string()));

    let query_string: String = pairs
        .iter()
        .map(|(k, v)| {
            let ek = utf8_percent_encode(k, WWW_FORM).to_string();
            let ev = utf8_percent_encode(v, WWW_FORM).to_string();
            format!("{ek}={ev}")
        })
        .collect::<Vec<_>>()
        .join("&");

    format!("wss://{authority}{full_path}?{query_string}")
}

/// Appends `sb-hc-statusCode`/`sb-hc-statusDescription` to a rendezvous
/// address for the reject path (§4.4).
pub fn with_reject_status(address: &str, status_code: u16, status_description: &str) -> String {
    let encoded_description = utf8_percent_encode(status_description, WWW_FORM).to_string();
    let separator = if address.contains('?') { '&' } else { '?' };
    format!("{address}{separator}sb-hc-statusCode={status_code}&sb-hc-statusDescription={encoded_description}")
}

/// Parses a logical `sb://host[:port]/path[?query]` listener address into
/// its host/port/path/query parts.
pub fn parse_endpoint(address: &str) -> Result<(String, Option<u16>, String, String), url::ParseError> {
    let normalized = address.replacen("sb://", "https://", 1);
    let parsed = Url::parse(&normalized)?;
    let host = parsed.host_str().unwrap_or_default().to_string();
    let port = parsed.port();
    let path = parsed.path().to_string();
    let query = parsed.query().unwrap_or_default().to_string();
    Ok((host, port, path, query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_query_strips_reserved_keys_case_insensitively() {
        let filtered = filter_query("a=1&SB-HC-action=listen&b=2&sb-hc-id=x");
        assert_eq!(
            filtered,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn build_url_ends_with_single_question_mark_and_ordered_reserved_params() {
        let url = build_url("ns.example.net", None, "hc1", "foo=bar", Action::Listen, "abc-123");
        assert_eq!(url.matches('?').count(), 1);
        assert!(url.ends_with("sb-hc-id=abc-123"));
        assert!(url.contains("foo=bar&sb-hc-action=listen&sb-hc-id=abc-123"));
        assert!(url.starts_with("wss://ns.example.net/$hc/hc1?"));
    }

    #[test]
    fn build_url_omits_default_port() {
        let url = build_url("ns.example.net", Some(443), "hc1", "", Action::Connect, "id1");
        assert!(url.starts_with("wss://ns.example.net/$hc/hc1?"));
    }

    #[test]
    fn build_url_includes_nondefault_port() {
        let url = build_url("ns.example.net", Some(8443), "hc1", "", Action::Connect, "id1");
        assert!(url.starts_with("wss://ns.example.net:8443/$hc/hc1?"));
    }

    #[test]
    fn build_url_prefixes_bare_path() {
        let url = build_url("ns.example.net", None, "hc1", "", Action::Accept, "id1");
        assert!(url.contains("/$hc/hc1?"));
    }

    #[test]
    fn with_reject_status_appends_correct_query() {
        let url = with_reject_status("wss://host/$hc/hc1?sb-hc-action=accept", 403, "nope");
        assert!(url.contains("sb-hc-statusCode=403"));
        assert!(url.contains("sb-hc-statusDescription=nope"));
    }

    #[test]
    fn parse_endpoint_extracts_parts() {
        let (host, port, path, query) = parse_endpoint("sb://ns.example.net:9000/hc1?x=1").unwrap();
        assert_eq!(host, "ns.example.net");
        assert_eq!(port, Some(9000));
        assert_eq!(path, "/hc1");
        assert_eq!(query, "x=1");
    }
}
