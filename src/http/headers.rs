//! Header manipulation between the two legs of an exchange.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers in both directions
//! - Set `Host` per rule (preserve or rewrite to the upstream)
//! - Add X-Forwarded-For, X-Forwarded-Proto, X-Forwarded-Host
//! - Detect upgrade requests and keep-alive eligibility
//!
//! # Design Decisions
//! - Headers named in `Connection` are hop-by-hop too
//! - Existing X-Forwarded-For is extended, never replaced
//! - Credentials never reach the logs; see [`Redacted`]

use std::net::SocketAddr;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Version};

use crate::error::ProxyError;
use crate::routing::ForwardingRule;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    KEEP_ALIVE,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const SENSITIVE: [HeaderName; 4] = [
    header::AUTHORIZATION,
    header::PROXY_AUTHORIZATION,
    header::COOKIE,
    header::SET_COOKIE,
];

/// Debug view of a header map with credential values masked.
pub struct Redacted<'a>(pub &'a HeaderMap);

impl std::fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.0 {
            if SENSITIVE.contains(name) {
                map.entry(name, &"<redacted>");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

/// The inbound side of an exchange.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    /// Scheme the caller used to reach the proxy.
    pub proto: &'static str,
}

/// Lowercased tokens of every `Connection` header.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for token in connection_tokens(headers) {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// The requested protocol if this is an upgrade request (`Connection: upgrade` + `Upgrade`).
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<&HeaderValue> {
    let wants_upgrade = connection_tokens(headers).iter().any(|t| t == "upgrade");
    if wants_upgrade {
        headers.get(header::UPGRADE)
    } else {
        None
    }
}

/// Whether the upstream connection may carry another request after this response.
pub fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let tokens = connection_tokens(headers);
    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    match version {
        Version::HTTP_11 => true,
        Version::HTTP_10 => tokens.iter().any(|t| t == "keep-alive"),
        _ => false,
    }
}

/// Headers for the outbound request of an exchange.
pub fn upstream_request_headers(
    inbound: &HeaderMap,
    rule: &ForwardingRule,
    client: &ClientInfo,
    upgrade: Option<&HeaderValue>,
) -> Result<HeaderMap, ProxyError> {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);

    let original_host = inbound.get(header::HOST).cloned();
    let upstream_host = || {
        HeaderValue::from_str(&rule.upstream.host_header())
            .map_err(|e| ProxyError::Internal(format!("invalid upstream host header: {e}")))
    };

    match original_host {
        Some(host) if rule.rewrite_origin => {
            headers.insert(header::HOST, upstream_host()?);
            if !headers.contains_key(X_FORWARDED_HOST) {
                headers.insert(X_FORWARDED_HOST, host);
            }
        }
        Some(_) => {}
        // HTTP/1.1 needs a Host on the upstream leg even if the caller omitted it.
        None => {
            headers.insert(header::HOST, upstream_host()?);
        }
    }

    let caller = client.addr.ip().to_string();
    let prior: Vec<&str> = inbound
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let forwarded_for = if prior.is_empty() {
        caller
    } else {
        format!("{}, {caller}", prior.join(", "))
    };
    headers.insert(
        X_FORWARDED_FOR,
        HeaderValue::from_str(&forwarded_for)
            .map_err(|_| ProxyError::MalformedRequest("invalid X-Forwarded-For".to_string()))?,
    );
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(client.proto));

    if let Some(protocol) = upgrade {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, protocol.clone());
    }

    Ok(headers)
}

/// Filter an upstream response's headers before they go back to the caller.
///
/// A `101 Switching Protocols` answer keeps its `Upgrade` and gets `Connection: upgrade`.
pub fn downstream_response_headers(headers: &mut HeaderMap, switching_protocols: bool) {
    let protocol = headers.get(header::UPGRADE).cloned();
    strip_hop_by_hop(headers);
    if switching_protocols {
        if let Some(protocol) = protocol {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, protocol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Upstream;

    fn rule(rewrite_origin: bool) -> ForwardingRule {
        ForwardingRule::new(["/api"], Upstream::parse("http://localhost:8081").unwrap())
            .with_rewrite_origin(rewrite_origin)
    }

    fn client() -> ClientInfo {
        ClientInfo {
            addr: "10.0.0.7:51234".parse().unwrap(),
            proto: "http",
        }
    }

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("localhost:4200"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = inbound();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, X-Trace-Hop"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-trace-hop", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::PROXY_AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 2, "{headers:?}");
        assert!(headers.contains_key(header::HOST));
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_host_preserved_without_rewrite() {
        let headers = upstream_request_headers(&inbound(), &rule(false), &client(), None).unwrap();
        assert_eq!(headers[header::HOST], "localhost:4200");
        assert!(!headers.contains_key(X_FORWARDED_HOST));
    }

    #[test]
    fn test_host_rewritten_to_upstream() {
        let headers = upstream_request_headers(&inbound(), &rule(true), &client(), None).unwrap();
        assert_eq!(headers[header::HOST], "localhost:8081");
        assert_eq!(headers[X_FORWARDED_HOST], "localhost:4200");
    }

    #[test]
    fn test_missing_host_uses_upstream() {
        let mut headers = inbound();
        headers.remove(header::HOST);
        let headers = upstream_request_headers(&headers, &rule(false), &client(), None).unwrap();
        assert_eq!(headers[header::HOST], "localhost:8081");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let headers = upstream_request_headers(&inbound(), &rule(false), &client(), None).unwrap();
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");

        let mut chained = inbound();
        chained.append(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        chained.append(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.2"));
        let headers = upstream_request_headers(&chained, &rule(false), &client(), None).unwrap();
        assert_eq!(headers.get_all(X_FORWARDED_FOR).iter().count(), 1);
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.9, 198.51.100.2, 10.0.0.7");
    }

    #[test]
    fn test_upgrade_headers_kept_for_upgrade_requests() {
        let mut headers = inbound();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));

        let protocol = upgrade_protocol(&headers).cloned();
        assert_eq!(protocol.as_ref().map(|p| p.as_bytes()), Some(&b"websocket"[..]));

        let outbound = upstream_request_headers(&headers, &rule(false), &client(), protocol.as_ref()).unwrap();
        assert_eq!(outbound[header::CONNECTION], "upgrade");
        assert_eq!(outbound[header::UPGRADE], "websocket");
    }

    #[test]
    fn test_upgrade_requires_connection_token() {
        let mut headers = inbound();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, upgrade"));
        assert!(upgrade_protocol(&headers).is_some());
    }

    #[test]
    fn test_keep_alive() {
        let mut headers = HeaderMap::new();
        assert!(is_keep_alive(Version::HTTP_11, &headers));
        assert!(!is_keep_alive(Version::HTTP_10, &headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
        assert!(is_keep_alive(Version::HTTP_10, &headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert!(!is_keep_alive(Version::HTTP_11, &headers));
    }

    #[test]
    fn test_downstream_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        downstream_response_headers(&mut headers, false);
        assert_eq!(headers.len(), 1);

        let mut switching = HeaderMap::new();
        switching.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        switching.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        switching.insert("sec-websocket-accept", HeaderValue::from_static("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        downstream_response_headers(&mut switching, true);
        assert_eq!(switching[header::CONNECTION], "upgrade");
        assert_eq!(switching[header::UPGRADE], "websocket");
        assert!(switching.contains_key("sec-websocket-accept"));
    }

    #[test]
    fn test_redacted_masks_credentials() {
        let mut headers = inbound();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc123"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("id=xyz789"));

        let logged = format!("{:?}", Redacted(&headers));
        assert!(!logged.contains("s3cret"), "{logged}");
        assert!(!logged.contains("abc123"), "{logged}");
        assert!(!logged.contains("xyz789"), "{logged}");
        assert!(logged.contains("authorization"));
        assert!(logged.contains("application/json"));
    }
}
