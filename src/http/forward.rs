//! Request forwarding: one inbound request, one upstream exchange.
//!
//! # Responsibilities
//! - Build the outbound request (path, query, headers, streamed body)
//! - Lease an upstream connection and send the request under the exchange deadline
//! - Stream the response back with hop-by-hop headers removed
//! - Hand upgraded connections to the byte relay
//!
//! # Design Decisions
//! - Bodies are never buffered; the inbound body is the outbound body
//! - The lease travels with the response body and is released or
//!   invalidated when that body ends
//! - Any failure before the response head maps to a `ProxyError`; after
//!   that the only signal left is ending the body with an error

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode, Uri, Version};
use axum::response::Response;
use tokio::time::Instant;

use crate::error::ProxyError;
use crate::http::body::ExchangeBody;
use crate::http::headers::{self, ClientInfo};
use crate::http::upgrade;
use crate::routing::ForwardingRule;
use crate::upstream::ConnectionPool;

/// Forwards requests to upstreams through a shared connection pool.
pub struct Forwarder {
    pool: Arc<ConnectionPool>,
    exchange_timeout: Duration,
}

impl Forwarder {
    pub fn new(pool: Arc<ConnectionPool>, exchange_timeout: Duration) -> Self {
        Self {
            pool,
            exchange_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Forward `request` to `rule`'s upstream.
    ///
    /// `prefix` is the prefix that selected `rule`; it is only used when the
    /// rule strips it from the outbound path.
    pub async fn forward(
        &self,
        mut request: Request<Body>,
        rule: &ForwardingRule,
        prefix: &str,
        client: &ClientInfo,
    ) -> Result<Response, ProxyError> {
        let started = Instant::now();
        let deadline = started + self.exchange_timeout;
        let target = rule.upstream.to_string();
        let timed_out = || ProxyError::UpstreamTimeout {
            upstream: target.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let upgrade_protocol = headers::upgrade_protocol(request.headers()).cloned();
        let client_upgrade = upgrade_protocol
            .is_some()
            .then(|| hyper::upgrade::on(&mut request));

        let outbound = build_upstream_request(request, rule, prefix, client, upgrade_protocol.as_ref())?;
        log_outbound(rule, &outbound);

        let acquire = async {
            if upgrade_protocol.is_some() {
                self.pool.acquire_dedicated(&rule.upstream, rule.allow_insecure_tls).await
            } else {
                self.pool.acquire(&rule.upstream, rule.allow_insecure_tls).await
            }
        };
        let mut lease = tokio::time::timeout_at(deadline, acquire)
            .await
            .map_err(|_| timed_out())??;

        // A cancelled or failed send drops the lease, which closes the connection.
        let mut response = tokio::time::timeout_at(deadline, lease.send(outbound))
            .await
            .map_err(|_| timed_out())??;

        if rule.verbose_logging {
            tracing::info!(
                rule = %rule.name,
                upstream = %target,
                status = %response.status(),
                headers = ?headers::Redacted(response.headers()),
                connection_id = lease.id(),
                reused = lease.is_reused(),
                "Upstream response"
            );
        } else {
            tracing::debug!(
                rule = %rule.name,
                upstream = %target,
                status = %response.status(),
                connection_id = lease.id(),
                reused = lease.is_reused(),
                "Upstream response"
            );
        }

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                lease.detach();
                upgrade::spawn_relay(client_upgrade, upstream_upgrade, rule.name.clone(), target);

                let (mut parts, _) = response.into_parts();
                headers::downstream_response_headers(&mut parts.headers, true);
                return Ok(Response::from_parts(parts, Body::empty()));
            }
        }

        // An upgrade the upstream declined still used a dedicated connection.
        let keep_alive = upgrade_protocol.is_none()
            && headers::is_keep_alive(response.version(), response.headers());
        let (mut parts, incoming) = response.into_parts();
        headers::downstream_response_headers(&mut parts.headers, false);
        let body = ExchangeBody::new(incoming, lease, keep_alive, started, deadline, target);
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

fn build_upstream_request(
    request: Request<Body>,
    rule: &ForwardingRule,
    prefix: &str,
    client: &ClientInfo,
    upgrade: Option<&HeaderValue>,
) -> Result<Request<Body>, ProxyError> {
    let (parts, body) = request.into_parts();
    let uri = upstream_uri(&parts.uri, prefix, rule.strip_prefix)?;
    let headers = headers::upstream_request_headers(&parts.headers, rule, client, upgrade)?;

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method;
    *outbound.uri_mut() = uri;
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Origin-form target for the upstream: path (optionally without `prefix`) plus query.
fn upstream_uri(uri: &Uri, prefix: &str, strip_prefix: bool) -> Result<Uri, ProxyError> {
    let path = uri.path();
    if !path.starts_with('/') {
        return Err(ProxyError::MalformedRequest(format!(
            "request target {uri} is not origin-form"
        )));
    }

    let path = if strip_prefix {
        match path.strip_prefix(prefix) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            Some(rest) => format!("/{rest}"),
            None => path.to_string(),
        }
    } else {
        path.to_string()
    };

    let target = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    target
        .parse()
        .map_err(|e| ProxyError::MalformedRequest(format!("invalid request target: {e}")))
}

fn log_outbound(rule: &ForwardingRule, request: &Request<Body>) {
    if rule.verbose_logging {
        tracing::info!(
            rule = %rule.name,
            upstream = %rule.upstream,
            method = %request.method(),
            uri = %request.uri(),
            headers = ?headers::Redacted(request.headers()),
            "Forwarding request"
        );
    } else {
        tracing::debug!(
            rule = %rule.name,
            upstream = %rule.upstream,
            method = %request.method(),
            uri = %request.uri(),
            "Forwarding request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Upstream;

    fn target(uri: &str, prefix: &str, strip: bool) -> String {
        upstream_uri(&uri.parse().unwrap(), prefix, strip)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_path_and_query_preserved() {
        assert_eq!(target("/api/widgets?page=2&q=a%20b", "/api", false), "/api/widgets?page=2&q=a%20b");
        assert_eq!(target("http://localhost:4200/api/widgets", "/api", false), "/api/widgets");
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(target("/api/widgets?page=2", "/api", true), "/widgets?page=2");
        assert_eq!(target("/api", "/api", true), "/");
        assert_eq!(target("/api?x=1", "/api", true), "/?x=1");
        assert_eq!(target("/static/app.js", "/static/", true), "/app.js");
        assert_eq!(target("/anything", "/", true), "/anything");
    }

    #[test]
    fn test_non_origin_form_rejected() {
        let result = upstream_uri(&"*".parse().unwrap(), "/", false);
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
    }

    #[test]
    fn test_build_upstream_request() {
        let rule = ForwardingRule::new(["/api"], Upstream::parse("http://localhost:8081").unwrap());
        let client = ClientInfo {
            addr: "127.0.0.1:40000".parse().unwrap(),
            proto: "http",
        };
        let request = Request::builder()
            .method("POST")
            .uri("/api/widgets?id=7")
            .header("host", "localhost:4200")
            .header("connection", "keep-alive")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let outbound = build_upstream_request(request, &rule, "/api", &client, None).unwrap();
        assert_eq!(outbound.method(), "POST");
        assert_eq!(outbound.uri(), "/api/widgets?id=7");
        assert_eq!(outbound.headers()["host"], "localhost:4200");
        assert_eq!(outbound.headers()["content-type"], "application/json");
        assert!(!outbound.headers().contains_key("connection"));
        assert_eq!(outbound.headers()["x-forwarded-for"], "127.0.0.1");
    }
}
