//! Forwarding rule and upstream definitions.

use std::fmt;
use std::net::IpAddr;

use url::{Host, Url};

use crate::error::ProxyError;

/// Transport scheme used to reach an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Target authority a rule forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    scheme: Scheme,
    /// Host name or IP literal, without IPv6 brackets.
    host: String,
    port: u16,
}

impl Upstream {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse an upstream URL such as `http://localhost:8081`.
    ///
    /// The URL must not carry a path, query, or credentials.
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &str| {
            ProxyError::ConfigurationConflict(format!("invalid upstream {target:?}: {reason}"))
        };

        let url = Url::parse(target).map_err(|e| invalid(&e.to_string()))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(invalid(&format!("unsupported scheme {other:?}"))),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("missing host")),
        };
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("credentials are not supported"));
        }
        if url.path() != "/" || url.query().is_some() {
            return Err(invalid("path and query are not supported"));
        }
        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| scheme.default_port());

        Ok(Self { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn host_literal(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{addr}]"),
            _ => self.host.clone(),
        }
    }

    /// `host:port`, used to open connections and key the pool.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host_literal(), self.port)
    }

    /// Value for the `Host` header; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host_literal()
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

/// Maps a set of path prefixes to one upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    /// Label for logs and metrics.
    pub name: String,
    /// Prefixes this rule matches; each starts with `/`.
    pub path_prefixes: Vec<String>,
    pub upstream: Upstream,
    /// Replace `Host` with the upstream authority instead of keeping the inbound one.
    pub rewrite_origin: bool,
    /// Skip upstream certificate validation.
    pub allow_insecure_tls: bool,
    /// Diagnostic verbosity only.
    pub verbose_logging: bool,
    /// Remove the matched prefix from the outbound path.
    pub strip_prefix: bool,
}

impl ForwardingRule {
    pub fn new<I, S>(path_prefixes: I, upstream: Upstream) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path_prefixes: Vec<String> = path_prefixes.into_iter().map(Into::into).collect();
        let name = path_prefixes.first().cloned().unwrap_or_default();
        Self {
            name,
            path_prefixes,
            upstream,
            rewrite_origin: false,
            allow_insecure_tls: false,
            verbose_logging: false,
            strip_prefix: false,
        }
    }

    /// Rule used for requests that match nothing: forward to `upstream` as-is.
    pub fn passthrough(upstream: Upstream) -> Self {
        let mut rule = Self::new(["/"], upstream);
        rule.name = "fallback".to_string();
        rule
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_rewrite_origin(mut self, enabled: bool) -> Self {
        self.rewrite_origin = enabled;
        self
    }

    pub fn with_insecure_tls(mut self, enabled: bool) -> Self {
        self.allow_insecure_tls = enabled;
        self
    }

    pub fn with_verbose_logging(mut self, enabled: bool) -> Self {
        self.verbose_logging = enabled;
        self
    }

    pub fn with_strip_prefix(mut self, enabled: bool) -> Self {
        self.strip_prefix = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream() {
        let upstream = Upstream::parse("http://localhost:8081").unwrap();
        assert_eq!(upstream.scheme(), Scheme::Http);
        assert_eq!(upstream.host(), "localhost");
        assert_eq!(upstream.port(), 8081);
        assert_eq!(upstream.authority(), "localhost:8081");
        assert_eq!(upstream.host_header(), "localhost:8081");
        assert_eq!(upstream.to_string(), "http://localhost:8081");
    }

    #[test]
    fn test_parse_upstream_default_ports() {
        let https = Upstream::parse("https://example.com").unwrap();
        assert_eq!(https.port(), 443);
        assert_eq!(https.host_header(), "example.com");
        assert_eq!(https.authority(), "example.com:443");

        let http = Upstream::parse("http://example.com/").unwrap();
        assert_eq!(http.port(), 80);
    }

    #[test]
    fn test_parse_upstream_ipv6() {
        let upstream = Upstream::parse("http://[::1]:9000").unwrap();
        assert_eq!(upstream.host(), "::1");
        assert_eq!(upstream.authority(), "[::1]:9000");
    }

    #[test]
    fn test_parse_upstream_rejects_invalid() {
        for target in [
            "localhost:8081",
            "ftp://example.com",
            "http://example.com/base",
            "http://user:pw@example.com",
            "not a url",
        ] {
            let err = Upstream::parse(target).unwrap_err();
            assert!(
                matches!(err, ProxyError::ConfigurationConflict(_)),
                "{target} should be rejected"
            );
        }
    }

    #[test]
    fn test_rule_defaults() {
        let rule = ForwardingRule::new(["/api", "/auth"], Upstream::parse("http://localhost:8081").unwrap());
        assert_eq!(rule.name, "/api");
        assert!(!rule.rewrite_origin);
        assert!(!rule.allow_insecure_tls);
        assert!(!rule.strip_prefix);
    }
}
