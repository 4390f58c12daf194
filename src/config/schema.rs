//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limits).
    pub listener: ListenerConfig,

    /// Forwarding rules, path prefixes to upstreams.
    pub rules: Vec<RuleConfig>,

    /// Upstream for requests no rule matches. Unset means 404.
    pub fallback: Option<String>,

    /// Upstream connection pool settings.
    pub pool: PoolConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent inbound connections (backpressure).
    pub max_connections: usize,

    /// How long shutdown waits for open connections to finish.
    pub drain_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
            drain_timeout_secs: 30,
        }
    }
}

/// One forwarding rule.
///
/// Field aliases accept the dev-server proxy names (`context`, `target`,
/// `change_origin`).
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RuleConfig {
    /// Rule identifier for logging/metrics. Defaults to the first prefix.
    #[serde(default)]
    pub name: Option<String>,

    /// Path prefixes routed by this rule.
    #[serde(alias = "context")]
    pub path_prefixes: Vec<String>,

    /// Upstream URL, e.g. "http://localhost:8081".
    #[serde(alias = "target")]
    pub upstream: String,

    /// Send the upstream authority as `Host` instead of the caller's.
    #[serde(default, alias = "change_origin")]
    pub rewrite_origin: bool,

    /// Skip certificate validation for HTTPS upstreams.
    #[serde(default)]
    pub allow_insecure_tls: bool,

    /// Log request and response headers for this rule at info level.
    #[serde(default)]
    pub verbose_logging: bool,

    /// Remove the matched prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
}

/// Upstream connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per upstream.
    pub max_idle_per_upstream: usize,

    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_upstream: 8,
            idle_timeout_secs: 90,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Whole-exchange budget (connect + full response) in seconds.
    pub exchange_secs: u64,

    /// Time allowed for an inbound client to send request headers.
    pub header_read_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn exchange(&self) -> Duration {
        Duration::from_secs(self.exchange_secs)
    }

    pub fn header_read(&self) -> Duration {
        Duration::from_secs(self.header_read_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            exchange_secs: 30,
            header_read_secs: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Rules and fallback given on the command line.
///
/// Applied on top of the file at startup and again after every reload, so a
/// reload never drops them.
#[derive(Debug, Clone, Default)]
pub struct RuleOverrides {
    pub rules: Vec<RuleConfig>,
    pub fallback: Option<String>,
}

impl RuleOverrides {
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(fallback) = &self.fallback {
            config.fallback = Some(fallback.clone());
        }
        config.rules.extend(self.rules.iter().cloned());
    }
}
