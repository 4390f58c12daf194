//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0, addresses parse)
//! - Turn rule entries into a compiled `RuleSet`, detecting conflicts
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::{ProxyConfig, RuleConfig};
use crate::error::ProxyError;
use crate::routing::{ForwardingRule, RuleSet, Upstream};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("rule #{index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error("fallback: {0}")]
    InvalidFallback(String),
}

/// Check every semantic constraint and report all failures at once.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    let positive = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
        ("timeouts.exchange_secs", config.timeouts.exchange_secs),
        ("timeouts.header_read_secs", config.timeouts.header_read_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::NotPositive { field });
        }
    }

    for (index, rule) in config.rules.iter().enumerate() {
        if let Err(e) = rule_from_config(rule) {
            errors.push(ValidationError::InvalidRule {
                index,
                reason: e.to_string(),
            });
        }
    }

    if let Some(fallback) = &config.fallback {
        if let Err(e) = Upstream::parse(fallback) {
            errors.push(ValidationError::InvalidFallback(e.to_string()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Convert one rule entry into a `ForwardingRule`.
pub fn rule_from_config(config: &RuleConfig) -> Result<ForwardingRule, ProxyError> {
    if config.path_prefixes.is_empty() {
        return Err(ProxyError::ConfigurationConflict(
            "rule declares no path prefixes".to_string(),
        ));
    }
    let upstream = Upstream::parse(&config.upstream)?;
    let mut rule = ForwardingRule::new(config.path_prefixes.iter().cloned(), upstream)
        .with_rewrite_origin(config.rewrite_origin)
        .with_insecure_tls(config.allow_insecure_tls)
        .with_verbose_logging(config.verbose_logging)
        .with_strip_prefix(config.strip_prefix);
    if let Some(name) = &config.name {
        rule = rule.with_name(name.clone());
    }
    Ok(rule)
}

/// Build the rule set described by `config`, including its fallback.
pub fn build_rule_set(config: &ProxyConfig) -> Result<RuleSet, ProxyError> {
    let rules = config
        .rules
        .iter()
        .map(rule_from_config)
        .collect::<Result<Vec<_>, _>>()?;
    let rule_set = RuleSet::new(rules)?;
    Ok(match build_fallback(config)? {
        Some(fallback) => rule_set.with_fallback(fallback),
        None => rule_set,
    })
}

/// Build the pass-through rule for unmatched requests, if one is configured.
pub fn build_fallback(config: &ProxyConfig) -> Result<Option<ForwardingRule>, ProxyError> {
    config
        .fallback
        .as_deref()
        .map(|target| Upstream::parse(target).map(ForwardingRule::passthrough))
        .transpose()
}
