//! Rule set compilation and lookup.
//!
//! # Responsibilities
//! - Validate forwarding rules at load time
//! - Store compiled prefixes, longest first
//! - Look up the matching rule for a request path
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) prefix scan (acceptable for typical rule counts)
//! - Duplicate prefixes fail construction; nothing is resolved at request time

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProxyError;
use crate::routing::matcher::{match_rule, PathPrefix, RouteMatch};
use crate::routing::rule::ForwardingRule;

/// An ordered, validated set of forwarding rules.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<ForwardingRule>>,
    /// (prefix, index into `rules`), sorted by descending prefix length.
    compiled: Vec<(PathPrefix, usize)>,
    /// Default handler for paths no rule matches.
    fallback: Option<Arc<ForwardingRule>>,
}

impl RuleSet {
    /// Validate and compile `rules`.
    ///
    /// Fails with `ConfigurationConflict` if a rule has no prefixes, a prefix
    /// does not start with `/`, or the same prefix is declared twice.
    pub fn new(rules: Vec<ForwardingRule>) -> Result<Self, ProxyError> {
        let mut owners: HashMap<&str, &str> = HashMap::new();
        let mut compiled = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            if rule.path_prefixes.is_empty() {
                return Err(ProxyError::ConfigurationConflict(format!(
                    "rule {:?} declares no path prefixes",
                    rule.name
                )));
            }
            for prefix in &rule.path_prefixes {
                if !prefix.starts_with('/') {
                    return Err(ProxyError::ConfigurationConflict(format!(
                        "rule {:?}: prefix {prefix:?} must start with '/'",
                        rule.name
                    )));
                }
                if let Some(owner) = owners.insert(prefix.as_str(), rule.name.as_str()) {
                    return Err(ProxyError::ConfigurationConflict(format!(
                        "prefix {prefix:?} is declared by both rule {owner:?} and rule {:?}",
                        rule.name
                    )));
                }
                compiled.push((PathPrefix::new(prefix.clone()), index));
            }
        }

        // Stable sort keeps declaration order among equal lengths.
        compiled.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));

        Ok(Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            compiled,
            fallback: None,
        })
    }

    /// Forward unmatched requests with `rule` instead of answering 404.
    pub fn with_fallback(mut self, rule: ForwardingRule) -> Self {
        self.fallback = Some(Arc::new(rule));
        self
    }

    pub fn fallback(&self) -> Option<&Arc<ForwardingRule>> {
        self.fallback.as_ref()
    }

    /// A rule set that matches nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn rules(&self) -> &[Arc<ForwardingRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Compiled prefixes with their owning rule, longest prefix first.
    pub fn prefixes(&self) -> impl Iterator<Item = (&PathPrefix, &Arc<ForwardingRule>)> {
        self.compiled
            .iter()
            .map(|(prefix, index)| (prefix, &self.rules[*index]))
    }

    /// Match a request path; see [`match_rule`].
    pub fn match_path(&self, path: &str) -> RouteMatch<'_> {
        match_rule(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::rule::Upstream;

    fn upstream() -> Upstream {
        Upstream::parse("http://localhost:8081").unwrap()
    }

    #[test]
    fn test_duplicate_prefix_across_rules_conflicts() {
        let result = RuleSet::new(vec![
            ForwardingRule::new(["/api"], upstream()).with_name("first"),
            ForwardingRule::new(["/api"], upstream()).with_name("second"),
        ]);
        match result {
            Err(ProxyError::ConfigurationConflict(msg)) => {
                assert!(msg.contains("first"), "{msg}");
                assert!(msg.contains("second"), "{msg}");
            }
            other => panic!("expected ConfigurationConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_prefix_within_rule_conflicts() {
        let result = RuleSet::new(vec![ForwardingRule::new(["/api", "/api"], upstream())]);
        assert!(matches!(result, Err(ProxyError::ConfigurationConflict(_))));
    }

    #[test]
    fn test_overlapping_prefixes_allowed() {
        let rules = RuleSet::new(vec![
            ForwardingRule::new(["/api"], upstream()),
            ForwardingRule::new(["/api/v2", "/api/"], upstream()),
        ])
        .unwrap();
        assert_eq!(rules.len(), 2);
        let lengths: Vec<usize> = rules.prefixes().map(|(p, _)| p.len()).collect();
        assert_eq!(lengths, vec![7, 5, 4]);
    }

    #[test]
    fn test_invalid_prefixes_rejected() {
        let empty = ForwardingRule::new(Vec::<String>::new(), upstream());
        assert!(matches!(
            RuleSet::new(vec![empty]),
            Err(ProxyError::ConfigurationConflict(_))
        ));

        let relative = ForwardingRule::new(["api"], upstream());
        assert!(matches!(
            RuleSet::new(vec![relative]),
            Err(ProxyError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn test_fallback_is_not_matched() {
        let rules = RuleSet::new(vec![ForwardingRule::new(["/api"], upstream())])
            .unwrap()
            .with_fallback(ForwardingRule::passthrough(upstream()));
        assert!(rules.match_path("/index.html").rule().is_none());
        assert_eq!(rules.fallback().map(|r| r.name.as_str()), Some("fallback"));
    }

    #[test]
    fn test_preserves_rule_order() {
        let rules = RuleSet::new(vec![
            ForwardingRule::new(["/b"], upstream()).with_name("b"),
            ForwardingRule::new(["/a"], upstream()).with_name("a"),
        ])
        .unwrap();
        let names: Vec<&str> = rules.rules().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
