//! Path prefix matching.
//!
//! # Responsibilities
//! - Match a request path against one prefix on segment boundaries
//! - Select the longest matching prefix across a rule set
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - Only the path is matched, never the query string
//! - No regex to guarantee O(n) matching

use std::sync::Arc;

use crate::routing::router::RuleSet;
use crate::routing::rule::ForwardingRule;

/// A path prefix that only matches whole segments.
///
/// `/api` matches `/api`, `/api/` and `/api/users`, but not `/api2` or `/apiFoo`.
/// A prefix ending in `/` matches anything below it, so `/` matches every path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPrefix {
    prefix: String,
}

impl PathPrefix {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    pub fn len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Returns true if `path` falls under this prefix.
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.prefix.as_str()) else {
            return false;
        };
        rest.is_empty() || self.prefix.ends_with('/') || rest.starts_with('/')
    }
}

/// Outcome of matching a request path.
#[derive(Debug, Clone, Copy)]
pub enum RouteMatch<'a> {
    /// The rule owning the longest matching prefix, and that prefix.
    Rule {
        rule: &'a Arc<ForwardingRule>,
        prefix: &'a str,
    },
    NotFound,
}

impl<'a> RouteMatch<'a> {
    pub fn rule(&self) -> Option<&'a Arc<ForwardingRule>> {
        match self {
            RouteMatch::Rule { rule, .. } => Some(rule),
            RouteMatch::NotFound => None,
        }
    }
}

/// Select the rule whose matching prefix is longest.
pub fn match_rule<'a>(path: &str, rules: &'a RuleSet) -> RouteMatch<'a> {
    // Prefixes are kept longest-first, so the first hit is the most specific.
    rules
        .prefixes()
        .find(|(prefix, _)| prefix.matches(path))
        .map(|(prefix, rule)| RouteMatch::Rule {
            rule,
            prefix: prefix.as_str(),
        })
        .unwrap_or(RouteMatch::NotFound)
}
