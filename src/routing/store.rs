//! Shared handle to the active rule set.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::routing::router::RuleSet;

/// Cheaply cloneable handle to the rule set currently being served.
///
/// Readers get a consistent snapshot; a reload replaces the whole set in one
/// atomic pointer swap.
#[derive(Debug, Clone)]
pub struct RuleStore {
    current: Arc<ArcSwap<RuleSet>>,
}

impl RuleStore {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(rules)),
        }
    }

    /// Snapshot of the active rule set.
    pub fn load(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Swap in `rules`, returning the previous set.
    pub fn replace(&self, rules: RuleSet) -> Arc<RuleSet> {
        self.current.swap(Arc::new(rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::rule::{ForwardingRule, Upstream};

    #[test]
    fn test_snapshot_survives_replace() {
        let upstream = Upstream::parse("http://localhost:8081").unwrap();
        let store = RuleStore::new(RuleSet::new(vec![ForwardingRule::new(["/api"], upstream.clone())]).unwrap());

        let before = store.load();
        let previous = store.replace(RuleSet::new(vec![ForwardingRule::new(["/v2"], upstream)]).unwrap());

        assert!(Arc::ptr_eq(&before, &previous));
        assert!(before.match_path("/api/x").rule().is_some());
        assert!(store.load().match_path("/api/x").rule().is_none());
        assert!(store.load().match_path("/v2/x").rule().is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let store = RuleStore::new(RuleSet::empty());
        let other = store.clone();
        let upstream = Upstream::parse("http://localhost:8081").unwrap();
        other.replace(RuleSet::new(vec![ForwardingRule::new(["/api"], upstream)]).unwrap());
        assert_eq!(store.load().len(), 1);
    }
}
