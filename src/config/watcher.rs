//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::RuleOverrides;
use crate::config::validation::build_rule_set;
use crate::routing::RuleSet;

/// Load `path`, reapply `overrides`, and compile the rules, logging instead of failing.
///
/// Returns `None` when the file cannot be used; the caller keeps serving the
/// rule set it already has.
pub fn reload_rules(path: &Path, overrides: &RuleOverrides) -> Option<RuleSet> {
    let mut config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = ?path, error = %e, "Failed to reload config. Keeping current rules.");
            return None;
        }
    };
    overrides.apply(&mut config);
    match build_rule_set(&config) {
        Ok(rules) => {
            tracing::info!(path = ?path, rules = rules.len(), "Config reloaded");
            Some(rules)
        }
        Err(e) => {
            tracing::error!(path = ?path, error = %e, "Reloaded rules rejected. Keeping current rules.");
            None
        }
    }
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    overrides: RuleOverrides,
    update_tx: mpsc::UnboundedSender<RuleSet>,
}

impl ConfigWatcher {
    /// Create a watcher that publishes into an existing update channel.
    pub fn new(
        path: &Path,
        overrides: RuleOverrides,
        update_tx: mpsc::UnboundedSender<RuleSet>,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            overrides,
            update_tx,
        }
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned watcher must be kept alive for as long as reloads are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();
        let overrides = self.overrides;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!(path = ?path, "Config file change detected, reloading...");
                        if let Some(rules) = reload_rules(&path, &overrides) {
                            let _ = tx.send(rules);
                        }
                    }
                }
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}
