//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize subsystems in dependency order (metrics, server, listener)
//! - Start background tasks (config watcher, signal handling)
//! - Map startup failures to process exit codes
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Listener binds last (traffic only when ready)
//! - A bad reload never stops the proxy; only startup errors are fatal

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::config::loader::ConfigError;
use crate::config::validation::ValidationError;
use crate::config::watcher::{reload_rules, ConfigWatcher};
use crate::config::{ProxyConfig, RuleOverrides};
use crate::error::ProxyError;
use crate::http::ProxyServer;
use crate::lifecycle::{Shutdown, SignalEvent, Signals};
use crate::net::{Listener, ListenerError};
use crate::observability::metrics;
use crate::routing::RuleSet;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rules(#[from] ProxyError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("failed to watch config file: {0}")]
    Watch(#[from] notify::Error),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

impl StartupError {
    /// 1 when the listener could not bind, 2 for every configuration problem.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Listener(_) => 1,
            _ => 2,
        }
    }
}

/// Everything needed to bring the proxy up.
pub struct Launch {
    pub config: ProxyConfig,
    pub rules: RuleSet,
    /// File to reload rules from on SIGHUP or change.
    pub config_path: Option<PathBuf>,
    /// Reload automatically when `config_path` changes.
    pub watch: bool,
    /// Command-line rules, reapplied on every reload.
    pub overrides: RuleOverrides,
}

/// Start the proxy and run it until a shutdown signal has been handled.
pub async fn launch(launch: Launch) -> Result<(), StartupError> {
    let Launch {
        config,
        rules,
        config_path,
        watch,
        overrides,
    } = launch;

    if config.observability.metrics_enabled {
        let address: SocketAddr = config.observability.metrics_address.parse().map_err(|_| {
            ConfigError::Validation(vec![ValidationError::InvalidAddress {
                field: "observability.metrics_address",
                value: config.observability.metrics_address.clone(),
            }])
        })?;
        metrics::init_metrics(address)?;
    }

    let server = ProxyServer::with_rules(config, rules)?;
    let listener = Listener::bind(&server.config().listener).await?;

    let (updates_tx, updates) = mpsc::unbounded_channel();
    let _watcher = match (&config_path, watch) {
        (Some(path), true) => {
            Some(ConfigWatcher::new(path, overrides.clone(), updates_tx.clone()).run()?)
        }
        _ => None,
    };

    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    let mut signals = Signals::new().map_err(StartupError::Signals)?;
    tokio::spawn(async move {
        loop {
            match signals.recv().await {
                SignalEvent::Shutdown => {
                    tracing::info!("Shutdown requested");
                    shutdown.trigger();
                    break;
                }
                SignalEvent::Reload => match &config_path {
                    Some(path) => {
                        tracing::info!(path = ?path, "SIGHUP received, reloading rules");
                        if let Some(rules) = reload_rules(path, &overrides) {
                            let _ = updates_tx.send(rules);
                        }
                    }
                    None => tracing::info!("SIGHUP ignored: no config file to reload"),
                },
            }
        }
    });

    server.run(listener, updates, stop).await;
    Ok(())
}
