//! prefix-proxy
//!
//! Forwards HTTP requests to upstreams chosen by path prefix, the way a
//! development server proxies `/api` to a backend while serving everything
//! else locally.
//!
//! Exit codes: 0 after a clean shutdown, 1 if the listener cannot bind,
//! 2 for any configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use prefix_proxy::config::validation::validate_config;
use prefix_proxy::config::{
    build_rule_set, load_config, LogFormat, ProxyConfig, RuleConfig, RuleOverrides,
};
use prefix_proxy::lifecycle::{launch, Launch};
use prefix_proxy::observability::init_logging;

#[derive(Parser)]
#[command(name = "prefix-proxy")]
#[command(about = "Path-prefix forwarding proxy", long_about = None)]
struct Cli {
    /// Config file: TOML, or a dev-server proxy file if it ends in `.json`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides `listener.bind_address`
    #[arg(short, long)]
    listen: Option<String>,

    /// Forward PREFIX to URL with the Host rewritten; repeatable
    #[arg(short, long = "route", value_name = "PREFIX=URL", value_parser = parse_route)]
    routes: Vec<(String, String)>,

    /// Upstream for requests no rule matches
    #[arg(long, value_name = "URL")]
    fallback: Option<String>,

    /// Reload rules when the config file changes
    #[arg(long)]
    watch: bool,

    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

fn parse_route(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((prefix, url)) if !prefix.is_empty() && !url.is_empty() => {
            Ok((prefix.to_string(), url.to_string()))
        }
        _ => Err(format!("expected PREFIX=URL, got {value:?}")),
    }
}

impl Cli {
    /// `--route` and `--fallback`, which survive reloads.
    fn overrides(&self) -> RuleOverrides {
        RuleOverrides {
            rules: self
                .routes
                .iter()
                .map(|(prefix, upstream)| RuleConfig {
                    path_prefixes: vec![prefix.clone()],
                    upstream: upstream.clone(),
                    rewrite_origin: true,
                    ..Default::default()
                })
                .collect(),
            fallback: self.fallback.clone(),
        }
    }

    fn apply(&self, config: &mut ProxyConfig, overrides: &RuleOverrides) {
        if let Some(listen) = &self.listen {
            config.listener.bind_address = listen.clone();
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = match format {
                LogFormatArg::Pretty => LogFormat::Pretty,
                LogFormatArg::Json => LogFormat::Json,
            };
        }
        overrides.apply(config);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("prefix-proxy: {}: {e}", path.display());
                return ExitCode::from(2);
            }
        },
        None => ProxyConfig::default(),
    };
    let overrides = cli.overrides();
    cli.apply(&mut config, &overrides);

    if let Err(e) = init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    ) {
        eprintln!("prefix-proxy: logging already initialized: {e}");
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "prefix-proxy starting");

    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            tracing::error!(error = %error, "Invalid configuration");
        }
        return ExitCode::from(2);
    }

    let rules = match build_rule_set(&config) {
        Ok(rules) => rules,
        Err(e) => {
            tracing::error!(error = %e, "Rule set rejected");
            return ExitCode::from(2);
        }
    };

    if cli.watch && cli.config.is_none() {
        tracing::warn!("--watch has no effect without --config");
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        rules = rules.len(),
        fallback = config.fallback.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );

    let result = launch(Launch {
        config,
        rules,
        config_path: cli.config.clone(),
        watch: cli.watch,
        overrides,
    })
    .await;

    match result {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::from(e.exit_code())
        }
    }
}
