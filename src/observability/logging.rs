//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the logging subsystem
//! - Emit the per-exchange access event
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development
//! - Log level configurable via config; `RUST_LOG` wins when set

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogFormat;

/// Target of the one-event-per-exchange access log.
pub const ACCESS_TARGET: &str = "prefix_proxy::access";

/// Install the global subscriber.
pub fn init_logging(level: &str, format: LogFormat) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
}

/// Fields of one completed exchange.
#[derive(Debug)]
pub struct AccessRecord<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub rule: &'a str,
    pub upstream: &'a str,
    pub status: u16,
    pub duration_ms: u64,
    pub request_id: &'a str,
}

impl AccessRecord<'_> {
    pub fn emit(&self) {
        tracing::info!(
            target: ACCESS_TARGET,
            method = self.method,
            path = self.path,
            rule = self.rule,
            upstream = self.upstream,
            status = self.status,
            duration_ms = self.duration_ms,
            request_id = self.request_id,
            "exchange"
        );
    }
}
