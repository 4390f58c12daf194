//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, or dev-server proxy JSON)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, compile RuleSet)
//!     → RuleSet handed to the server
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config, command-line overrides reapplied
//!     → validation.rs validates and compiles
//!     → new RuleSet sent to the server
//!     → atomic swap; in-flight requests keep their snapshot
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Only rules and fallback are reloadable; command-line rules are
//!   reapplied on every reload

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{
    ListenerConfig, LogFormat, ObservabilityConfig, PoolConfig, ProxyConfig, RuleConfig,
    RuleOverrides, TimeoutConfig,
};
pub use validation::build_rule_set;
