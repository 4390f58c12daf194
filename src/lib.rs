//! Path-prefix forwarding proxy.
//!
//! Routes each inbound HTTP/1.1 request to an upstream chosen by
//! longest-prefix match on the request path, over pooled upstream
//! connections, with streamed bodies and upgrade passthrough.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ net::listener ──▶ http::server ──▶ routing (RuleSet snapshot)
//!                                                            │
//!                                                            ▼
//!                                                     http::forward
//!                                                            │
//!                                                            ▼
//!     Client Response                                upstream::pool ──▶ Upstream
//!     ◀────────────── http::body (streamed) ◀───────────────┘
//!
//!     Cross-cutting: config (TOML / dev-server JSON, hot reload),
//!                    lifecycle (signals, drain), observability (logs, metrics)
//! ```

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod routing;
pub mod upstream;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::{serve, ProxyServer};
pub use lifecycle::Shutdown;
pub use routing::{ForwardingRule, RuleSet, Upstream};
