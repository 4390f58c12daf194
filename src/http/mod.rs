//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper HTTP/1.1 connection, Axum router, middleware)
//!     → request.rs (request ID)
//!     → [routing layer picks the rule]
//!     → forward.rs (outbound request, pooled connection, deadline)
//!         → headers.rs (hop-by-hop filtering, Host, X-Forwarded-*)
//!     → body.rs (stream response body, return connection to pool)
//!     → upgrade.rs (byte relay after 101 Switching Protocols)
//!     → Send to client
//! ```

pub mod body;
pub mod forward;
pub mod headers;
pub mod request;
pub mod server;
pub mod upgrade;

pub use forward::Forwarder;
pub use headers::ClientInfo;
pub use request::{MakeExchangeId, X_REQUEST_ID};
pub use server::{serve, AppState, ProxyServer};
