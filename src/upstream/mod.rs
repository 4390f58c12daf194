//! Upstream connection subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarder needs a connection to an upstream
//!     → pool.rs (idle connection for (upstream, tls mode)?)
//!         - yes: liveness probe, lease it
//!         - no:  connector.rs (TCP + optional TLS + HTTP/1.1 handshake)
//!     → Lease held for the whole exchange
//!     → release (fully consumed, keep-alive) | invalidate (error, cancel)
//! ```
//!
//! # Design Decisions
//! - HTTP/1.1 only, one request in flight per connection
//! - Each connection's I/O runs in its own task; aborting it closes the socket
//! - TLS validation is per rule and part of the pool key

pub mod connector;
pub mod pool;
pub mod tls;

pub use connector::Connector;
pub use pool::{ConnectionPool, Lease, PoolKey, UpstreamConnection};
