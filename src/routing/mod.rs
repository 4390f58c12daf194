//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request path
//!     → store.rs (snapshot of the active RuleSet)
//!     → matcher.rs (longest segment-aligned prefix)
//!     → Return: matched ForwardingRule or NotFound
//!
//! Rule compilation (at load time):
//!     ForwardingRule[]
//!     → router.rs (reject duplicate or malformed prefixes)
//!     → Sort prefixes by length, longest first
//!     → Freeze as immutable RuleSet
//! ```
//!
//! # Design Decisions
//! - Rules compiled at load time, immutable at runtime
//! - Reload swaps a whole RuleSet, never edits one in place
//! - Deterministic: same path always matches same rule

pub mod matcher;
pub mod router;
pub mod rule;
pub mod store;

pub use matcher::{match_rule, PathPrefix, RouteMatch};
pub use router::RuleSet;
pub use rule::{ForwardingRule, Scheme, Upstream};
pub use store::RuleStore;
