//! Bounded per-upstream connection pool.
//!
//! # Responsibilities
//! - Hand out idle connections that pass a liveness check
//! - Dial a new connection when none is idle
//! - Keep at most `max_idle` idle connections per upstream
//! - Close connections that failed or outlived the idle timeout
//!
//! # Design Decisions
//! - A leased connection is moved out of the pool, so two exchanges can
//!   never hold the same connection
//! - Per-upstream deques live in a `DashMap`; checkout and return happen
//!   under the shard lock for that key
//! - Most recently returned connection is reused first
//! - A background reaper closes expired idle connections even when their
//!   upstream sees no further traffic; it holds only a `Weak` reference and
//!   exits with the pool

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::observability::metrics;
use crate::routing::Upstream;
use crate::upstream::connector::{Connector, Handshaken};

/// Upper bound on how long a pooled connection may take to report ready.
const READY_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Bounds on how often the reaper sweeps the idle set.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(15);

/// Connections are only shared between rules that agree on TLS validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub upstream: Upstream,
    pub allow_insecure_tls: bool,
}

/// One HTTP/1.1 connection to an upstream.
pub struct UpstreamConnection {
    id: u64,
    key: PoolKey,
    sender: SendRequest<Body>,
    driver: AbortHandle,
    requests: u64,
}

impl UpstreamConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Number of requests sent over this connection so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn close(self) {
        self.driver.abort();
        tracing::trace!(connection_id = self.id, upstream = %self.key.upstream, "Upstream connection closed");
    }
}

struct IdleEntry {
    conn: UpstreamConnection,
    since: Instant,
}

impl IdleEntry {
    fn is_usable(&self, idle_timeout: Duration) -> bool {
        self.since.elapsed() < idle_timeout && self.conn.is_open()
    }
}

/// Close every entry of `idle` that expired or whose connection went away.
fn prune(idle: &mut VecDeque<IdleEntry>, idle_timeout: Duration) -> usize {
    let before = idle.len();
    let (kept, expired): (VecDeque<_>, VecDeque<_>) = std::mem::take(idle)
        .into_iter()
        .partition(|entry| entry.is_usable(idle_timeout));
    *idle = kept;
    for entry in expired {
        entry.conn.close();
    }
    before - idle.len()
}

/// Shared pool of upstream connections.
pub struct ConnectionPool {
    idle: DashMap<PoolKey, VecDeque<IdleEntry>>,
    connector: Connector,
    max_idle: usize,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool and start its idle reaper on the current runtime.
    ///
    /// Outside a runtime no reaper runs and expiry happens only on checkout
    /// and return.
    pub fn new(connector: Connector, config: &PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            idle: DashMap::new(),
            connector,
            max_idle: config.max_idle_per_upstream,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            next_id: AtomicU64::new(1),
        });
        let period = (pool.idle_timeout / 4).clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(reap_idle(Arc::downgrade(&pool), period));
            }
            Err(_) => tracing::debug!("No runtime; idle connections expire lazily"),
        }
        pool
    }

    /// Lease a connection to `upstream`, reusing an idle one when possible.
    pub async fn acquire(
        self: &Arc<Self>,
        upstream: &Upstream,
        allow_insecure_tls: bool,
    ) -> Result<Lease, ProxyError> {
        let key = PoolKey {
            upstream: upstream.clone(),
            allow_insecure_tls,
        };

        while let Some(mut conn) = self.checkout_idle(&key) {
            // The connection is ours alone now; make sure the last exchange fully drained.
            match tokio::time::timeout(READY_PROBE_TIMEOUT, conn.sender.ready()).await {
                Ok(Ok(())) => {
                    tracing::trace!(connection_id = conn.id, upstream = %upstream, "Reusing pooled connection");
                    metrics::record_upstream_connection(&key.upstream, "reused");
                    return Ok(Lease::new(conn, self.clone(), true));
                }
                _ => {
                    tracing::debug!(connection_id = conn.id, upstream = %upstream, "Discarding stale pooled connection");
                    conn.close();
                }
            }
        }

        let conn = self.dial(key).await?;
        Ok(Lease::new(conn, self.clone(), false))
    }

    /// Lease a freshly dialed connection, bypassing the idle set.
    ///
    /// Used for upgrade requests, whose connection never comes back.
    pub async fn acquire_dedicated(
        self: &Arc<Self>,
        upstream: &Upstream,
        allow_insecure_tls: bool,
    ) -> Result<Lease, ProxyError> {
        let key = PoolKey {
            upstream: upstream.clone(),
            allow_insecure_tls,
        };
        let conn = self.dial(key).await?;
        Ok(Lease::new(conn, self.clone(), false))
    }

    async fn dial(&self, key: PoolKey) -> Result<UpstreamConnection, ProxyError> {
        let Handshaken { sender, driver } =
            match self.connector.connect(&key.upstream, key.allow_insecure_tls).await {
                Ok(handshaken) => handshaken,
                Err(e) => {
                    metrics::record_upstream_connection(&key.upstream, "failed");
                    return Err(e);
                }
            };
        metrics::record_upstream_connection(&key.upstream, "new");
        Ok(UpstreamConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            sender,
            driver,
            requests: 0,
        })
    }

    /// Pop the most recently idled live connection for `key`, closing expired ones.
    fn checkout_idle(&self, key: &PoolKey) -> Option<UpstreamConnection> {
        let mut idle = self.idle.get_mut(key)?;
        while let Some(entry) = idle.pop_back() {
            if entry.is_usable(self.idle_timeout) {
                return Some(entry.conn);
            }
            entry.conn.close();
        }
        None
    }

    /// Close expired idle connections across all upstreams. Returns how many were closed.
    pub fn reap_expired(&self) -> usize {
        let mut closed = 0;
        self.idle.retain(|_, idle| {
            closed += prune(idle, self.idle_timeout);
            !idle.is_empty()
        });
        if closed > 0 {
            tracing::debug!(closed, "Closed expired idle connections");
        }
        closed
    }

    /// Return a connection whose response was fully consumed and may be kept alive.
    pub fn release(&self, conn: UpstreamConnection) {
        if !conn.is_open() {
            conn.close();
            return;
        }

        let mut idle = self.idle.entry(conn.key.clone()).or_default();
        prune(&mut idle, self.idle_timeout);

        if idle.len() >= self.max_idle {
            drop(idle);
            conn.close();
            return;
        }
        idle.push_back(IdleEntry {
            conn,
            since: Instant::now(),
        });
    }

    /// Close a connection that saw an error or cannot be reused.
    ///
    /// Leased connections are never in the idle set, so closing is all that is needed.
    pub fn invalidate(&self, conn: UpstreamConnection) {
        tracing::debug!(connection_id = conn.id, upstream = %conn.key.upstream, "Invalidating upstream connection");
        conn.close();
    }

    /// Number of idle connections held for `upstream`.
    pub fn idle_count(&self, upstream: &Upstream, allow_insecure_tls: bool) -> usize {
        let key = PoolKey {
            upstream: upstream.clone(),
            allow_insecure_tls,
        };
        self.idle.get(&key).map(|idle| idle.len()).unwrap_or(0)
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }
}

async fn reap_idle(pool: Weak<ConnectionPool>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.reap_expired();
    }
}

/// Exclusive use of one upstream connection for one exchange.
///
/// Dropping a lease without calling [`Lease::release`] invalidates the
/// connection, so a cancelled exchange never leaves a half-read connection
/// in the pool.
pub struct Lease {
    conn: Option<UpstreamConnection>,
    pool: Arc<ConnectionPool>,
    reused: bool,
}

impl Lease {
    fn new(conn: UpstreamConnection, pool: Arc<ConnectionPool>, reused: bool) -> Self {
        Self {
            conn: Some(conn),
            pool,
            reused,
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map(|c| c.id).unwrap_or_default()
    }

    /// True if the connection came from the idle set.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Write `request` and wait for the response head.
    pub async fn send(&mut self, request: Request<Body>) -> Result<Response<Incoming>, ProxyError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ProxyError::Internal("lease used after release".to_string()))?;
        conn.requests += 1;
        conn.sender
            .send_request(request)
            .await
            .map_err(|e| ProxyError::unreachable(conn.key.upstream.to_string(), e))
    }

    /// Hand the connection back to the pool for reuse.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// Close the connection.
    pub fn invalidate(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.invalidate(conn);
        }
    }

    /// Give up the connection without closing it.
    ///
    /// Used once the connection has been upgraded: its socket now belongs to
    /// the relay and aborting the driver would cut the tunnel.
    pub fn detach(mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::trace!(connection_id = conn.id, "Upstream connection detached for upgrade");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.invalidate(conn);
        }
    }
}
