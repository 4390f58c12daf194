//! Relay for upgraded connections (WebSocket and friends).
//!
//! Once the upstream answers `101 Switching Protocols`, both sockets stop
//! speaking HTTP and bytes are copied in each direction until either side
//! closes.

use futures_util::future::try_join;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{copy_bidirectional, AsyncWriteExt};

/// Spawn a task that joins the caller and upstream sockets after the 101.
pub fn spawn_relay(client: OnUpgrade, upstream: OnUpgrade, rule: String, target: String) {
    tokio::spawn(async move {
        let (client, upstream) = match try_join(client, upstream).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(rule = %rule, upstream = %target, error = %e, "Connection upgrade failed");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut upstream = TokioIo::new(upstream);
        tracing::debug!(rule = %rule, upstream = %target, "Relaying upgraded connection");

        match copy_bidirectional(&mut client, &mut upstream).await {
            Ok((from_client, from_upstream)) => tracing::debug!(
                rule = %rule,
                upstream = %target,
                from_client,
                from_upstream,
                "Upgraded connection closed"
            ),
            Err(e) => tracing::debug!(rule = %rule, upstream = %target, error = %e, "Upgraded connection ended"),
        }

        let _ = client.shutdown().await;
        let _ = upstream.shutdown().await;
    });
}
