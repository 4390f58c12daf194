//! Opening new upstream connections.
//!
//! # Responsibilities
//! - TCP connect with a bounded timeout
//! - Optional TLS handshake, validating or not per rule
//! - HTTP/1.1 client handshake and a driver task per connection

use std::time::Duration;

use axum::body::Body;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;

use crate::error::ProxyError;
use crate::routing::{Scheme, Upstream};
use crate::upstream::tls::TlsConnectors;

/// Request half of a fresh connection plus a handle on the task driving its I/O.
pub struct Handshaken {
    pub sender: SendRequest<Body>,
    /// Aborting the driver closes the socket.
    pub driver: AbortHandle,
}

/// Dials upstreams.
#[derive(Clone)]
pub struct Connector {
    connect_timeout: Duration,
    tls: TlsConnectors,
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Result<Self, ProxyError> {
        let tls = TlsConnectors::new()
            .map_err(|e| ProxyError::Internal(format!("TLS client setup failed: {e}")))?;
        Ok(Self {
            connect_timeout,
            tls,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open a new connection to `upstream`.
    ///
    /// Refusal, DNS failure, TLS failure, and running out of connect time all
    /// surface as `UpstreamUnreachable`.
    pub async fn connect(
        &self,
        upstream: &Upstream,
        allow_insecure_tls: bool,
    ) -> Result<Handshaken, ProxyError> {
        let attempt = async {
            let tcp = TcpStream::connect((upstream.host(), upstream.port()))
                .await
                .map_err(|e| ProxyError::unreachable(upstream.to_string(), e))?;
            if let Err(e) = tcp.set_nodelay(true) {
                tracing::debug!(upstream = %upstream, error = %e, "Failed to set TCP_NODELAY");
            }

            match upstream.scheme() {
                Scheme::Http => handshake(tcp, upstream).await,
                Scheme::Https => {
                    let server_name = ServerName::try_from(upstream.host().to_string())
                        .map_err(|e| ProxyError::unreachable(upstream.to_string(), e))?;
                    let tls = self
                        .tls
                        .get(allow_insecure_tls)
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| ProxyError::unreachable(upstream.to_string(), e))?;
                    handshake(tls, upstream).await
                }
            }
        };

        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::unreachable(
                upstream.to_string(),
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        }
    }
}

async fn handshake<I>(io: I, upstream: &Upstream) -> Result<Handshaken, ProxyError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::Builder::new()
        .handshake::<_, Body>(TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::unreachable(upstream.to_string(), e))?;

    let target = upstream.to_string();
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!(upstream = %target, error = %e, "Upstream connection ended with error");
        }
    });

    tracing::debug!(upstream = %upstream, "Upstream connection established");

    Ok(Handshaken {
        sender,
        driver: driver.abort_handle(),
    })
}
