//! Shared utilities for integration tests: mock upstreams and a proxy harness.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use prefix_proxy::config::ProxyConfig;
use prefix_proxy::lifecycle::Shutdown;
use prefix_proxy::net::Listener;
use prefix_proxy::routing::{RuleSet, Upstream};
use prefix_proxy::ProxyServer;

/// A running proxy on an ephemeral port. Dropping it shuts the proxy down.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub updates: mpsc::UnboundedSender<RuleSet>,
    shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Start a proxy serving `rules` with `config` (its bind address is replaced).
pub async fn start_proxy(mut config: ProxyConfig, rules: RuleSet) -> TestProxy {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.listener.drain_timeout_secs = 1;

    let server = ProxyServer::with_rules(config, rules).unwrap();
    let listener = Listener::bind(&server.config().listener).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (updates, updates_rx) = mpsc::unbounded_channel();
    let stop = shutdown.subscribe();
    tokio::spawn(server.run(listener, updates_rx, stop));

    TestProxy {
        addr,
        updates,
        shutdown,
    }
}

pub fn upstream(addr: SocketAddr) -> Upstream {
    Upstream::parse(&format!("http://{addr}")).unwrap()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// An address nothing listens on.
pub async fn refused_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Upstream that answers every request with a JSON description of what it received.
pub async fn start_echo_backend(name: &'static str) -> SocketAddr {
    async fn echo(
        axum::extract::State(name): axum::extract::State<&'static str>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Json<Value> {
        let header = |key: &str| headers.get(key).and_then(|v| v.to_str().ok()).map(String::from);
        Json(json!({
            "backend": name,
            "method": method.as_str(),
            "path": uri.path(),
            "query": uri.query(),
            "host": header("host"),
            "x_forwarded_for": header("x-forwarded-for"),
            "x_forwarded_proto": header("x-forwarded-proto"),
            "x_forwarded_host": header("x-forwarded-host"),
            "x_request_id": header("x-request-id"),
            "connection": header("connection"),
            "body": String::from_utf8_lossy(&body),
        }))
    }

    let app = Router::new().fallback(echo).with_state(name);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Read one request head (bodyless requests only). Returns false on EOF.
async fn read_head(socket: &mut TcpStream, buffer: &mut Vec<u8>) -> bool {
    loop {
        if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            buffer.drain(..end + 4);
            return true;
        }
        let mut chunk = [0u8; 1024];
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Socket counters for a raw upstream.
#[derive(Clone, Default)]
pub struct SocketCounts {
    pub accepted: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl SocketCounts {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait up to `limit` for at least `count` sockets to have closed.
    pub async fn wait_closed(&self, count: usize, limit: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + limit;
        while self.closed() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.closed()
    }
}

/// Keep-alive upstream that answers every request with `ok` and counts
/// accepted and closed sockets. With `hang_up_after` set it closes each
/// connection that long after answering, without announcing it.
pub async fn start_tracked_backend(hang_up_after: Option<Duration>) -> (SocketAddr, SocketCounts) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counts = SocketCounts::default();
    let tracked = counts.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tracked.accepted.fetch_add(1, Ordering::SeqCst);
            let closed = tracked.closed.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                while read_head(&mut socket, &mut buffer).await {
                    let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                    if socket.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                    if let Some(delay) = hang_up_after {
                        tokio::time::sleep(delay).await;
                        break;
                    }
                }
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    (addr, counts)
}

/// Keep-alive upstream that counts accepted TCP connections.
pub async fn start_counting_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let (addr, counts) = start_tracked_backend(None).await;
    (addr, counts.accepted)
}

/// Upstream that announces a large body and then writes one byte every `trickle`.
///
/// A socket counts as closed once a write to it fails.
pub async fn start_trickle_backend(trickle: Duration) -> (SocketAddr, SocketCounts) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counts = SocketCounts::default();
    let tracked = counts.clone();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tracked.accepted.fetch_add(1, Ordering::SeqCst);
            let closed = tracked.closed.clone();
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                if read_head(&mut socket, &mut buffer).await {
                    let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000000\r\n\r\n";
                    if socket.write_all(head.as_bytes()).await.is_ok() {
                        loop {
                            tokio::time::sleep(trickle).await;
                            if socket.write_all(b"x").await.is_err() {
                                break;
                            }
                        }
                    }
                }
                closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });
    (addr, counts)
}

/// Upstream that waits `delay` before answering.
pub async fn start_slow_backend(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                if read_head(&mut socket, &mut buffer).await {
                    tokio::time::sleep(delay).await;
                    let response = "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow";
                    let _ = socket.write_all(response.as_bytes()).await;
                }
            });
        }
    });
    addr
}

/// Upstream that accepts any upgrade and then echoes raw bytes.
pub async fn start_upgrade_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                if !read_head(&mut socket, &mut buffer).await {
                    return;
                }
                let response = "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n";
                if socket.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                if !buffer.is_empty() && socket.write_all(&buffer).await.is_err() {
                    return;
                }
                let mut chunk = [0u8; 1024];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&chunk[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Send `request` over a raw socket and return everything up to the end of the response head.
pub async fn raw_exchange(addr: SocketAddr, request: &str) -> (TcpStream, String) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = socket.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        head.push(byte[0]);
    }
    (socket, String::from_utf8_lossy(&head).into_owned())
}
