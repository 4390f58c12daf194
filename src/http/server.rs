//! HTTP server setup and the per-request handler.
//!
//! # Responsibilities
//! - Create the Axum Router with the proxy handler and middleware
//! - Serve each accepted connection with hyper's HTTP/1.1 server, upgrades enabled
//! - Match each request against the current rule set and forward it
//! - Swap in reloaded rule sets
//! - Stop accepting on shutdown and drain open connections
//!
//! # Design Decisions
//! - One task per inbound connection; requests on a connection are handled in order
//! - The rule set is loaded once per request, so a reload never changes
//!   the rule an in-flight exchange is using
//! - Handler panics are caught and answered with 500; the connection task survives

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{build_rule_set, ProxyConfig};
use crate::error::ProxyError;
use crate::http::forward::Forwarder;
use crate::http::headers::ClientInfo;
use crate::http::request::{request_id, MakeExchangeId, X_REQUEST_ID};
use crate::lifecycle::{Shutdown, SignalEvent, Signals, StartupError};
use crate::net::{ConnectionPermit, ConnectionTracker, Listener, ListenerError};
use crate::observability::{metrics, AccessRecord};
use crate::routing::{RouteMatch, RuleSet, RuleStore};
use crate::upstream::{ConnectionPool, Connector};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub rules: RuleStore,
    pub forwarder: Arc<Forwarder>,
}

/// The forwarding proxy server.
pub struct ProxyServer {
    router: Router,
    rules: RuleStore,
    forwarder: Arc<Forwarder>,
    config: ProxyConfig,
}

impl ProxyServer {
    /// Build a server from `config`, compiling its rules.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let rules = build_rule_set(&config)?;
        Self::with_rules(config, rules)
    }

    /// Build a server that serves an already compiled rule set.
    pub fn with_rules(config: ProxyConfig, rules: RuleSet) -> Result<Self, ProxyError> {
        let connector = Connector::new(config.timeouts.connect())?;
        let pool = ConnectionPool::new(connector, &config.pool);
        let forwarder = Arc::new(Forwarder::new(pool, config.timeouts.exchange()));
        let rules = RuleStore::new(rules);

        let state = AppState {
            rules: rules.clone(),
            forwarder: forwarder.clone(),
        };
        let router = Self::build_router(state);

        Ok(Self {
            router,
            rules,
            forwarder,
            config,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(state)
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "exchange",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id(request),
                )
            }))
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeExchangeId))
    }

    /// Handle for swapping the served rule set.
    pub fn rules(&self) -> RuleStore {
        self.rules.clone()
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Accept connections on `listener` until `shutdown` fires, then drain.
    ///
    /// Rule sets received on `updates` replace the served one.
    pub async fn run(
        self,
        listener: Listener,
        mut updates: mpsc::UnboundedReceiver<RuleSet>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let tracker = ConnectionTracker::new();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, rules = self.rules.load().len(), "Proxy server starting");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        self.spawn_connection(stream, peer, permit, &tracker, shutdown.resubscribe());
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning.
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(rules) = updates.recv() => {
                    let count = rules.len();
                    self.rules.replace(rules);
                    tracing::info!(rules = count, "Rule set replaced");
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);
        let drain_timeout = Duration::from_secs(self.config.listener.drain_timeout_secs);
        if tracker.wait_idle(drain_timeout).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }
        tracing::info!("Proxy server stopped");
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        tracker: &ConnectionTracker,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let router = self.router.clone();
        let guard = tracker.track();
        let header_read_timeout = self.config.timeouts.header_read();

        tokio::spawn(async move {
            let _permit = permit;
            let connection_id = guard.id();
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(connection_id = %connection_id, error = %e, "Failed to set TCP_NODELAY");
            }

            let service = service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(peer));
                router.clone().oneshot(request)
            });

            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(header_read_timeout);
            let connection = builder
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = shutdown.recv() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %connection_id, peer = %peer, error = %e, "Connection ended with error");
            }
            drop(guard);
        });
    }
}

/// Serve `rules` on `listen_address` until Ctrl+C or SIGTERM.
pub async fn serve(listen_address: &str, rules: RuleSet) -> Result<(), StartupError> {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = listen_address.to_string();

    let server = ProxyServer::with_rules(config, rules)?;
    let listener = Listener::bind(&server.config().listener).await?;

    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();
    let (_updates_tx, updates) = mpsc::unbounded_channel();

    match Signals::new() {
        Ok(mut signals) => {
            tokio::spawn(async move {
                while signals.recv().await != SignalEvent::Shutdown {}
                shutdown.trigger();
            });
        }
        Err(e) => tracing::warn!(error = %e, "Signal handlers unavailable"),
    }

    server.run(listener, updates, stop).await;
    Ok(())
}

/// Main proxy handler.
/// Matches the path, forwards to the rule's upstream, and records the exchange.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let request_id = request_id(&request).to_string();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    if !path.starts_with('/') {
        let error = ProxyError::MalformedRequest(format!("request target {} is not origin-form", request.uri()));
        tracing::debug!(request_id = %request_id, error = %error, "Rejected request");
        let response = error.into_response();
        record(&method, &path, "none", "none", response.status(), started, &request_id);
        return response;
    }

    let rules = state.rules.load();
    let (rule, prefix) = match rules.match_path(&path) {
        RouteMatch::Rule { rule, prefix } => (rule.clone(), prefix.to_string()),
        RouteMatch::NotFound => match rules.fallback() {
            Some(fallback) => (fallback.clone(), String::new()),
            None => {
                tracing::debug!(request_id = %request_id, path = %path, "No rule matched");
                let response = (StatusCode::NOT_FOUND, "No matching rule").into_response();
                record(&method, &path, "none", "none", response.status(), started, &request_id);
                return response;
            }
        },
    };
    drop(rules);

    let client = ClientInfo {
        addr: peer,
        proto: "http",
    };
    let upstream = rule.upstream.to_string();
    let response = match state.forwarder.forward(request, &rule, &prefix, &client).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ProxyError::MalformedRequest(_) => {
                    tracing::debug!(request_id = %request_id, error = %e, "Rejected request")
                }
                _ => tracing::error!(
                    request_id = %request_id,
                    rule = %rule.name,
                    kind = e.kind(),
                    error = %e,
                    "Exchange failed"
                ),
            }
            e.into_response()
        }
    };

    record(&method, &path, &rule.name, &upstream, response.status(), started, &request_id);
    response
}

fn record(
    method: &str,
    path: &str,
    rule: &str,
    upstream: &str,
    status: StatusCode,
    started: Instant,
    request_id: &str,
) {
    metrics::record_request(method, status.as_u16(), rule, started);
    AccessRecord {
        method,
        path,
        rule,
        upstream,
        status: status.as_u16(),
        duration_ms: started.elapsed().as_millis() as u64,
        request_id,
    }
    .emit();
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = %detail, "Request handler panicked");
    ProxyError::Internal(detail.to_string()).into_response()
}
