//! Prometheus metrics
//!
//! Exposed over a small HTTP endpoint for scraping.

use std::sync::OnceLock;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{debug, error};

use crate::classifier::Classification;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Proxy metrics collection
pub struct Metrics {
    pub registry: Registry,

    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Total client connections closed
    pub connections_closed: IntCounter,

    /// Statements routed, labeled by classification
    pub queries_total: IntCounterVec,
    /// Authentication failures
    pub auth_failures_total: IntCounter,
    /// KILL statements dispatched across workers
    pub kills_dispatched_total: IntCounter,
    /// Sessions terminated by a KILL
    pub sessions_killed_total: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "hermes_connections_total",
            "Total number of client connections accepted",
        )
        .unwrap();
        let connections_active = IntGauge::new(
            "hermes_connections_active",
            "Current number of active client connections",
        )
        .unwrap();
        let connections_closed = IntCounter::new(
            "hermes_connections_closed_total",
            "Total number of client connections closed",
        )
        .unwrap();
        let queries_total = IntCounterVec::new(
            Opts::new("hermes_queries_total", "Statements processed"),
            &["kind"],
        )
        .unwrap();
        let auth_failures_total = IntCounter::new(
            "hermes_auth_failures_total",
            "Client authentication failures",
        )
        .unwrap();
        let kills_dispatched_total = IntCounter::new(
            "hermes_kills_dispatched_total",
            "KILL statements dispatched to workers",
        )
        .unwrap();
        let sessions_killed_total = IntCounter::new(
            "hermes_sessions_killed_total",
            "Sessions terminated by KILL",
        )
        .unwrap();

        registry.register(Box::new(connections_total.clone())).unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();
        registry.register(Box::new(connections_closed.clone())).unwrap();
        registry.register(Box::new(queries_total.clone())).unwrap();
        registry.register(Box::new(auth_failures_total.clone())).unwrap();
        registry.register(Box::new(kills_dispatched_total.clone())).unwrap();
        registry.register(Box::new(sessions_killed_total.clone())).unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            queries_total,
            auth_failures_total,
            kills_dispatched_total,
            sessions_killed_total,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    pub fn record_query(&self, classification: &Classification) {
        let kind = if classification.mask.is_session_command() {
            "session_command"
        } else if classification.mask.is_write() {
            "write"
        } else if classification.mask.is_read() {
            "read"
        } else {
            "other"
        };
        self.queries_total.with_label_values(&[kind]).inc();
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures_total.inc();
    }

    pub fn record_kill_dispatched(&self) {
        self.kills_dispatched_total.inc();
    }

    pub fn record_session_killed(&self) {
        self.sessions_killed_total.inc();
    }

    fn render(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        buffer
    }
}

async fn handle_request(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let body = metrics().render();
    Ok(Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

/// Serve the scrape endpoint until the process exits
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, "Metrics scrape");
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                debug!(error = %e, "Metrics connection error");
            }
        });
    }
}
