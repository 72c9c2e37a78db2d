//! Prometheus metrics for the streaming relay.
//!
//! Each process (and each test) owns its own registry, exposed as text on
//! `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    /// Upstream responses currently held open by the proxy.
    pub active_upstream_connections: IntGauge,
    pub relayed_bytes_total: IntCounter,
    pub client_disconnects_total: IntCounter,
    /// Proxied requests by method and client-facing status.
    pub requests_total: IntCounterVec,
    pub token_refreshes_total: IntCounter,
}

impl ProxyMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let active_upstream_connections = IntGauge::new(
            "reelgate_active_upstream_connections",
            "Upstream responses currently held open",
        )?;
        let relayed_bytes_total = IntCounter::new(
            "reelgate_relayed_bytes_total",
            "Body bytes handed to clients",
        )?;
        let client_disconnects_total = IntCounter::new(
            "reelgate_client_disconnects_total",
            "Streams aborted because the client went away",
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("reelgate_requests_total", "Proxied stream requests"),
            &["method", "status_code"],
        )?;
        let token_refreshes_total = IntCounter::new(
            "reelgate_token_refreshes_total",
            "Access token refresh calls made to the identity provider",
        )?;

        registry.register(Box::new(active_upstream_connections.clone()))?;
        registry.register(Box::new(relayed_bytes_total.clone()))?;
        registry.register(Box::new(client_disconnects_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(token_refreshes_total.clone()))?;

        Ok(Self {
            registry,
            active_upstream_connections,
            relayed_bytes_total,
            client_disconnects_total,
            requests_total,
            token_refreshes_total,
        })
    }

    pub fn record_request(&self, method: &str, status: u16) {
        self.requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
    }

    /// Counts an upstream connection as open until the guard is dropped.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.active_upstream_connections.inc();
        ConnectionGuard {
            gauge: self.active_upstream_connections.clone(),
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Decrements the active-connection gauge on drop.
pub struct ConnectionGuard {
    gauge: IntGauge,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
