//! Request counters, the metrics sink abstraction, and connection
//! lifecycle trackers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::graph::Protocol;

/// Mux-wide request statistics, updated lock-free on the hot path.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total requests dispatched through the router
    pub total_requests: AtomicU64,
    /// Requests currently being handled
    pub active_requests: AtomicU64,
    /// Requests that fell through to the NotFound handler
    pub not_found: AtomicU64,
    /// Requests answered with a synthesized 5xx
    pub upstream_errors: AtomicU64,
}

impl ProxyStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_active_requests(&self) -> u64 {
        self.active_requests.load(Ordering::Relaxed)
    }
}

/// Sink for the periodic gauge emission. The default sink drops
/// everything; deployments wire their own.
pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &'static str, value: u64);
}

/// Discards all metrics.
#[derive(Debug, Default)]
pub struct NopMetrics;

impl MetricsSink for NopMetrics {
    fn gauge(&self, _name: &'static str, _value: u64) {}
}

/// Observes incoming connection lifecycle on every listener.
pub trait ConnectionTracker: Send + Sync {
    fn connection_opened(&self, protocol: Protocol);
    fn connection_closed(&self, protocol: Protocol);
}

/// Default tracker: keeps per-protocol open-connection gauges.
#[derive(Debug, Default)]
pub struct CountingConnTracker {
    http_open: AtomicU64,
    https_open: AtomicU64,
}

impl CountingConnTracker {
    pub fn open_connections(&self, protocol: Protocol) -> u64 {
        match protocol {
            Protocol::Http => self.http_open.load(Ordering::Relaxed),
            Protocol::Https => self.https_open.load(Ordering::Relaxed),
        }
    }

    fn cell(&self, protocol: Protocol) -> &AtomicU64 {
        match protocol {
            Protocol::Http => &self.http_open,
            Protocol::Https => &self.https_open,
        }
    }
}

impl ConnectionTracker for CountingConnTracker {
    fn connection_opened(&self, protocol: Protocol) {
        self.cell(protocol).fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, protocol: Protocol) {
        self.cell(protocol).fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared handles used by servers and frontends for observation.
#[derive(Clone)]
pub struct Observers {
    pub stats: Arc<ProxyStats>,
    pub incoming: Arc<dyn ConnectionTracker>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Observers {
    pub fn new_default() -> Self {
        Self {
            stats: Arc::new(ProxyStats::default()),
            incoming: Arc::new(CountingConnTracker::default()),
            metrics: Arc::new(NopMetrics),
        }
    }
}
