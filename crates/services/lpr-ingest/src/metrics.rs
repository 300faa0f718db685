//! Metrics collection for the push listener
//!
//! Each listener owns one [`Metrics`] instance shared with its accept loops
//! and request handlers.

use axum::http::StatusCode;
use std::sync::atomic::{AtomicU64, Ordering};

/// Listener metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Total connections accepted since startup
    connections_accepted: AtomicU64,

    /// Connections currently being served
    active_connections: AtomicU64,

    /// Failed accept calls
    accept_errors: AtomicU64,

    /// Requests that reached the push handler
    requests_received: AtomicU64,

    /// Events handed to the application
    events_delivered: AtomicU64,

    /// Requests answered with a 4xx status
    requests_rejected: AtomicU64,

    /// Of which were rejected for authentication
    auth_failures: AtomicU64,

    /// Handler invocations that returned an error or panicked
    handler_failures: AtomicU64,

    /// Total body bytes read
    bytes_received: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    /// Record an accepted connection
    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection finishing
    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn accept_failed(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected request by its response status
    pub fn request_rejected(&self, status: StatusCode) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        if status == StatusCode::UNAUTHORIZED {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let uptime_secs = now.saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            uptime_secs,
        }
    }

    pub fn active_connection_count(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub accept_errors: u64,
    pub requests_received: u64,
    pub events_delivered: u64,
    pub requests_rejected: u64,
    pub auth_failures: u64,
    pub handler_failures: u64,
    pub bytes_received: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Share of received requests that produced an event
    pub fn acceptance_rate(&self) -> f64 {
        if self.requests_received == 0 {
            1.0
        } else {
            self.events_delivered as f64 / self.requests_received as f64
        }
    }
}
