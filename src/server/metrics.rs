//! Server counters.
//!
//! Aggregates only; nothing here identifies a peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free connection counters.
#[derive(Debug)]
pub struct ServerMetrics {
    start_time: Instant,
    /// Connections accepted
    total_connections: AtomicU64,
    /// Connections currently being handled
    active_connections: AtomicU64,
    /// Peers that passed the authentication gate
    authenticated: AtomicU64,
    /// Peers served the decoy
    decoyed: AtomicU64,
    /// TLS handshakes that failed or timed out
    handshake_failures: AtomicU64,
    /// Sessions that ended with a transport, protocol or interface fault
    session_faults: AtomicU64,
}

impl ServerMetrics {
    /// Zeroed counters; uptime starts now.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            authenticated: AtomicU64::new(0),
            decoyed: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            session_faults: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection task finished.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Gate accepted the peer.
    pub fn increment_authenticated(&self) {
        self.authenticated.fetch_add(1, Ordering::Relaxed);
    }

    /// Peer was served the decoy.
    pub fn increment_decoyed(&self) {
        self.decoyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Handshake failed or timed out.
    pub fn increment_handshake_failures(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Session ended with a fault.
    pub fn increment_session_faults(&self) {
        self.session_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            authenticated: self.authenticated.load(Ordering::Relaxed),
            decoyed: self.decoyed.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            session_faults: self.session_faults.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Seconds since the server started
    pub uptime_secs: u64,
    /// Accepted since start
    pub total_connections: u64,
    /// Connection tasks still running
    pub active_connections: u64,
    /// Passed the gate
    pub authenticated: u64,
    /// Served the decoy
    pub decoyed: u64,
    /// Failed or aborted handshakes
    pub handshake_failures: u64,
    /// Sessions ended by a fault
    pub session_faults: u64,
}

impl MetricsSnapshot {
    /// Share of accepted connections that were probers.
    pub fn decoy_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.decoyed as f64 / self.total_connections as f64
        }
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "uptime={}s connections={} active={} authenticated={} decoyed={} \
             handshake_failures={} session_faults={} decoy_rate={:.2}",
            self.uptime_secs,
            self.total_connections,
            self.active_connections,
            self.authenticated,
            self.decoyed,
            self.handshake_failures,
            self.session_faults,
            self.decoy_rate(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let metrics = ServerMetrics::new();

        metrics.increment_connections();
        metrics.increment_connections();
        metrics.decrement_connections();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
    }

    #[test]
    fn test_verdict_counters() {
        let metrics = ServerMetrics::new();
        for _ in 0..3 {
            metrics.increment_connections();
        }
        metrics.increment_authenticated();
        metrics.increment_decoyed();
        metrics.increment_decoyed();
        metrics.increment_handshake_failures();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.authenticated, 1);
        assert_eq!(snapshot.decoyed, 2);
        assert_eq!(snapshot.handshake_failures, 1);
        assert!((snapshot.decoy_rate() - 2.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_empty_rate() {
        assert_eq!(ServerMetrics::new().snapshot().decoy_rate(), 0.0);
    }

    #[test]
    fn test_display() {
        let metrics = ServerMetrics::new();
        metrics.increment_connections();
        metrics.increment_connections();
        metrics.increment_decoyed();
        metrics.increment_session_faults();

        let line = metrics.snapshot().to_string();
        assert!(line.contains("connections=2"));
        assert!(line.contains("session_faults=1"));
        assert!(line.contains("decoy_rate=0.50"));
    }
}
