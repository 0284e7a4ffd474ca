//! Server-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a running server
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// PDUs handed to handlers
    pub pdus_delivered: AtomicU64,
    /// Unmatched deliveries caused by a full read buffer
    pub overflows: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_read: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_written: AtomicU64,
}

/// Plain copy of [`ServerStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: u64,
    pub pdus_delivered: u64,
    pub overflows: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pdu_delivered(&self) {
        self.pdus_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflowed(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            pdus_delivered: self.pdus_delivered.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();

        let snap = stats.snapshot();
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.active_connections, 1);
    }

    #[test]
    fn test_traffic_counters() {
        let stats = ServerStats::new();
        stats.bytes_read(10);
        stats.bytes_written(4);
        stats.pdu_delivered();
        stats.overflowed();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_read, 10);
        assert_eq!(snap.bytes_written, 4);
        assert_eq!(snap.pdus_delivered, 1);
        assert_eq!(snap.overflows, 1);
    }
}
