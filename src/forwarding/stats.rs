//! Per-tunnel forwarding counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Live counters shared by the accept loop and every forwarding unit
#[derive(Debug, Default)]
pub struct ForwardStats {
    connection_count: AtomicU64,
    active_connections: AtomicU64,
    completed_connections: AtomicU64,
    failed_dials: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of `ForwardStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStatsSnapshot {
    /// Connections admitted since the tunnel was created
    pub connection_count: u64,
    /// Forwarding units currently running
    pub active_connections: u64,
    /// Units that ran both copy halves to completion
    pub completed_connections: u64,
    /// Units abandoned because the remote dial failed
    pub failed_dials: u64,
    /// Bytes copied local -> remote
    pub bytes_sent: u64,
    /// Bytes copied remote -> local
    pub bytes_received: u64,
}

impl ForwardStats {
    pub fn snapshot(&self) -> ForwardStatsSnapshot {
        ForwardStatsSnapshot {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Acquire),
            completed_connections: self.completed_connections.load(Ordering::Relaxed),
            failed_dials: self.failed_dials.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub(crate) fn connection_opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_completed(&self) {
        self.completed_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn dial_failed(&self) {
        self.failed_dials.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_accounting() {
        let stats = ForwardStats::default();
        stats.connection_opened();
        stats.connection_opened();
        assert_eq!(stats.active_connections(), 2);

        stats.connection_completed();
        stats.dial_failed();
        stats.add_sent(10);
        stats.add_received(32);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connection_count, 2);
        assert_eq!(snapshot.active_connections, 0);
        assert_eq!(snapshot.completed_connections, 1);
        assert_eq!(snapshot.failed_dials, 1);
        assert_eq!(snapshot.bytes_sent, 10);
        assert_eq!(snapshot.bytes_received, 32);
    }
}
