//! Per-endpoint transfer statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lock-free counters updated on the endpoint's hot paths.
///
/// All counters use relaxed ordering: they are monotonic within a connection
/// epoch and only ever read for reporting.
#[derive(Debug, Default)]
pub struct EndpointStats {
    /// Bytes accepted by the send queue but not yet handed to the OS.
    pub bytes_pending: AtomicU64,
    /// Bytes in the flush buffer currently being drained.
    pub bytes_sending: AtomicU64,
    /// Total bytes written to the socket.
    pub bytes_sent: AtomicU64,
    /// Total bytes read from the socket.
    pub bytes_received: AtomicU64,
    /// Datagrams written (UDP only).
    pub datagrams_sent: AtomicU64,
    /// Datagrams read (UDP only).
    pub datagrams_received: AtomicU64,
}

/// A serializable point-in-time copy of [`EndpointStats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Bytes accepted by the send queue but not yet handed to the OS.
    pub bytes_pending: u64,
    /// Bytes in the flush buffer currently being drained.
    pub bytes_sending: u64,
    /// Total bytes written to the socket.
    pub bytes_sent: u64,
    /// Total bytes read from the socket.
    pub bytes_received: u64,
    /// Datagrams written (UDP only).
    pub datagrams_sent: u64,
    /// Datagrams read (UDP only).
    pub datagrams_received: u64,
}

impl EndpointStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_pending: self.bytes_pending.load(Ordering::Relaxed),
            bytes_sending: self.bytes_sending.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter to zero. Called when a connection epoch restarts.
    pub fn reset(&self) {
        self.bytes_pending.store(0, Ordering::Relaxed);
        self.bytes_sending.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.datagrams_sent.store(0, Ordering::Relaxed);
        self.datagrams_received.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = EndpointStats::new();
        stats.bytes_sent.fetch_add(42, Ordering::Relaxed);
        stats.datagrams_received.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 42);
        assert_eq!(snapshot.datagrams_received, 2);

        stats.reset();
        assert_eq!(stats.snapshot().bytes_sent, 0);
    }
}
