//! Connection and circuit counters.
//!
//! Each [`Server`](crate::Server) and [`Client`](crate::Client) owns its own
//! [`Metrics`]; there is no process-wide state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one client or relay instance
#[derive(Debug, Default)]
pub struct Metrics {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    active_circuits: AtomicU64,
    frames_forwarded: AtomicU64,
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Physical connections currently open
    pub active_connections: u64,
    /// Physical connections established since start
    pub total_connections: u64,
    /// Circuits (transports or relay relations) currently open
    pub active_circuits: u64,
    /// Frames passed through (relay) or delivered to a transport (client)
    pub frames_forwarded: u64,
}

impl Metrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        saturating_dec(&self.active_connections);
    }

    pub(crate) fn circuit_opened(&self) {
        self.active_circuits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn circuit_closed(&self) {
        saturating_dec(&self.active_circuits);
    }

    pub(crate) fn frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current values
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_circuits: self.active_circuits.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
        }
    }
}

fn saturating_dec(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        m.circuit_opened();
        m.frame_forwarded();

        let s = m.snapshot();
        assert_eq!(s.active_connections, 1);
        assert_eq!(s.total_connections, 2);
        assert_eq!(s.active_circuits, 1);
        assert_eq!(s.frames_forwarded, 1);
    }

    #[test]
    fn test_decrement_saturates() {
        let m = Metrics::new();
        m.circuit_closed();
        m.connection_closed();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
