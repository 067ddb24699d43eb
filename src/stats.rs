//! Traffic counters kept per manager and per peer.
use std::sync::atomic::{AtomicU64, Ordering};

/// Datagram and byte counters, safe to read from any thread.
#[derive(Debug, Default)]
pub struct NetStatistics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packet_loss: AtomicU64,
}

impl NetStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_packet_lost(&self, count: u64) {
        self.packet_loss.fetch_add(count, Ordering::Relaxed);
    }

    /// Overwrites the loss counter with an aggregate computed elsewhere;
    /// used by the logic tick to roll per-peer loss into the manager total.
    pub(crate) fn store_packet_loss(&self, total: u64) {
        self.packet_loss.store(total, Ordering::Relaxed);
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Retransmissions observed on reliable channels; an estimate of wire loss.
    pub fn packet_loss(&self) -> u64 {
        self.packet_loss.load(Ordering::Relaxed)
    }

    pub fn packet_loss_percent(&self) -> f64 {
        let sent = self.packets_sent();
        if sent == 0 {
            return 0.0;
        }
        self.packet_loss() as f64 * 100.0 / sent as f64
    }

    pub fn reset(&self) {
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.packet_loss.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Display for NetStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} pkt / {} B, received {} pkt / {} B, loss {}",
            self.packets_sent(),
            self.bytes_sent(),
            self.packets_received(),
            self.bytes_received(),
            self.packet_loss()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = NetStatistics::new();
        stats.on_packet_sent(100);
        stats.on_packet_sent(50);
        stats.on_packet_received(25);
        stats.on_packet_lost(1);

        assert_eq!(stats.packets_sent(), 2);
        assert_eq!(stats.bytes_sent(), 150);
        assert_eq!(stats.packets_received(), 1);
        assert_eq!(stats.bytes_received(), 25);
        assert_eq!(stats.packet_loss(), 1);
        assert!(stats.packet_loss_percent() > 0.0);

        stats.reset();
        assert_eq!(stats.packets_sent(), 0);
        assert_eq!(stats.packet_loss(), 0);
    }
}
