//! The logic tick: a fixed-period background loop that advances every peer,
//! reaps dead records, services the simulated-latency queue, and paces
//! itself to the configured update time.
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::peer::NetPeer;

use super::NetInner;

pub(crate) fn logic_loop(inner: Arc<NetInner>) {
    let mut previous_tick = Instant::now();
    while inner.running.load(std::sync::atomic::Ordering::SeqCst) {
        let tick_start = Instant::now();

        // Matured simulated-latency datagrams re-enter the receive path.
        for delayed in inner.simulator.drain_ready() {
            inner.handle_datagram(&delayed.data, delayed.remote);
        }

        let elapsed = tick_start
            .duration_since(previous_tick)
            .max(Duration::from_millis(1));
        previous_tick = tick_start;

        let mut expired: SmallVec<[Arc<NetPeer>; 8]> = SmallVec::new();
        let mut total_loss = 0u64;
        for peer in inner.peers.snapshot() {
            if peer.connection_state() == crate::peer::ConnectionState::Disconnected {
                // Lingering records are kept around for one more timeout so
                // late datagrams die quietly instead of respawning sessions.
                if peer.time_since_last_packet() > inner.config.disconnect_timeout {
                    expired.push(peer);
                }
                continue;
            }
            peer.update(elapsed);
            total_loss += peer.statistics().packet_loss();
        }
        inner.peers.remove_many(&expired);
        drop(expired);
        inner.statistics.store_packet_loss(total_loss);

        if let Some(remainder) = inner.config.update_time.checked_sub(tick_start.elapsed()) {
            std::thread::sleep(remainder);
        }
    }
}
