//! Network condition simulation on the receive path: random loss and
//! artificial latency for testing under bad-network conditions.
//!
//! Delayed datagrams are parked in a list and drained by the logic tick once
//! their release time has passed. Timing is approximate by design; accuracy
//! is bounded by the tick period.
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::config::NetConfig;

/// Delays shorter than this are delivered immediately.
const MIN_LATENCY_FLOOR: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub(crate) struct DelayedDatagram {
    pub data: Vec<u8>,
    pub remote: SocketAddr,
    release_at: Instant,
}

/// Outcome of running an incoming datagram through the simulator.
pub(crate) enum SimulationVerdict {
    Deliver,
    Dropped,
    Delayed,
}

/// Receive-path loss and latency injector.
#[derive(Debug, Default)]
pub(crate) struct NetSimulator {
    delayed: Mutex<Vec<DelayedDatagram>>,
}

impl NetSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides the fate of an incoming datagram. `Delayed` means the bytes
    /// were copied into the delayed list and the caller must not process them.
    pub fn intercept(
        &self,
        config: &NetConfig,
        data: &[u8],
        remote: SocketAddr,
    ) -> SimulationVerdict {
        let mut rng = rand::rng();

        if config.simulate_packet_loss
            && rng.random_range(0..100) < config.simulation_packet_loss_chance as u32
        {
            return SimulationVerdict::Dropped;
        }

        if config.simulate_latency {
            let min = config.simulation_min_latency;
            let max = config.simulation_max_latency;
            let delay = if max > min {
                min + Duration::from_micros(rng.random_range(0..(max - min).as_micros() as u64))
            } else {
                min
            };
            if delay > MIN_LATENCY_FLOOR {
                self.delayed.lock().push(DelayedDatagram {
                    data: data.to_vec(),
                    remote,
                    release_at: Instant::now() + delay,
                });
                return SimulationVerdict::Delayed;
            }
        }

        SimulationVerdict::Deliver
    }

    /// Removes and returns every datagram whose release time has passed.
    /// Linear scan; the list is tiny in practice.
    pub fn drain_ready(&self) -> Vec<DelayedDatagram> {
        let mut delayed = self.delayed.lock();
        if delayed.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let mut ready = Vec::new();
        let mut index = 0;
        while index < delayed.len() {
            if delayed[index].release_at <= now {
                ready.push(delayed.swap_remove(index));
            } else {
                index += 1;
            }
        }
        ready
    }

    pub fn clear(&self) {
        self.delayed.lock().clear();
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.delayed.lock().len()
    }
}
