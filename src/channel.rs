//! Delivery channels implementing the reliable and sequenced methods.
//!
//! Each connected peer owns one channel per delivery method. A channel keeps
//! its own 16-bit sequence space, an ack bitfield window for the reliable
//! methods, and a retransmission queue serviced from the peer's update tick.
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::DeliveryMethod;
use crate::packet::{sequence_diff, sequence_greater_than, PacketProperty, SEQUENCED_HEADER_SIZE};

/// In-flight window; matches the 64-bit ack bitfield.
const WINDOW_SIZE: usize = 64;

fn data_property(method: DeliveryMethod) -> PacketProperty {
    match method {
        DeliveryMethod::Unreliable => PacketProperty::Unreliable,
        DeliveryMethod::ReliableUnordered => PacketProperty::ReliableUnordered,
        DeliveryMethod::ReliableOrdered => PacketProperty::ReliableOrdered,
        DeliveryMethod::Sequenced => PacketProperty::Sequenced,
        DeliveryMethod::ReliableSequenced => PacketProperty::ReliableSequenced,
    }
}

#[derive(Debug)]
struct PendingMessage {
    buf: Vec<u8>,
    sent_at: Instant,
    retries: u32,
}

/// One delivery method's sequencing, acknowledgment, and retransmit state.
#[derive(Debug)]
pub(crate) struct Channel {
    method: DeliveryMethod,

    local_seq: u16,

    // Receive side: `remote_seq` anchors the ack bitfield; bit 0 is
    // `remote_seq` itself, bit N is `remote_seq - N`.
    remote_seq: u16,
    received_bits: u64,
    started: bool,
    ordered_expected: u16,
    ordered_buffer: HashMap<u16, Vec<u8>>,
    must_ack: bool,

    // Send side.
    pending: HashMap<u16, PendingMessage>,
    backlog: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
    retransmissions: u64,
}

impl Channel {
    pub fn new(method: DeliveryMethod) -> Self {
        Self {
            method,
            local_seq: 0,
            remote_seq: 0,
            received_bits: 0,
            started: false,
            ordered_expected: 0,
            ordered_buffer: HashMap::new(),
            must_ack: false,
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            outgoing: VecDeque::new(),
            retransmissions: 0,
        }
    }

    fn build_wire(&mut self, payload: &[u8]) -> (u16, Vec<u8>) {
        let seq = self.local_seq;
        self.local_seq = self.local_seq.wrapping_add(1);
        let mut wire = vec![0u8; SEQUENCED_HEADER_SIZE + payload.len()];
        wire[0] = data_property(self.method) as u8;
        LittleEndian::write_u16(&mut wire[1..3], seq);
        wire[SEQUENCED_HEADER_SIZE..].copy_from_slice(payload);
        (seq, wire)
    }

    fn register(&mut self, seq: u16, wire: Vec<u8>) {
        self.outgoing.push_back(wire.clone());
        self.pending.insert(
            seq,
            PendingMessage {
                buf: wire,
                sent_at: Instant::now(),
                retries: 0,
            },
        );
    }

    /// Queues a payload for sending; the wire datagram is picked up by the
    /// next flush.
    pub fn send(&mut self, payload: &[u8]) {
        let (seq, wire) = self.build_wire(payload);
        match self.method {
            DeliveryMethod::Sequenced => self.outgoing.push_back(wire),
            DeliveryMethod::ReliableSequenced => {
                // Only the newest message is worth retransmitting.
                self.pending.clear();
                self.register(seq, wire);
            }
            _ => {
                if self.pending.len() >= WINDOW_SIZE {
                    self.backlog.push_back(wire);
                } else {
                    self.register(seq, wire);
                }
            }
        }
    }

    /// Marks a sequence as received. Returns `true` when it was not seen
    /// before (and therefore should be delivered or buffered).
    fn mark_received(&mut self, seq: u16) -> bool {
        if !self.started {
            self.started = true;
            self.remote_seq = seq;
            self.received_bits = 1;
            return true;
        }
        let diff = sequence_diff(seq, self.remote_seq);
        if diff > 0 {
            self.received_bits = if diff >= 64 {
                1
            } else {
                (self.received_bits << diff) | 1
            };
            self.remote_seq = seq;
            true
        } else if diff == 0 {
            false
        } else if diff > -(WINDOW_SIZE as i32) {
            let bit = 1u64 << (-diff);
            let duplicate = self.received_bits & bit != 0;
            self.received_bits |= bit;
            !duplicate
        } else {
            // Too old to track; treat as duplicate.
            false
        }
    }

    /// Routes an incoming data datagram, appending deliverable payloads in
    /// order to `deliveries`.
    pub fn process_data(&mut self, seq: u16, payload: &[u8], deliveries: &mut Vec<Vec<u8>>) {
        match self.method {
            DeliveryMethod::Sequenced => {
                if !self.started || sequence_greater_than(seq, self.remote_seq) {
                    self.started = true;
                    self.remote_seq = seq;
                    deliveries.push(payload.to_vec());
                }
            }
            DeliveryMethod::ReliableSequenced => {
                let fresh = !self.started || sequence_greater_than(seq, self.remote_seq);
                self.started = true;
                if fresh {
                    self.remote_seq = seq;
                    deliveries.push(payload.to_vec());
                }
                self.must_ack = true;
            }
            DeliveryMethod::ReliableUnordered => {
                if self.mark_received(seq) {
                    deliveries.push(payload.to_vec());
                }
                self.must_ack = true;
            }
            DeliveryMethod::ReliableOrdered => {
                if self.mark_received(seq) {
                    if seq == self.ordered_expected {
                        deliveries.push(payload.to_vec());
                        self.ordered_expected = self.ordered_expected.wrapping_add(1);
                        while let Some(buffered) = self.ordered_buffer.remove(&self.ordered_expected)
                        {
                            deliveries.push(buffered);
                            self.ordered_expected = self.ordered_expected.wrapping_add(1);
                        }
                    } else if sequence_greater_than(seq, self.ordered_expected) {
                        self.ordered_buffer.insert(seq, payload.to_vec());
                    }
                }
                self.must_ack = true;
            }
            DeliveryMethod::Unreliable => deliveries.push(payload.to_vec()),
        }
    }

    /// Applies an ack bitfield, dropping acknowledged messages from the
    /// retransmit set and refilling the window from the backlog.
    pub fn process_ack(&mut self, ack: u16, bits: u64) {
        self.pending.retain(|&seq, _| {
            let diff = sequence_diff(ack, seq);
            if diff == 0 {
                return false;
            }
            !(diff > 0 && diff < WINDOW_SIZE as i32 && (bits >> diff) & 1 != 0)
        });
        while self.pending.len() < WINDOW_SIZE {
            match self.backlog.pop_front() {
                Some(wire) => {
                    let seq = LittleEndian::read_u16(&wire[1..3]);
                    self.register(seq, wire);
                }
                None => break,
            }
        }
    }

    /// Applies a latest-only ack (`ReliableSequenced`).
    pub fn process_ack_latest(&mut self, seq: u16) {
        self.pending.remove(&seq);
    }

    /// Builds the pending ack datagram, if one is owed.
    pub fn build_ack(&mut self) -> Option<Vec<u8>> {
        if !self.must_ack {
            return None;
        }
        self.must_ack = false;
        match self.method {
            DeliveryMethod::ReliableSequenced => {
                let mut wire = vec![0u8; SEQUENCED_HEADER_SIZE];
                wire[0] = PacketProperty::AckReliableSequenced as u8;
                LittleEndian::write_u16(&mut wire[1..3], self.remote_seq);
                Some(wire)
            }
            DeliveryMethod::ReliableUnordered | DeliveryMethod::ReliableOrdered => {
                let mut wire = vec![0u8; crate::packet::ACK_PACKET_SIZE];
                wire[0] = PacketProperty::AckReliable as u8;
                wire[1] = data_property(self.method) as u8;
                LittleEndian::write_u16(&mut wire[2..4], self.remote_seq);
                LittleEndian::write_u64(&mut wire[4..12], self.received_bits);
                Some(wire)
            }
            _ => None,
        }
    }

    /// Requeues unacked messages older than `resend_delay`.
    pub fn update(&mut self, now: Instant, resend_delay: std::time::Duration) {
        for pending in self.pending.values_mut() {
            if now.duration_since(pending.sent_at) >= resend_delay {
                pending.sent_at = now;
                pending.retries += 1;
                self.retransmissions += 1;
                self.outgoing.push_back(pending.buf.clone());
            }
        }
    }

    /// Moves ready-to-send wire datagrams into `out`.
    pub fn drain_outgoing(&mut self, out: &mut Vec<Vec<u8>>) {
        out.extend(self.outgoing.drain(..));
    }

    /// Retransmission count since the last call; feeds loss statistics.
    pub fn take_retransmissions(&mut self) -> u64 {
        std::mem::take(&mut self.retransmissions)
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.backlog.is_empty() || !self.outgoing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn seq_of(wire: &[u8]) -> u16 {
        LittleEndian::read_u16(&wire[1..3])
    }

    fn drain(channel: &mut Channel) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        channel.drain_outgoing(&mut out);
        out
    }

    #[test]
    fn reliable_ordered_buffers_gaps() {
        let mut channel = Channel::new(DeliveryMethod::ReliableOrdered);
        let mut deliveries = Vec::new();

        channel.process_data(1, b"second", &mut deliveries);
        assert!(deliveries.is_empty());
        channel.process_data(0, b"first", &mut deliveries);
        assert_eq!(deliveries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn reliable_unordered_delivers_immediately_and_dedups() {
        let mut channel = Channel::new(DeliveryMethod::ReliableUnordered);
        let mut deliveries = Vec::new();

        channel.process_data(5, b"a", &mut deliveries);
        channel.process_data(5, b"a", &mut deliveries);
        channel.process_data(3, b"b", &mut deliveries);
        assert_eq!(deliveries.len(), 2);
    }

    #[test]
    fn sequenced_drops_stale() {
        let mut channel = Channel::new(DeliveryMethod::Sequenced);
        let mut deliveries = Vec::new();

        channel.process_data(10, b"new", &mut deliveries);
        channel.process_data(9, b"old", &mut deliveries);
        channel.process_data(11, b"newer", &mut deliveries);
        assert_eq!(deliveries, vec![b"new".to_vec(), b"newer".to_vec()]);
    }

    #[test]
    fn ack_clears_pending() {
        let mut channel = Channel::new(DeliveryMethod::ReliableUnordered);
        channel.send(b"one");
        channel.send(b"two");
        assert_eq!(drain(&mut channel).len(), 2);

        // Ack newest (seq 1) plus bit 1 covering seq 0.
        channel.process_ack(1, 0b10);
        assert!(!channel.has_pending());
    }

    #[test]
    fn unacked_messages_are_retransmitted() {
        let mut channel = Channel::new(DeliveryMethod::ReliableUnordered);
        channel.send(b"payload");
        drain(&mut channel);

        channel.update(
            Instant::now() + Duration::from_millis(500),
            Duration::from_millis(100),
        );
        let resent = drain(&mut channel);
        assert_eq!(resent.len(), 1);
        assert_eq!(seq_of(&resent[0]), 0);
        assert_eq!(channel.take_retransmissions(), 1);
    }

    #[test]
    fn window_overflow_goes_to_backlog() {
        let mut channel = Channel::new(DeliveryMethod::ReliableUnordered);
        for _ in 0..WINDOW_SIZE + 10 {
            channel.send(b"x");
        }
        assert_eq!(drain(&mut channel).len(), WINDOW_SIZE);

        // Acking the first datagram releases one backlog entry.
        channel.process_ack(0, 0);
        let released = drain(&mut channel);
        assert_eq!(released.len(), 1);
        assert_eq!(seq_of(&released[0]), WINDOW_SIZE as u16);
    }

    #[test]
    fn reliable_sequenced_keeps_only_latest() {
        let mut channel = Channel::new(DeliveryMethod::ReliableSequenced);
        channel.send(b"a");
        channel.send(b"b");
        drain(&mut channel);

        channel.update(
            Instant::now() + Duration::from_millis(500),
            Duration::from_millis(100),
        );
        let resent = drain(&mut channel);
        assert_eq!(resent.len(), 1);
        assert_eq!(seq_of(&resent[0]), 1);

        channel.process_ack_latest(1);
        assert!(!channel.has_pending());
    }

    #[test]
    fn ack_builds_for_reliable_only() {
        let mut channel = Channel::new(DeliveryMethod::ReliableOrdered);
        let mut deliveries = Vec::new();
        channel.process_data(0, b"x", &mut deliveries);
        let ack = channel.build_ack().unwrap();
        assert_eq!(ack[0], PacketProperty::AckReliable as u8);
        assert_eq!(ack[1], PacketProperty::ReliableOrdered as u8);
        assert!(channel.build_ack().is_none());

        let mut sequenced = Channel::new(DeliveryMethod::Sequenced);
        sequenced.process_data(0, b"x", &mut deliveries);
        assert!(sequenced.build_ack().is_none());
    }
}
