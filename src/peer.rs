//! Per-remote-endpoint session state machine: handshake, ping, delivery
//! channels, and the shutdown lifecycle.
//!
//! A [`NetPeer`] is shared between the socket-receive thread (which feeds it
//! packets), the logic thread (which ticks it), and user threads (which send
//! through it), so all state lives behind atomics or short-lived locks.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::config::{DeliveryMethod, NetConfig, MAX_CONNECTION_NUMBER};
use crate::event::DisconnectReason;
use crate::manager::NetInner;
use crate::packet::{
    self, sequence_greater_than, ConnectAcceptPacket, ConnectRequestPacket, NetPacket,
    PacketProperty, PONG_PACKET_SIZE,
};
use crate::stats::NetStatistics;
use crate::NetError;

/// Session start time in microseconds; doubles as the connection id, so a
/// newer session always compares greater.
pub(crate) fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// States of the peer state machine. The discriminants are bit flags so a
/// set of states can be passed as a mask to the peer accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Outgoing handshake in progress.
    Outgoing = 1 << 0,
    /// Incoming handshake awaiting the listener's decision.
    Incoming = 1 << 1,
    Connected = 1 << 2,
    /// We sent a disconnect and are waiting for the shutdown ack.
    ShutdownRequested = 1 << 3,
    Disconnected = 1 << 4,
}

impl ConnectionState {
    /// Mask matching every state.
    pub const ANY: u8 = 0b1_1111;

    fn from_bits(bits: u8) -> ConnectionState {
        match bits {
            0b0_0001 => ConnectionState::Outgoing,
            0b0_0010 => ConnectionState::Incoming,
            0b0_0100 => ConnectionState::Connected,
            0b0_1000 => ConnectionState::ShutdownRequested,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn mask(self) -> u8 {
        self as u8
    }
}

/// Classification of an incoming `ConnectRequest` relative to an existing
/// peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectRequestResult {
    /// Nothing to do: duplicate or stale request.
    None,
    /// The remote restarted and is opening a fresh session.
    Reconnection,
    /// The existing record is dead weight; replace it.
    NewConnection,
    /// Both sides dialed each other simultaneously.
    P2PConnection,
}

/// Outcome of processing a `Disconnect` datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownResult {
    None,
    /// A connected session was closed by the remote.
    Disconnect,
    /// A handshake in progress was refused.
    Reject,
}

/// Pure classifier for connect requests hitting an endpoint that already has
/// a peer record. Connection ids are session start times, so "newer" is a
/// straight comparison.
pub fn classify_connect_request(
    state: ConnectionState,
    current_id: u64,
    incoming_id: u64,
) -> ConnectRequestResult {
    match state {
        ConnectionState::Outgoing => ConnectRequestResult::P2PConnection,
        ConnectionState::Connected => {
            if incoming_id > current_id {
                ConnectRequestResult::Reconnection
            } else {
                ConnectRequestResult::None
            }
        }
        ConnectionState::Incoming => {
            if incoming_id > current_id {
                ConnectRequestResult::NewConnection
            } else {
                ConnectRequestResult::None
            }
        }
        ConnectionState::ShutdownRequested | ConnectionState::Disconnected => {
            ConnectRequestResult::NewConnection
        }
    }
}

#[derive(Debug)]
struct HandshakeState {
    attempts: u32,
    last_send: Instant,
    request_bytes: Vec<u8>,
    shutdown_bytes: Vec<u8>,
    shutdown_start: Option<Instant>,
}

#[derive(Debug)]
struct PingState {
    seq: u16,
    sent_at: Option<Instant>,
    accumulator: Duration,
    remote_seq: Option<u16>,
}

#[derive(Debug)]
struct ChannelSet {
    reliable_unordered: Channel,
    reliable_ordered: Channel,
    reliable_sequenced: Channel,
    sequenced: Channel,
    unreliable: Vec<Vec<u8>>,
}

impl ChannelSet {
    fn new() -> Self {
        Self {
            reliable_unordered: Channel::new(DeliveryMethod::ReliableUnordered),
            reliable_ordered: Channel::new(DeliveryMethod::ReliableOrdered),
            reliable_sequenced: Channel::new(DeliveryMethod::ReliableSequenced),
            sequenced: Channel::new(DeliveryMethod::Sequenced),
            unreliable: Vec::new(),
        }
    }

    fn by_method(&mut self, method: DeliveryMethod) -> Option<&mut Channel> {
        match method {
            DeliveryMethod::ReliableUnordered => Some(&mut self.reliable_unordered),
            DeliveryMethod::ReliableOrdered => Some(&mut self.reliable_ordered),
            DeliveryMethod::ReliableSequenced => Some(&mut self.reliable_sequenced),
            DeliveryMethod::Sequenced => Some(&mut self.sequenced),
            DeliveryMethod::Unreliable => None,
        }
    }

    fn reliable_channels(&mut self) -> [&mut Channel; 3] {
        [
            &mut self.reliable_unordered,
            &mut self.reliable_ordered,
            &mut self.reliable_sequenced,
        ]
    }
}

/// The per-remote-endpoint session record.
pub struct NetPeer {
    manager: Weak<NetInner>,
    self_ref: Weak<NetPeer>,
    endpoint: SocketAddr,
    config: NetConfig,

    state: AtomicU8,
    connect_id: AtomicU64,
    connection_num: AtomicU8,
    rtt_ms: AtomicU32,

    last_packet_time: Mutex<Instant>,
    handshake: Mutex<HandshakeState>,
    ping: Mutex<PingState>,
    channels: Mutex<ChannelSet>,

    statistics: NetStatistics,
}

impl NetPeer {
    fn new(
        manager: Weak<NetInner>,
        config: NetConfig,
        endpoint: SocketAddr,
        state: ConnectionState,
        connect_id: u64,
        connection_num: u8,
        request_bytes: Vec<u8>,
    ) -> Arc<NetPeer> {
        let now = Instant::now();
        Arc::new_cyclic(|self_ref| NetPeer {
            manager,
            self_ref: self_ref.clone(),
            endpoint,
            config,
            state: AtomicU8::new(state as u8),
            connect_id: AtomicU64::new(connect_id),
            connection_num: AtomicU8::new(connection_num % MAX_CONNECTION_NUMBER),
            rtt_ms: AtomicU32::new(0),
            last_packet_time: Mutex::new(now),
            handshake: Mutex::new(HandshakeState {
                attempts: 0,
                last_send: now,
                request_bytes,
                shutdown_bytes: Vec::new(),
                shutdown_start: None,
            }),
            ping: Mutex::new(PingState {
                seq: 0,
                sent_at: None,
                accumulator: Duration::ZERO,
                remote_seq: None,
            }),
            channels: Mutex::new(ChannelSet::new()),
            statistics: NetStatistics::new(),
        })
    }

    /// A dialing peer; call [`send_connect_request`](Self::send_connect_request)
    /// once it is resident in the table.
    pub(crate) fn new_outgoing(
        manager: Weak<NetInner>,
        config: NetConfig,
        endpoint: SocketAddr,
        connection_num: u8,
        connect_payload: &[u8],
    ) -> Arc<NetPeer> {
        let connect_id = unix_micros();
        let request_bytes = ConnectRequestPacket::serialize(
            config.protocol_id,
            connect_id,
            connection_num % MAX_CONNECTION_NUMBER,
            connect_payload,
        );
        Self::new(
            manager,
            config,
            endpoint,
            ConnectionState::Outgoing,
            connect_id,
            connection_num,
            request_bytes,
        )
    }

    /// A peer created for an incoming connect request, pending the
    /// listener's accept/reject decision.
    pub(crate) fn new_incoming(
        manager: Weak<NetInner>,
        config: NetConfig,
        endpoint: SocketAddr,
        connect_id: u64,
        connection_num: u8,
    ) -> Arc<NetPeer> {
        Self::new(
            manager,
            config,
            endpoint,
            ConnectionState::Incoming,
            connect_id,
            connection_num,
            Vec::new(),
        )
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_bits(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Atomically forces `Disconnected`; returns the prior state the first
    /// time, `None` when the peer was already down.
    pub(crate) fn force_disconnect(&self) -> Option<ConnectionState> {
        let prev = self
            .state
            .swap(ConnectionState::Disconnected as u8, Ordering::SeqCst);
        (prev != ConnectionState::Disconnected as u8).then(|| ConnectionState::from_bits(prev))
    }

    pub fn connect_id(&self) -> u64 {
        self.connect_id.load(Ordering::SeqCst)
    }

    pub fn connection_num(&self) -> u8 {
        self.connection_num.load(Ordering::SeqCst)
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn rtt_ms(&self) -> u32 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    /// One-way latency estimate.
    pub fn ping_ms(&self) -> u32 {
        self.rtt_ms() / 2
    }

    pub fn time_since_last_packet(&self) -> Duration {
        self.last_packet_time.lock().elapsed()
    }

    pub fn statistics(&self) -> &NetStatistics {
        &self.statistics
    }

    fn touch(&self) {
        *self.last_packet_time.lock() = Instant::now();
    }

    fn resend_delay(&self) -> Duration {
        Duration::from_millis((self.rtt_ms() as u64 * 2 + 25).max(100))
    }

    fn send_raw(&self, bytes: &[u8]) {
        if let Some(inner) = self.manager.upgrade() {
            inner.send_raw(bytes, self.endpoint);
            self.statistics.on_packet_sent(bytes.len());
        }
    }

    /// The `Arc` this record lives in; always upgradable while a method is
    /// executing through one.
    fn arc(&self) -> Option<Arc<NetPeer>> {
        self.self_ref.upgrade()
    }

    /// Fires the first connect request of an outgoing handshake.
    pub(crate) fn send_connect_request(&self) {
        let bytes = {
            let mut hs = self.handshake.lock();
            hs.attempts = 1;
            hs.last_send = Instant::now();
            hs.request_bytes.clone()
        };
        self.send_raw(&bytes);
    }

    /// Queues user data on the channel for `method`. The datagram leaves on
    /// the next flush.
    pub fn send(&self, data: &[u8], method: DeliveryMethod) -> Result<(), NetError> {
        if data.len() + packet::SEQUENCED_HEADER_SIZE > packet::MAX_PACKET_SIZE {
            return Err(NetError::MessageTooLarge);
        }
        if self.connection_state() != ConnectionState::Connected {
            return Err(NetError::PeerNotConnected);
        }
        let mut channels = self.channels.lock();
        match channels.by_method(method) {
            Some(channel) => channel.send(data),
            None => {
                let mut wire = vec![0u8; 1 + data.len()];
                wire[0] = PacketProperty::Unreliable as u8;
                wire[1..].copy_from_slice(data);
                channels.unreliable.push(wire);
            }
        }
        Ok(())
    }

    /// Sends everything queued on the channels, merging small datagrams when
    /// the manager allows it.
    pub fn flush(&self) {
        let mut out: Vec<Vec<u8>> = Vec::new();
        {
            let mut channels = self.channels.lock();
            for channel in channels.reliable_channels() {
                if let Some(ack) = channel.build_ack() {
                    out.push(ack);
                }
                channel.drain_outgoing(&mut out);
            }
            channels.sequenced.drain_outgoing(&mut out);
            out.append(&mut channels.unreliable);
        }
        if out.is_empty() {
            return;
        }
        if self.config.merge_enabled && out.len() > 1 {
            self.send_merged(out);
        } else {
            for wire in out {
                self.send_raw(&wire);
            }
        }
    }

    fn send_merged(&self, datagrams: Vec<Vec<u8>>) {
        // Conservative merge bound; stays well under typical MTUs.
        const MERGE_LIMIT: usize = 1400;
        let mut merged: Vec<u8> = vec![PacketProperty::Merged as u8];
        let mut count = 0usize;
        for wire in datagrams {
            if wire.len() + 3 > MERGE_LIMIT {
                self.send_raw(&wire);
                continue;
            }
            if merged.len() + 2 + wire.len() > MERGE_LIMIT {
                self.flush_merged(&mut merged, &mut count);
            }
            let mut len_buf = [0u8; 2];
            LittleEndian::write_u16(&mut len_buf, wire.len() as u16);
            merged.extend_from_slice(&len_buf);
            merged.extend_from_slice(&wire);
            count += 1;
        }
        self.flush_merged(&mut merged, &mut count);
    }

    fn flush_merged(&self, merged: &mut Vec<u8>, count: &mut usize) {
        match *count {
            0 => {}
            1 => {
                // A lone sub-packet goes out unwrapped.
                self.send_raw(&merged[3..]);
            }
            _ => self.send_raw(merged),
        }
        merged.truncate(1);
        *count = 0;
    }

    /// Advances timers: handshake retries, ping, retransmissions, shutdown
    /// resends, and the idle timeout. Called from the logic tick.
    pub fn update(&self, elapsed: Duration) {
        match self.connection_state() {
            ConnectionState::Connected => {
                if self.time_since_last_packet() > self.config.disconnect_timeout {
                    if let (Some(inner), Some(me)) = (self.manager.upgrade(), self.arc()) {
                        inner.handle_connection_lost(&me, DisconnectReason::Timeout, 0);
                    }
                    return;
                }
                self.update_ping(elapsed);
                let now = Instant::now();
                let resend = self.resend_delay();
                let lost = {
                    let mut channels = self.channels.lock();
                    let mut lost = 0;
                    for channel in channels.reliable_channels() {
                        channel.update(now, resend);
                        lost += channel.take_retransmissions();
                    }
                    lost
                };
                if lost > 0 {
                    self.statistics.on_packet_lost(lost);
                }
                self.flush();
            }
            ConnectionState::Outgoing => {
                let resend = {
                    let mut hs = self.handshake.lock();
                    if hs.last_send.elapsed() < self.config.reconnect_delay {
                        None
                    } else if hs.attempts >= self.config.max_connect_attempts {
                        Some(None)
                    } else {
                        hs.attempts += 1;
                        hs.last_send = Instant::now();
                        Some(Some(hs.request_bytes.clone()))
                    }
                };
                match resend {
                    Some(Some(bytes)) => self.send_raw(&bytes),
                    Some(None) => {
                        if let (Some(inner), Some(me)) = (self.manager.upgrade(), self.arc()) {
                            inner.handle_connection_lost(
                                &me,
                                DisconnectReason::ConnectionFailed,
                                0,
                            );
                        }
                    }
                    None => {}
                }
            }
            ConnectionState::Incoming => {
                // Never accepted; quietly age out.
                if self.time_since_last_packet() > self.config.disconnect_timeout {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            ConnectionState::ShutdownRequested => {
                let resend = {
                    let mut hs = self.handshake.lock();
                    match hs.shutdown_start {
                        Some(start) if start.elapsed() > self.config.disconnect_timeout => {
                            None
                        }
                        Some(_) if hs.last_send.elapsed() >= self.config.reconnect_delay => {
                            hs.last_send = Instant::now();
                            Some(hs.shutdown_bytes.clone())
                        }
                        Some(_) => return,
                        None => None,
                    }
                };
                match resend {
                    Some(bytes) => self.send_raw(&bytes),
                    None => self.set_state(ConnectionState::Disconnected),
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    fn update_ping(&self, elapsed: Duration) {
        let wire = {
            let mut ping = self.ping.lock();
            ping.accumulator += elapsed;
            if ping.accumulator < self.config.ping_interval {
                return;
            }
            ping.accumulator = Duration::ZERO;
            ping.seq = ping.seq.wrapping_add(1);
            ping.sent_at = Some(Instant::now());
            let mut wire = [0u8; 3];
            wire[0] = PacketProperty::Ping as u8;
            LittleEndian::write_u16(&mut wire[1..3], ping.seq);
            wire
        };
        self.send_raw(&wire);
    }

    /// Routes a datagram that reached this peer through the demultiplexer.
    /// Consumes (and recycles) the packet.
    pub(crate) fn process_packet(&self, packet: NetPacket) {
        self.touch();
        self.statistics.on_packet_received(packet.size());
        let property = packet.property();
        match property {
            PacketProperty::Ping => self.process_ping(packet.sequence()),
            PacketProperty::Pong => self.process_pong(&packet),
            PacketProperty::Unreliable => {
                if self.connection_state() != ConnectionState::Connected {
                    // Data from a session that is not (or no longer) live.
                } else if let (Some(inner), Some(me)) = (self.manager.upgrade(), self.arc()) {
                    // Transfers the pooled packet straight into the event.
                    inner.create_receive_event(&me, DeliveryMethod::Unreliable, packet);
                    return;
                }
            }
            PacketProperty::ReliableUnordered
            | PacketProperty::ReliableOrdered
            | PacketProperty::Sequenced
            | PacketProperty::ReliableSequenced
                if self.connection_state() == ConnectionState::Connected =>
            {
                let method = match property {
                    PacketProperty::ReliableUnordered => DeliveryMethod::ReliableUnordered,
                    PacketProperty::ReliableOrdered => DeliveryMethod::ReliableOrdered,
                    PacketProperty::Sequenced => DeliveryMethod::Sequenced,
                    _ => DeliveryMethod::ReliableSequenced,
                };
                let mut deliveries = Vec::new();
                {
                    let mut channels = self.channels.lock();
                    if let Some(channel) = channels.by_method(method) {
                        channel.process_data(packet.sequence(), packet.payload(), &mut deliveries);
                    }
                }
                if let (Some(inner), Some(me)) = (self.manager.upgrade(), self.arc()) {
                    for payload in deliveries {
                        let event_packet = inner.pool().get_with_data(property, &payload);
                        inner.create_receive_event(&me, method, event_packet);
                    }
                }
            }
            PacketProperty::AckReliable => {
                let raw = packet.raw();
                let method = match PacketProperty::from_byte(raw[1]) {
                    Some(PacketProperty::ReliableUnordered) => DeliveryMethod::ReliableUnordered,
                    Some(PacketProperty::ReliableOrdered) => DeliveryMethod::ReliableOrdered,
                    _ => DeliveryMethod::Unreliable,
                };
                let ack = LittleEndian::read_u16(&raw[2..4]);
                let bits = LittleEndian::read_u64(&raw[4..12]);
                let mut channels = self.channels.lock();
                if let Some(channel) = channels.by_method(method) {
                    channel.process_ack(ack, bits);
                }
            }
            PacketProperty::AckReliableSequenced => {
                let seq = packet.sequence();
                self.channels.lock().reliable_sequenced.process_ack_latest(seq);
            }
            PacketProperty::MtuCheck => {
                // Echo back so the remote can validate the probe size.
                let mut reply = packet.raw().to_vec();
                reply[0] = PacketProperty::MtuOk as u8;
                self.send_raw(&reply);
            }
            PacketProperty::ShutdownOk => {
                self.transition(
                    ConnectionState::ShutdownRequested,
                    ConnectionState::Disconnected,
                );
            }
            // MtuOk and anything unrecognized is dropped on the floor.
            _ => {}
        }
        if let Some(inner) = self.manager.upgrade() {
            inner.pool().recycle(packet);
        }
    }

    fn process_ping(&self, seq: u16) {
        let reply = {
            let mut ping = self.ping.lock();
            let fresh = match ping.remote_seq {
                Some(remote) => sequence_greater_than(seq, remote),
                None => true,
            };
            if !fresh {
                return;
            }
            ping.remote_seq = Some(seq);
            let mut wire = [0u8; PONG_PACKET_SIZE];
            wire[0] = PacketProperty::Pong as u8;
            LittleEndian::write_u16(&mut wire[1..3], seq);
            LittleEndian::write_u64(&mut wire[3..11], unix_micros());
            wire
        };
        self.send_raw(&reply);
    }

    fn process_pong(&self, packet: &NetPacket) {
        let seq = packet.sequence();
        let rtt = {
            let mut ping = self.ping.lock();
            if ping.seq != seq {
                return;
            }
            match ping.sent_at.take() {
                Some(sent_at) => sent_at.elapsed(),
                None => return,
            }
        };
        let sample = rtt.as_millis() as u32;
        let smoothed = match self.rtt_ms.load(Ordering::Relaxed) {
            0 => sample,
            avg => (avg * 7 + sample) / 8,
        };
        self.rtt_ms.store(smoothed, Ordering::Relaxed);
        if let (Some(inner), Some(me)) = (self.manager.upgrade(), self.arc()) {
            inner.create_latency_event(&me, smoothed);
        }
    }

    /// Classifies a connect request against this record; duplicate requests
    /// for the live session get their accept re-sent.
    pub(crate) fn process_connect_request(
        &self,
        request: &ConnectRequestPacket,
    ) -> ConnectRequestResult {
        self.touch();
        let state = self.connection_state();
        let result = classify_connect_request(state, self.connect_id(), request.connection_id);
        if result == ConnectRequestResult::None
            && state == ConnectionState::Connected
            && request.connection_id == self.connect_id()
        {
            // The accept datagram was lost; repeat it.
            self.send_connect_accept();
        }
        result
    }

    /// Handles a `ConnectAccept`; `true` exactly once, when the outgoing
    /// handshake completes.
    pub(crate) fn process_connect_accept(&self, packet: &NetPacket) -> bool {
        let accept = match ConnectAcceptPacket::parse(packet) {
            Some(accept) => accept,
            None => return false,
        };
        if accept.connection_id != self.connect_id() {
            return false;
        }
        self.touch();
        self.connection_num
            .store(accept.connection_number, Ordering::SeqCst);
        self.transition(ConnectionState::Outgoing, ConnectionState::Connected)
    }

    /// Handles a `Disconnect` datagram addressed to this session.
    pub(crate) fn process_disconnect(&self, packet: &NetPacket) -> ShutdownResult {
        let connection_id = packet::disconnect_connection_id(packet);
        if connection_id != self.connect_id() {
            return ShutdownResult::None;
        }
        match self.connection_state() {
            ConnectionState::Connected => {
                self.set_state(ConnectionState::Disconnected);
                ShutdownResult::Disconnect
            }
            ConnectionState::Outgoing | ConnectionState::Incoming => {
                self.set_state(ConnectionState::Disconnected);
                ShutdownResult::Reject
            }
            ConnectionState::ShutdownRequested => {
                self.set_state(ConnectionState::Disconnected);
                ShutdownResult::None
            }
            ConnectionState::Disconnected => ShutdownResult::None,
        }
    }

    /// Grants an incoming (or simultaneous) handshake. Returns `true` on the
    /// transition into `Connected`. The accept datagram is sent separately
    /// so the caller can order the connect event ahead of any data the
    /// remote races back.
    pub(crate) fn accept(&self, connection_id: u64, connection_number: u8) -> bool {
        self.connect_id.store(connection_id, Ordering::SeqCst);
        self.connection_num
            .store(connection_number % MAX_CONNECTION_NUMBER, Ordering::SeqCst);
        self.transition(ConnectionState::Incoming, ConnectionState::Connected)
            || self.transition(ConnectionState::Outgoing, ConnectionState::Connected)
    }

    pub(crate) fn send_connect_accept(&self) {
        let bytes = ConnectAcceptPacket::serialize(self.connect_id(), self.connection_num());
        self.send_raw(&bytes);
    }

    /// Refuses an incoming handshake, optionally attaching reject data.
    pub(crate) fn reject(&self, connection_id: u64, _connection_number: u8, data: &[u8]) {
        let bytes = packet::serialize_disconnect(connection_id, data);
        self.send_raw(&bytes);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Starts (or forces) the shutdown lifecycle. Returns `false` when the
    /// peer is already shut down.
    pub(crate) fn shutdown(&self, data: &[u8], force: bool) -> bool {
        let state = self.connection_state();
        if state == ConnectionState::Disconnected {
            return false;
        }
        if force {
            self.set_state(ConnectionState::Disconnected);
            return true;
        }
        if state == ConnectionState::ShutdownRequested {
            return false;
        }
        let bytes = packet::serialize_disconnect(self.connect_id(), data);
        {
            let mut hs = self.handshake.lock();
            let now = Instant::now();
            hs.shutdown_bytes = bytes.clone();
            hs.shutdown_start = Some(now);
            hs.last_send = now;
        }
        self.set_state(ConnectionState::ShutdownRequested);
        self.send_raw(&bytes);
        true
    }
}

impl std::fmt::Debug for NetPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetPeer")
            .field("endpoint", &self.endpoint)
            .field("state", &self.connection_state())
            .field("connect_id", &self.connect_id())
            .field("connection_num", &self.connection_num())
            .finish()
    }
}
