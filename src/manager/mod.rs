//! The central multiplexer: socket ownership, the peer table, the event
//! stream, and the user-facing lifecycle and send API.
mod demux;
mod tick;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::config::{DeliveryMethod, NetConfig};
use crate::event::{
    ConnectionRequest, ConnectionRequestType, DisconnectInfo, DisconnectReason, EventKind,
    EventQueue, NetEvent, NetListener, UnconnectedMessageType,
};
use crate::nat::NatPunchModule;
use crate::packet::{ConnectRequestPacket, NetPacket, PacketProperty, MAX_PACKET_SIZE};
use crate::peer::{ConnectionState, NetPeer};
use crate::peer_table::PeerTable;
use crate::pool::PacketPool;
use crate::simulator::NetSimulator;
use crate::socket::NetSocket;
use crate::stats::NetStatistics;
use crate::NetError;

/// Shared manager state reachable from the receive threads, the logic
/// thread, and user threads.
pub(crate) struct NetInner {
    pub(crate) config: NetConfig,
    pub(crate) self_ref: Weak<NetInner>,
    listener: Arc<dyn NetListener>,

    socket: Mutex<Option<Arc<NetSocket>>>,
    pub(crate) peers: PeerTable,
    pub(crate) pool: PacketPool,
    events: EventQueue,
    pub(crate) statistics: NetStatistics,
    pub(crate) simulator: NetSimulator,
    nat: NatPunchModule,

    pub(crate) running: AtomicBool,
    logic_thread: Mutex<Option<JoinHandle<()>>>,
    connected_count: AtomicI32,
}

/// Connection-oriented reliable message transport over UDP.
///
/// Owns the datagram sockets, routes every incoming datagram to the right
/// peer state machine, drives a periodic logic tick, and reports activity to
/// the [`NetListener`] via [`poll_events`](NetManager::poll_events).
pub struct NetManager {
    inner: Arc<NetInner>,
}

impl NetManager {
    /// Builds a stopped manager; call [`start`](Self::start) to bind.
    pub fn new(config: NetConfig, listener: Arc<dyn NetListener>) -> NetManager {
        let inner = Arc::new_cyclic(|self_ref: &Weak<NetInner>| NetInner {
            config,
            self_ref: self_ref.clone(),
            listener,
            socket: Mutex::new(None),
            peers: PeerTable::new(),
            pool: PacketPool::new(),
            events: EventQueue::new(),
            statistics: NetStatistics::new(),
            simulator: NetSimulator::new(),
            nat: NatPunchModule::new(self_ref.clone()),
            running: AtomicBool::new(false),
            logic_thread: Mutex::new(None),
            connected_count: AtomicI32::new(0),
        });
        NetManager { inner }
    }

    /// Binds to `port` on all v4 interfaces and starts the logic tick.
    /// Returns `false` when already running, on invalid configuration, or
    /// when the bind fails.
    pub fn start(&self, port: u16) -> bool {
        self.start_bound(Ipv4Addr::UNSPECIFIED, None, port)
    }

    /// Binds explicit v4 (and optionally v6) addresses.
    pub fn start_bound(&self, addr_v4: Ipv4Addr, addr_v6: Option<Ipv6Addr>, port: u16) -> bool {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = inner.config.validate() {
            log::warn!("invalid configuration: {e}");
            inner.running.store(false, Ordering::SeqCst);
            return false;
        }
        let sink: Arc<dyn crate::socket::MessageSink> = inner.clone();
        let socket = match NetSocket::bind(
            addr_v4,
            addr_v6,
            port,
            inner.config.reuse_address,
            sink,
        ) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                log::warn!("bind failed on port {port}: {e}");
                inner.running.store(false, Ordering::SeqCst);
                return false;
            }
        };
        *inner.socket.lock() = Some(socket);

        let tick_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("netmux-logic".into())
            .spawn(move || tick::logic_loop(tick_inner));
        match handle {
            Ok(handle) => {
                *inner.logic_thread.lock() = Some(handle);
                true
            }
            Err(e) => {
                log::warn!("failed to spawn logic thread: {e}");
                let socket = inner.socket.lock().take();
                drop(socket);
                inner.running.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Port the v4 socket is bound to, 0 when stopped.
    pub fn local_port(&self) -> u16 {
        self.inner.local_port()
    }

    /// Graceful shutdown: a final disconnect datagram per peer, then the
    /// logic thread is joined, sockets closed, and all state cleared.
    /// Idempotent; must not be called from the logic thread itself.
    pub fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for peer in inner.peers.snapshot() {
            peer.shutdown(&[], false);
        }
        if let Some(handle) = inner.logic_thread.lock().take() {
            let _ = handle.join();
        }
        // Take the socket out before closing: close() joins the receive
        // threads, and one of them may be blocked on the socket mutex in
        // send_raw.
        let socket = inner.socket.lock().take();
        if let Some(socket) = socket {
            socket.close();
        }
        inner.peers.clear();
        for packet in inner.events.clear() {
            inner.pool.recycle(packet);
        }
        inner.simulator.clear();
        inner.connected_count.store(0, Ordering::SeqCst);
    }

    /// Opens (or returns the existing) session towards `endpoint`, with an
    /// opaque payload delivered inside the connect request.
    pub fn connect(
        &self,
        endpoint: SocketAddr,
        connect_payload: &[u8],
    ) -> Result<Arc<NetPeer>, NetError> {
        let inner = &self.inner;
        if !inner.running.load(Ordering::SeqCst) {
            return Err(NetError::NotRunning);
        }

        let mut connection_number = 0;
        if let Some(existing) = inner.peers.get(endpoint) {
            match existing.connection_state() {
                ConnectionState::Connected
                | ConnectionState::Outgoing
                | ConnectionState::Incoming => return Ok(existing),
                _ => {
                    connection_number = (existing.connection_num() + 1)
                        % crate::config::MAX_CONNECTION_NUMBER;
                    inner.peers.remove(&existing);
                }
            }
        }

        let peer = NetPeer::new_outgoing(
            inner.self_ref.clone(),
            inner.config.clone(),
            endpoint,
            connection_number,
            connect_payload,
        );
        let resident = inner.peers.try_add(peer.clone());
        if Arc::ptr_eq(&resident, &peer) {
            peer.send_connect_request();
        }
        Ok(resident)
    }

    /// Drains queued events, invoking the listener for each on the calling
    /// thread. A no-op under `unsynced_events`.
    pub fn poll_events(&self) {
        let inner = &self.inner;
        if inner.config.unsynced_events {
            return;
        }
        let mut drained: Vec<Box<NetEvent>> = Vec::new();
        inner.events.drain_into(&mut drained);
        for mut event in drained {
            inner.dispatch_event(&mut event);
            if let Some(packet) = inner.events.release(event) {
                inner.pool.recycle(packet);
            }
        }
    }

    /// Pushes every peer's queued datagrams onto the wire now instead of
    /// waiting for the next tick.
    pub fn flush(&self) {
        for peer in self.inner.peers.snapshot() {
            peer.flush();
        }
    }

    /// Queues `data` to every connected peer.
    pub fn send_to_all(&self, data: &[u8], method: DeliveryMethod) {
        self.send_to_all_except(data, method, None);
    }

    /// Queues `data` to every connected peer except `exclude`.
    pub fn send_to_all_except(
        &self,
        data: &[u8],
        method: DeliveryMethod,
        exclude: Option<&Arc<NetPeer>>,
    ) {
        for peer in self.inner.peers.snapshot() {
            if let Some(excluded) = exclude {
                if Arc::ptr_eq(&peer, excluded) {
                    continue;
                }
            }
            let _ = peer.send(data, method);
        }
    }

    /// Sends a connectionless message; the receiver surfaces it only when it
    /// has `unconnected_messages_enabled`.
    pub fn send_unconnected_message(&self, data: &[u8], endpoint: SocketAddr) -> bool {
        self.inner
            .send_property_packet(PacketProperty::UnconnectedMessage, data, endpoint)
    }

    /// Broadcasts a discovery request on the local network.
    pub fn send_discovery_request(&self, data: &[u8], port: u16) -> bool {
        let inner = &self.inner;
        if data.len() + 1 > MAX_PACKET_SIZE {
            return false;
        }
        let packet = inner.pool.get_with_data(PacketProperty::DiscoveryRequest, data);
        let sent = match inner.socket.lock().as_ref() {
            Some(socket) => socket.send_broadcast(packet.raw(), port),
            None => false,
        };
        if sent {
            inner.statistics.on_packet_sent(packet.size());
        }
        inner.pool.recycle(packet);
        sent
    }

    /// Answers a discovery request.
    pub fn send_discovery_response(&self, data: &[u8], endpoint: SocketAddr) -> bool {
        self.inner
            .send_property_packet(PacketProperty::DiscoveryResponse, data, endpoint)
    }

    /// Starts a graceful disconnect towards `peer`.
    pub fn disconnect_peer(&self, peer: &Arc<NetPeer>) {
        self.inner.disconnect_peer_internal(peer, &[], false);
    }

    /// Graceful disconnect with a payload the remote sees as
    /// `additional_data`.
    pub fn disconnect_peer_with_data(&self, peer: &Arc<NetPeer>, data: &[u8]) {
        self.inner.disconnect_peer_internal(peer, data, false);
    }

    /// Drops the peer immediately without a disconnect datagram.
    pub fn disconnect_peer_force(&self, peer: &Arc<NetPeer>) {
        self.inner.disconnect_peer_internal(peer, &[], true);
    }

    /// Gracefully disconnects every peer.
    pub fn disconnect_all(&self, data: &[u8]) {
        for peer in self.inner.peers.snapshot() {
            self.inner.disconnect_peer_internal(&peer, data, false);
        }
    }

    /// Peers whose state matches `state_mask` (OR of
    /// [`ConnectionState`] bits; [`ConnectionState::ANY`] for all).
    pub fn get_peers(&self, state_mask: u8) -> Vec<Arc<NetPeer>> {
        let mut out = Vec::new();
        self.get_peers_nonalloc(&mut out, state_mask);
        out
    }

    /// Like [`get_peers`](Self::get_peers) but reuses `out`.
    pub fn get_peers_nonalloc(&self, out: &mut Vec<Arc<NetPeer>>, state_mask: u8) {
        out.clear();
        for peer in self.inner.peers.snapshot() {
            if peer.connection_state().mask() & state_mask != 0 {
                out.push(peer);
            }
        }
    }

    /// The oldest live peer, in insertion order.
    pub fn first_peer(&self) -> Option<Arc<NetPeer>> {
        self.inner.peers.first()
    }

    /// Snapshot of every peer record for iteration.
    pub fn peers(&self) -> Vec<Arc<NetPeer>> {
        self.inner.peers.snapshot()
    }

    pub fn peers_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Number of peers in `Connected` state; eventually consistent with the
    /// table while transitions are in flight on other threads.
    pub fn connected_peers_count(&self) -> usize {
        self.inner.connected_count.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn statistics(&self) -> &NetStatistics {
        &self.inner.statistics
    }

    /// NAT punch-through module; active when `nat_punch_enabled` is set.
    pub fn nat_punch(&self) -> &NatPunchModule {
        &self.inner.nat
    }
}

impl Drop for NetManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl NetInner {
    pub(crate) fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub(crate) fn nat(&self) -> &NatPunchModule {
        &self.nat
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.socket
            .lock()
            .as_ref()
            .map(|socket| socket.local_port())
            .unwrap_or(0)
    }

    /// Sends raw bytes, mapping send errors per the error taxonomy: oversize
    /// is dropped with a log line, unreachable/reset tear the owning peer
    /// down, anything else surfaces as an `Error` event.
    pub(crate) fn send_raw(&self, data: &[u8], endpoint: SocketAddr) -> bool {
        if data.len() > MAX_PACKET_SIZE {
            log::warn!("dropping oversized datagram ({} bytes) to {endpoint}", data.len());
            return false;
        }
        let socket = match self.socket.lock().as_ref() {
            Some(socket) => socket.clone(),
            None => return false,
        };
        match socket.send_to(data, endpoint) {
            Ok(sent) => {
                self.statistics.on_packet_sent(sent);
                true
            }
            Err(e) => {
                let code = e.raw_os_error().unwrap_or(-1);
                match e.kind() {
                    std::io::ErrorKind::HostUnreachable
                    | std::io::ErrorKind::NetworkUnreachable => {
                        if let Some(peer) = self.peers.get(endpoint) {
                            self.handle_connection_lost(
                                &peer,
                                DisconnectReason::SocketSendError,
                                code,
                            );
                        }
                    }
                    std::io::ErrorKind::ConnectionReset => {
                        if let Some(peer) = self.peers.get(endpoint) {
                            self.handle_connection_lost(
                                &peer,
                                DisconnectReason::RemoteConnectionClose,
                                code,
                            );
                        }
                    }
                    _ => {
                        log::debug!("send to {endpoint} failed: {e}");
                        self.create_error_event(Some(endpoint), code);
                    }
                }
                false
            }
        }
    }

    fn send_property_packet(
        &self,
        property: PacketProperty,
        data: &[u8],
        endpoint: SocketAddr,
    ) -> bool {
        if data.len() + property.header_size() > MAX_PACKET_SIZE {
            return false;
        }
        let packet = self.pool.get_with_data(property, data);
        let sent = self.send_raw(packet.raw(), endpoint);
        self.pool.recycle(packet);
        sent
    }

    /// Tears a peer down after a timeout, failed handshake, or socket error.
    /// Emits exactly one `Disconnect` event per live peer.
    pub(crate) fn handle_connection_lost(
        &self,
        peer: &Arc<NetPeer>,
        reason: DisconnectReason,
        error_code: i32,
    ) {
        let Some(previous) = peer.force_disconnect() else {
            return;
        };
        let decrement = previous == ConnectionState::Connected;
        self.create_disconnect_event(peer, reason, error_code, Vec::new(), decrement);
    }

    pub(crate) fn disconnect_peer_internal(&self, peer: &Arc<NetPeer>, data: &[u8], force: bool) {
        let previous = peer.connection_state();
        if !peer.shutdown(data, force) {
            return;
        }
        if previous == ConnectionState::Connected {
            self.create_disconnect_event(
                peer,
                DisconnectReason::DisconnectPeerCalled,
                0,
                Vec::new(),
                true,
            );
        }
        if force {
            self.peers.remove(peer);
        }
    }

    /// Resolution callback invoked by [`ConnectionRequest`].
    pub(crate) fn on_connection_solved(
        &self,
        request: &ConnectionRequest,
        reject_data: Option<Vec<u8>>,
    ) {
        match reject_data {
            Some(data) => {
                request.peer.reject(
                    request.connection_id,
                    request.connection_number,
                    &data,
                );
                self.peers.remove(&request.peer);
            }
            None => {
                if request
                    .peer
                    .accept(request.connection_id, request.connection_number)
                {
                    self.create_connect_event(&request.peer);
                    request.peer.send_connect_accept();
                }
            }
        }
    }

    // --- event creation -------------------------------------------------
    //
    // The thread that performs a peer state transition also creates the
    // matching event, which is what keeps per-peer event order sane:
    // `Connect` is always enqueued before that peer's first `Receive`.

    fn emit(&self, event: Box<NetEvent>) {
        if self.config.unsynced_events {
            let mut event = event;
            self.dispatch_event(&mut event);
            if let Some(packet) = self.events.release(event) {
                self.pool.recycle(packet);
            }
        } else {
            self.events.enqueue(event);
        }
    }

    pub(crate) fn create_connect_event(&self, peer: &Arc<NetPeer>) {
        self.connected_count.fetch_add(1, Ordering::SeqCst);
        let mut event = self.events.acquire();
        event.kind = EventKind::Connect;
        event.peer = Some(peer.clone());
        self.emit(event);
    }

    pub(crate) fn create_disconnect_event(
        &self,
        peer: &Arc<NetPeer>,
        reason: DisconnectReason,
        error_code: i32,
        additional_data: Vec<u8>,
        decrement_connected: bool,
    ) {
        if decrement_connected {
            self.connected_count.fetch_sub(1, Ordering::SeqCst);
        }
        let mut event = self.events.acquire();
        event.kind = EventKind::Disconnect;
        event.peer = Some(peer.clone());
        event.reason = Some(reason);
        event.error_code = error_code;
        event.additional_data = additional_data;
        self.emit(event);
    }

    pub(crate) fn create_receive_event(
        &self,
        peer: &Arc<NetPeer>,
        method: DeliveryMethod,
        packet: NetPacket,
    ) {
        let mut event = self.events.acquire();
        event.kind = EventKind::Receive;
        event.peer = Some(peer.clone());
        event.delivery_method = method;
        event.packet = Some(packet);
        self.emit(event);
    }

    pub(crate) fn create_unconnected_event(
        &self,
        kind: EventKind,
        remote: SocketAddr,
        packet: NetPacket,
    ) {
        let mut event = self.events.acquire();
        event.kind = kind;
        event.remote = Some(remote);
        event.message_type = match kind {
            EventKind::DiscoveryRequest => UnconnectedMessageType::DiscoveryRequest,
            EventKind::DiscoveryResponse => UnconnectedMessageType::DiscoveryResponse,
            _ => UnconnectedMessageType::BasicMessage,
        };
        event.packet = Some(packet);
        self.emit(event);
    }

    pub(crate) fn create_latency_event(&self, peer: &Arc<NetPeer>, latency_ms: u32) {
        let mut event = self.events.acquire();
        event.kind = EventKind::LatencyUpdate;
        event.peer = Some(peer.clone());
        event.latency_ms = latency_ms;
        self.emit(event);
    }

    pub(crate) fn create_error_event(&self, remote: Option<SocketAddr>, error_code: i32) {
        let mut event = self.events.acquire();
        event.kind = EventKind::Error;
        event.remote = remote;
        event.error_code = error_code;
        self.emit(event);
    }

    pub(crate) fn create_connection_request_event(
        &self,
        peer: &Arc<NetPeer>,
        request: &ConnectRequestPacket,
        connection_number: u8,
        request_type: ConnectionRequestType,
    ) {
        let connection_request = Arc::new(ConnectionRequest {
            manager: self.self_ref.clone(),
            peer: peer.clone(),
            connection_id: request.connection_id,
            connection_number,
            request_type,
            data: request.data.clone(),
            processed: std::sync::atomic::AtomicBool::new(false),
        });
        let mut event = self.events.acquire();
        event.kind = EventKind::ConnectionRequest;
        event.request = Some(connection_request);
        self.emit(event);
    }

    /// Runs a drained (or inline) event against the listener.
    fn dispatch_event(&self, event: &mut NetEvent) {
        match event.kind {
            EventKind::Connect => {
                if let Some(peer) = &event.peer {
                    self.listener.on_peer_connected(peer);
                }
            }
            EventKind::Disconnect => {
                if let Some(peer) = &event.peer {
                    let info = DisconnectInfo {
                        reason: event.reason.unwrap_or(DisconnectReason::Timeout),
                        additional_data: std::mem::take(&mut event.additional_data),
                        socket_error_code: event.error_code,
                    };
                    self.listener.on_peer_disconnected(peer, info);
                }
            }
            EventKind::Receive => {
                let (Some(peer), Some(packet)) = (event.peer.clone(), event.packet.take()) else {
                    return;
                };
                let (buf, size, property) = packet.into_parts();
                let mut reader =
                    crate::data::NetDataReader::from_buffer(buf, property.header_size(), size);
                self.listener
                    .on_network_receive(&peer, &mut reader, event.delivery_method);
                self.pool.recycle_buffer(reader.into_buffer());
            }
            EventKind::ReceiveUnconnected
            | EventKind::DiscoveryRequest
            | EventKind::DiscoveryResponse => {
                let (Some(remote), Some(packet)) = (event.remote, event.packet.take()) else {
                    return;
                };
                let (buf, size, property) = packet.into_parts();
                let mut reader =
                    crate::data::NetDataReader::from_buffer(buf, property.header_size(), size);
                self.listener
                    .on_network_receive_unconnected(remote, &mut reader, event.message_type);
                self.pool.recycle_buffer(reader.into_buffer());
            }
            EventKind::Error => {
                self.listener.on_network_error(event.remote, event.error_code);
            }
            EventKind::LatencyUpdate => {
                if let Some(peer) = &event.peer {
                    self.listener.on_network_latency_update(peer, event.latency_ms);
                }
            }
            EventKind::ConnectionRequest => {
                if let Some(request) = event.request.clone() {
                    self.listener.on_connection_request(request);
                }
            }
            EventKind::None => {}
        }
    }
}
