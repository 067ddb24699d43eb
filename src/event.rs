//! Event objects, the pooled event queue, and the listener interface.
//!
//! Events are produced by the socket-receive and logic threads and consumed
//! by [`poll_events`](crate::NetManager::poll_events) on a user thread. Event
//! objects are pooled through a free list; reference fields are cleared on
//! release so nothing is kept alive by the pool.
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::DeliveryMethod;
use crate::data::NetDataReader;
use crate::manager::NetInner;
use crate::packet::NetPacket;
use crate::peer::NetPeer;

/// Why a peer went away, as reported to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The outgoing handshake ran out of attempts.
    ConnectionFailed,
    /// Nothing was heard from the remote within the disconnect timeout.
    Timeout,
    /// The remote closed the session (or was replaced by a reconnect).
    RemoteConnectionClose,
    /// A local call to one of the disconnect methods.
    DisconnectPeerCalled,
    /// The remote refused the handshake.
    ConnectionRejected,
    /// The receive socket failed underneath the manager.
    SocketReceiveError,
    /// Sending to the peer's endpoint failed.
    SocketSendError,
}

/// Classifies datagrams surfaced through
/// [`NetListener::on_network_receive_unconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnconnectedMessageType {
    #[default]
    BasicMessage,
    DiscoveryRequest,
    DiscoveryResponse,
}

/// Details attached to a peer disconnection.
#[derive(Debug)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    /// Payload the remote attached to its disconnect (or reject) datagram.
    pub additional_data: Vec<u8>,
    /// Raw OS error code when the reason is socket-related, otherwise 0.
    pub socket_error_code: i32,
}

/// Callbacks through which the manager reports network activity.
///
/// With `unsynced_events` off, every callback runs on the thread calling
/// [`poll_events`](crate::NetManager::poll_events); with it on, callbacks run
/// inline on the internal producer threads and the listener must synchronize
/// itself.
pub trait NetListener: Send + Sync {
    fn on_peer_connected(&self, _peer: &Arc<NetPeer>) {}

    fn on_peer_disconnected(&self, _peer: &Arc<NetPeer>, _info: DisconnectInfo) {}

    fn on_network_receive(
        &self,
        _peer: &Arc<NetPeer>,
        _reader: &mut NetDataReader,
        _method: DeliveryMethod,
    ) {
    }

    fn on_network_receive_unconnected(
        &self,
        _endpoint: SocketAddr,
        _reader: &mut NetDataReader,
        _message_type: UnconnectedMessageType,
    ) {
    }

    fn on_network_error(&self, _endpoint: Option<SocketAddr>, _error_code: i32) {}

    fn on_network_latency_update(&self, _peer: &Arc<NetPeer>, _latency_ms: u32) {}

    fn on_connection_request(&self, _request: Arc<ConnectionRequest>) {}
}

/// What kind of handshake a [`ConnectionRequest`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRequestType {
    Incoming,
    PeerToPeer,
}

/// A pending handshake decision handed to the listener, which must resolve
/// it by calling [`accept`](ConnectionRequest::accept) or
/// [`reject`](ConnectionRequest::reject) — immediately or later.
pub struct ConnectionRequest {
    pub(crate) manager: Weak<NetInner>,
    pub(crate) peer: Arc<NetPeer>,
    pub(crate) connection_id: u64,
    pub(crate) connection_number: u8,
    pub(crate) request_type: ConnectionRequestType,
    pub(crate) data: Vec<u8>,
    pub(crate) processed: AtomicBool,
}

impl ConnectionRequest {
    /// The endpoint asking to connect.
    pub fn remote_endpoint(&self) -> SocketAddr {
        self.peer.endpoint()
    }

    pub fn request_type(&self) -> ConnectionRequestType {
        self.request_type
    }

    /// The opaque payload the remote attached to its connect request.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Grants the handshake; returns the now-live peer. `None` when the
    /// request was already resolved or the manager is gone.
    pub fn accept(&self) -> Option<Arc<NetPeer>> {
        if self.processed.swap(true, Ordering::SeqCst) {
            return None;
        }
        let inner = self.manager.upgrade()?;
        inner.on_connection_solved(self, None);
        Some(self.peer.clone())
    }

    /// Refuses the handshake, attaching `data` to the disconnect datagram.
    pub fn reject(&self, data: &[u8]) {
        if self.processed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.manager.upgrade() {
            inner.on_connection_solved(self, Some(data.to_vec()));
        }
    }
}

impl std::fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("endpoint", &self.peer.endpoint())
            .field("type", &self.request_type)
            .finish()
    }
}

/// Internal event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum EventKind {
    #[default]
    None,
    Connect,
    Disconnect,
    Receive,
    ReceiveUnconnected,
    Error,
    LatencyUpdate,
    DiscoveryRequest,
    DiscoveryResponse,
    ConnectionRequest,
}

/// A pooled, reusable event record.
#[derive(Default)]
pub(crate) struct NetEvent {
    pub kind: EventKind,
    pub peer: Option<Arc<NetPeer>>,
    pub remote: Option<SocketAddr>,
    pub latency_ms: u32,
    pub error_code: i32,
    pub reason: Option<DisconnectReason>,
    pub additional_data: Vec<u8>,
    pub request: Option<Arc<ConnectionRequest>>,
    pub delivery_method: DeliveryMethod,
    pub packet: Option<NetPacket>,
    pub message_type: UnconnectedMessageType,
}

/// FIFO of pooled events with a free list.
pub(crate) struct EventQueue {
    queue: Mutex<VecDeque<Box<NetEvent>>>,
    free: Mutex<Vec<Box<NetEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pops a cleared event from the free list, or allocates one.
    pub fn acquire(&self) -> Box<NetEvent> {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn enqueue(&self, event: Box<NetEvent>) {
        self.queue.lock().push_back(event);
    }

    /// Moves every queued event into `out`, preserving order.
    pub fn drain_into(&self, out: &mut Vec<Box<NetEvent>>) {
        let mut queue = self.queue.lock();
        out.extend(queue.drain(..));
    }

    /// Clears reference fields and shelves the event for reuse. Returns the
    /// packet (if any) so the caller can recycle it.
    pub fn release(&self, mut event: Box<NetEvent>) -> Option<NetPacket> {
        let packet = event.packet.take();
        event.kind = EventKind::None;
        event.peer = None;
        event.remote = None;
        event.latency_ms = 0;
        event.error_code = 0;
        event.reason = None;
        event.additional_data.clear();
        event.request = None;
        event.delivery_method = DeliveryMethod::Unreliable;
        event.message_type = UnconnectedMessageType::BasicMessage;
        self.free.lock().push(event);
        packet
    }

    /// Drops queued events (and their packets) wholesale; used by `stop`.
    pub fn clear(&self) -> Vec<NetPacket> {
        let mut packets = Vec::new();
        let mut queue = self.queue.lock();
        for event in queue.drain(..) {
            if let Some(packet) = self.release(event) {
                packets.push(packet);
            }
        }
        packets
    }
}
