//! Datagram demultiplexer: parses each incoming datagram's property byte and
//! routes it to a peer state machine, the connection negotiator, or one of
//! the unconnected-path handlers.
//!
//! A `Disconnect` datagram is answered with a single-byte `ShutdownOk` even
//! when the sender is unknown, so a remote that already tore down local
//! state does not sit out its timeout. That reply reveals that this port is
//! listening; it is a deliberate trade-off inherited from the protocol.
use std::net::SocketAddr;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::MAX_CONNECTION_NUMBER;
use crate::event::{ConnectionRequestType, DisconnectReason, EventKind};
use crate::packet::{ConnectRequestPacket, NetPacket, PacketProperty};
use crate::peer::{ConnectRequestResult, NetPeer, ShutdownResult};
use crate::simulator::SimulationVerdict;
use crate::socket::MessageSink;

use super::NetInner;

impl MessageSink for NetInner {
    fn on_message_received(&self, data: &[u8], error_code: i32, remote: SocketAddr) {
        if !self.running.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        if error_code != 0 {
            // A receive-level failure is fatal for every session: the table
            // is dropped wholesale and a single error event is emitted.
            self.peers.clear();
            self.create_error_event(None, error_code);
            return;
        }
        if self.config.simulate_packet_loss || self.config.simulate_latency {
            match self.simulator.intercept(&self.config, data, remote) {
                SimulationVerdict::Deliver => {}
                SimulationVerdict::Dropped | SimulationVerdict::Delayed => return,
            }
        }
        self.handle_datagram(data, remote);
    }
}

impl NetInner {
    /// Entry point for wire bytes: pool, parse, count, dispatch. Also fed by
    /// the logic tick when delayed (simulated-latency) datagrams mature.
    pub(crate) fn handle_datagram(&self, data: &[u8], remote: SocketAddr) {
        let packet = match self.pool.get_from_bytes(data) {
            Ok(packet) => packet,
            Err(buf) => {
                log::debug!("malformed datagram ({} bytes) from {remote}", data.len());
                self.pool.recycle_buffer(buf);
                return;
            }
        };
        self.statistics.on_packet_received(packet.size());
        self.dispatch_packet(packet, remote);
    }

    /// Property routing. Consumes the packet along every path.
    fn dispatch_packet(&self, packet: NetPacket, remote: SocketAddr) {
        let peer = self.peers.get(remote);
        match packet.property() {
            PacketProperty::DiscoveryRequest => {
                if self.config.discovery_enabled {
                    self.create_unconnected_event(EventKind::DiscoveryRequest, remote, packet);
                } else {
                    self.pool.recycle(packet);
                }
            }
            PacketProperty::DiscoveryResponse => {
                self.create_unconnected_event(EventKind::DiscoveryResponse, remote, packet);
            }
            PacketProperty::UnconnectedMessage => {
                if self.config.unconnected_messages_enabled {
                    self.create_unconnected_event(EventKind::ReceiveUnconnected, remote, packet);
                } else {
                    self.pool.recycle(packet);
                }
            }
            PacketProperty::NatIntroductionRequest
            | PacketProperty::NatIntroduction
            | PacketProperty::NatPunchMessage => {
                if self.config.nat_punch_enabled {
                    self.nat().process(&packet, remote);
                }
                self.pool.recycle(packet);
            }
            PacketProperty::Merged => {
                self.split_merged(&packet, remote);
                self.pool.recycle(packet);
            }
            PacketProperty::Disconnect => self.process_disconnect_packet(packet, peer, remote),
            PacketProperty::ConnectAccept => {
                if let Some(peer) = peer {
                    if peer.process_connect_accept(&packet) {
                        self.create_connect_event(&peer);
                    }
                }
                self.pool.recycle(packet);
            }
            PacketProperty::ConnectRequest => {
                self.process_connect_request(packet, peer, remote);
            }
            _ => match peer {
                // Everything else belongs to the peer's protocol machine.
                Some(peer) => peer.process_packet(packet),
                None => self.pool.recycle(packet),
            },
        }
    }

    /// Unwraps a merged datagram and re-dispatches each sub-packet.
    fn split_merged(&self, packet: &NetPacket, remote: SocketAddr) {
        let payload = packet.payload();
        let mut pos = 0;
        while pos + 2 <= payload.len() {
            let len = LittleEndian::read_u16(&payload[pos..pos + 2]) as usize;
            pos += 2;
            if len == 0 || pos + len > payload.len() {
                log::debug!("truncated merged datagram from {remote}");
                return;
            }
            self.handle_datagram(&payload[pos..pos + len], remote);
            pos += len;
        }
    }

    fn process_disconnect_packet(
        &self,
        packet: NetPacket,
        peer: Option<Arc<NetPeer>>,
        remote: SocketAddr,
    ) {
        if let Some(peer) = peer {
            match peer.process_disconnect(&packet) {
                ShutdownResult::None => {
                    self.pool.recycle(packet);
                    return;
                }
                ShutdownResult::Disconnect => {
                    self.create_disconnect_event(
                        &peer,
                        DisconnectReason::RemoteConnectionClose,
                        0,
                        packet.payload().to_vec(),
                        true,
                    );
                }
                ShutdownResult::Reject => {
                    self.create_disconnect_event(
                        &peer,
                        DisconnectReason::ConnectionRejected,
                        0,
                        packet.payload().to_vec(),
                        false,
                    );
                }
            }
        }
        self.pool.recycle(packet);
        self.send_raw(&[PacketProperty::ShutdownOk as u8], remote);
    }

    /// Resolves connect-request identity: retry, reconnect, endpoint reuse,
    /// or simultaneous dial, then surfaces a [`ConnectionRequest`] for
    /// anything that needs the listener's decision.
    ///
    /// [`ConnectionRequest`]: crate::ConnectionRequest
    fn process_connect_request(
        &self,
        packet: NetPacket,
        existing: Option<Arc<NetPeer>>,
        remote: SocketAddr,
    ) {
        let mut request = match ConnectRequestPacket::parse(&packet) {
            Some(request) => request,
            None => {
                self.pool.recycle(packet);
                return;
            }
        };
        self.pool.recycle(packet);

        if request.protocol_id != self.config.protocol_id {
            log::debug!(
                "connect request from {remote} with foreign protocol id {:#x}",
                request.protocol_id
            );
            return;
        }

        let mut connection_number = request.connection_number % MAX_CONNECTION_NUMBER;
        if let Some(peer) = existing {
            match peer.process_connect_request(&request) {
                ConnectRequestResult::None => return,
                ConnectRequestResult::P2PConnection => {
                    // Both sides dialed at once; agree on the higher id so
                    // the session identity matches on both ends.
                    if peer.connect_id() > request.connection_id {
                        request.connection_id = peer.connect_id();
                        connection_number = peer.connection_num();
                    }
                    self.create_connection_request_event(
                        &peer,
                        &request,
                        connection_number,
                        ConnectionRequestType::PeerToPeer,
                    );
                    return;
                }
                ConnectRequestResult::Reconnection => {
                    // The old session is gone as far as the remote is
                    // concerned; synthesize its disconnect before admitting
                    // the new one.
                    if let Some(previous) = peer.force_disconnect() {
                        self.create_disconnect_event(
                            &peer,
                            DisconnectReason::RemoteConnectionClose,
                            0,
                            Vec::new(),
                            previous == crate::peer::ConnectionState::Connected,
                        );
                    }
                    self.peers.remove(&peer);
                    connection_number = (peer.connection_num() + 1) % MAX_CONNECTION_NUMBER;
                }
                ConnectRequestResult::NewConnection => {
                    self.peers.remove(&peer);
                    connection_number = (peer.connection_num() + 1) % MAX_CONNECTION_NUMBER;
                }
            }
        }

        let new_peer = NetPeer::new_incoming(
            self.self_ref.clone(),
            self.config.clone(),
            remote,
            request.connection_id,
            connection_number,
        );
        let resident = self.peers.try_add(new_peer.clone());
        // Only the thread whose record won the insert may surface the
        // request; a racing insert means someone else already did.
        if Arc::ptr_eq(&resident, &new_peer) {
            self.create_connection_request_event(
                &new_peer,
                &request,
                connection_number,
                ConnectionRequestType::Incoming,
            );
        }
    }
}
