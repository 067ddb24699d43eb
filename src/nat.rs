//! NAT punch-through: introduction requests relayed via a master server and
//! the punch datagrams that open the hole.
//!
//! The demultiplexer hands the three NAT properties here when
//! `nat_punch_enabled` is set. The module reports progress through its own
//! [`NatPunchListener`] rather than the manager event stream.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::data::{NetDataReader, NetDataWriter};
use crate::manager::NetInner;
use crate::packet::{NetPacket, PacketProperty};

/// Progress callbacks for NAT punch-through.
pub trait NatPunchListener: Send + Sync {
    /// A client asked this (master) instance to introduce it to someone.
    fn on_nat_introduction_request(
        &self,
        local_endpoint: SocketAddr,
        remote_endpoint: SocketAddr,
        token: &str,
    );

    /// A punch datagram arrived; the hole to `target` is open.
    fn on_nat_introduction_success(&self, target: SocketAddr, token: &str);
}

/// State machine for the NAT introduction/punch exchange.
pub struct NatPunchModule {
    manager: Weak<NetInner>,
    listener: RwLock<Option<Arc<dyn NatPunchListener>>>,
}

impl NatPunchModule {
    pub(crate) fn new(manager: Weak<NetInner>) -> Self {
        Self {
            manager,
            listener: RwLock::new(None),
        }
    }

    /// Registers the listener; punch traffic is ignored until one is set.
    pub fn init(&self, listener: Arc<dyn NatPunchListener>) {
        *self.listener.write() = Some(listener);
    }

    fn send(&self, bytes: &[u8], target: SocketAddr) {
        if let Some(inner) = self.manager.upgrade() {
            inner.send_raw(bytes, target);
        }
    }

    fn local_endpoint(&self) -> SocketAddr {
        let port = self
            .manager
            .upgrade()
            .map(|inner| inner.local_port())
            .unwrap_or(0);
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// Client side: asks the master server for an introduction.
    pub fn send_introduce_request(&self, master: SocketAddr, token: &str) {
        let mut writer = NetDataWriter::new();
        writer.put_u8(PacketProperty::NatIntroductionRequest as u8);
        writer.put_endpoint(self.local_endpoint());
        writer.put_string(token);
        self.send(writer.as_slice(), master);
    }

    /// Master side: sends each party the other's internal and external
    /// endpoints so both can start punching.
    pub fn introduce(
        &self,
        host_internal: SocketAddr,
        host_external: SocketAddr,
        client_internal: SocketAddr,
        client_external: SocketAddr,
        token: &str,
    ) {
        let mut to_client = NetDataWriter::new();
        to_client.put_u8(PacketProperty::NatIntroduction as u8);
        to_client.put_endpoint(host_internal);
        to_client.put_endpoint(host_external);
        to_client.put_string(token);
        self.send(to_client.as_slice(), client_external);

        let mut to_host = NetDataWriter::new();
        to_host.put_u8(PacketProperty::NatIntroduction as u8);
        to_host.put_endpoint(client_internal);
        to_host.put_endpoint(client_external);
        to_host.put_string(token);
        self.send(to_host.as_slice(), host_external);
    }

    /// Routes one of the NAT properties from the demultiplexer.
    pub(crate) fn process(&self, packet: &NetPacket, remote: SocketAddr) {
        let listener = self.listener.read().clone();
        let mut reader = NetDataReader::from_bytes(packet.payload().to_vec());
        match packet.property() {
            PacketProperty::NatIntroductionRequest => {
                let (Some(internal), Some(token)) =
                    (reader.get_endpoint(), reader.get_string())
                else {
                    return;
                };
                if let Some(listener) = listener {
                    listener.on_nat_introduction_request(internal, remote, &token);
                }
            }
            PacketProperty::NatIntroduction => {
                let (Some(internal), Some(external), Some(token)) = (
                    reader.get_endpoint(),
                    reader.get_endpoint(),
                    reader.get_string(),
                ) else {
                    return;
                };
                // Punch both candidate paths; whichever gets through wins.
                let mut punch = NetDataWriter::new();
                punch.put_u8(PacketProperty::NatPunchMessage as u8);
                punch.put_string(&token);
                self.send(punch.as_slice(), internal);
                self.send(punch.as_slice(), external);
            }
            PacketProperty::NatPunchMessage => {
                let Some(token) = reader.get_string() else {
                    return;
                };
                if let Some(listener) = listener {
                    listener.on_nat_introduction_success(remote, &token);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn introduction_request_wire_format() {
        let mut writer = NetDataWriter::new();
        let internal: SocketAddr = "192.168.0.10:7777".parse().unwrap();
        writer.put_endpoint(internal);
        writer.put_string("lobby-42");

        let mut reader = NetDataReader::from_bytes(writer.into_bytes());
        assert_eq!(reader.get_endpoint(), Some(internal));
        assert_eq!(reader.get_string().as_deref(), Some("lobby-42"));
    }
}
