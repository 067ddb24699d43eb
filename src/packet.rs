//! Packet property codes, pooled packet buffers, and handshake wire formats.
//!
//! Every datagram starts with a 1-byte [`PacketProperty`] discriminator.
//! Channeled data carries a 16-bit sequence after the property byte; the
//! handshake packets carry the connection identity fields described below.
use byteorder::{ByteOrder, LittleEndian};

/// Largest UDP payload the manager will send or accept.
pub const MAX_PACKET_SIZE: usize = 65507;

/// Property byte plus 16-bit sequence.
pub const SEQUENCED_HEADER_SIZE: usize = 3;

/// `[prop][protocol_id u32][connection_id u64][connection_number u8]`
pub const CONNECT_REQUEST_HEADER_SIZE: usize = 14;
/// `[prop][connection_id u64][connection_number u8]`
pub const CONNECT_ACCEPT_SIZE: usize = 10;
/// `[prop][connection_id u64]`
pub const DISCONNECT_HEADER_SIZE: usize = 9;
/// `[prop][method u8][ack u16][bits u64]`
pub const ACK_PACKET_SIZE: usize = 12;
/// `[prop][seq u16][time_us u64]`
pub const PONG_PACKET_SIZE: usize = 11;

/// The 1-byte discriminator at the start of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketProperty {
    Unreliable = 0,
    ReliableUnordered = 1,
    ReliableOrdered = 2,
    Sequenced = 3,
    ReliableSequenced = 4,
    AckReliable = 5,
    AckReliableSequenced = 6,
    Ping = 7,
    Pong = 8,
    ConnectRequest = 9,
    ConnectAccept = 10,
    Disconnect = 11,
    ShutdownOk = 12,
    UnconnectedMessage = 13,
    DiscoveryRequest = 14,
    DiscoveryResponse = 15,
    NatIntroductionRequest = 16,
    NatIntroduction = 17,
    NatPunchMessage = 18,
    MtuCheck = 19,
    MtuOk = 20,
    Merged = 21,
}

impl PacketProperty {
    pub fn from_byte(value: u8) -> Option<PacketProperty> {
        Some(match value {
            0 => PacketProperty::Unreliable,
            1 => PacketProperty::ReliableUnordered,
            2 => PacketProperty::ReliableOrdered,
            3 => PacketProperty::Sequenced,
            4 => PacketProperty::ReliableSequenced,
            5 => PacketProperty::AckReliable,
            6 => PacketProperty::AckReliableSequenced,
            7 => PacketProperty::Ping,
            8 => PacketProperty::Pong,
            9 => PacketProperty::ConnectRequest,
            10 => PacketProperty::ConnectAccept,
            11 => PacketProperty::Disconnect,
            12 => PacketProperty::ShutdownOk,
            13 => PacketProperty::UnconnectedMessage,
            14 => PacketProperty::DiscoveryRequest,
            15 => PacketProperty::DiscoveryResponse,
            16 => PacketProperty::NatIntroductionRequest,
            17 => PacketProperty::NatIntroduction,
            18 => PacketProperty::NatPunchMessage,
            19 => PacketProperty::MtuCheck,
            20 => PacketProperty::MtuOk,
            21 => PacketProperty::Merged,
            _ => return None,
        })
    }

    /// Minimum wire size of a datagram carrying this property.
    pub fn header_size(self) -> usize {
        match self {
            PacketProperty::ReliableUnordered
            | PacketProperty::ReliableOrdered
            | PacketProperty::Sequenced
            | PacketProperty::ReliableSequenced
            | PacketProperty::Ping
            | PacketProperty::MtuCheck
            | PacketProperty::MtuOk
            | PacketProperty::AckReliableSequenced => SEQUENCED_HEADER_SIZE,
            PacketProperty::Pong => PONG_PACKET_SIZE,
            PacketProperty::AckReliable => ACK_PACKET_SIZE,
            PacketProperty::ConnectRequest => CONNECT_REQUEST_HEADER_SIZE,
            PacketProperty::ConnectAccept => CONNECT_ACCEPT_SIZE,
            PacketProperty::Disconnect => DISCONNECT_HEADER_SIZE,
            _ => 1,
        }
    }

    /// Data properties routed through a delivery channel.
    pub fn is_channeled(self) -> bool {
        matches!(
            self,
            PacketProperty::Unreliable
                | PacketProperty::ReliableUnordered
                | PacketProperty::ReliableOrdered
                | PacketProperty::Sequenced
                | PacketProperty::ReliableSequenced
        )
    }
}

/// `true` if sequence `a` is newer than `b` under 16-bit wraparound.
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    ((a > b) && (a - b <= 32768)) || ((a < b) && (b - a > 32768))
}

/// Signed distance from `b` to `a` under 16-bit wraparound.
pub fn sequence_diff(a: u16, b: u16) -> i32 {
    let diff = a.wrapping_sub(b);
    if diff <= 32768 {
        diff as i32
    } else {
        diff as i32 - 65536
    }
}

/// An owned, pooled datagram buffer with its parsed property byte.
///
/// Obtained from [`PacketPool`](crate::pool::PacketPool) and consumed exactly
/// once: either recycled back to the pool or transferred into an event.
#[derive(Debug)]
pub struct NetPacket {
    data: Vec<u8>,
    size: usize,
    property: PacketProperty,
}

impl NetPacket {
    /// Wraps a buffer whose first byte has already been validated.
    pub(crate) fn from_parts(data: Vec<u8>, size: usize, property: PacketProperty) -> Self {
        Self {
            data,
            size,
            property,
        }
    }

    /// Parses wire bytes into a packet; on failure returns the buffer so the
    /// caller can recycle it.
    pub(crate) fn parse(data: Vec<u8>, size: usize) -> Result<Self, Vec<u8>> {
        if size == 0 || size > data.len() {
            return Err(data);
        }
        let property = match PacketProperty::from_byte(data[0]) {
            Some(p) => p,
            None => return Err(data),
        };
        if size < property.header_size() {
            return Err(data);
        }
        Ok(Self {
            data,
            size,
            property,
        })
    }

    pub fn property(&self) -> PacketProperty {
        self.property
    }

    /// Sequence field of a channeled/ping/ack packet.
    pub(crate) fn sequence(&self) -> u16 {
        LittleEndian::read_u16(&self.data[1..3])
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whole datagram including the property header.
    pub fn raw(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Bytes after this property's header.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.property.header_size()..self.size]
    }

    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.data
    }

    /// Takes the buffer out, leaving the used length behind for the reader.
    pub(crate) fn into_parts(self) -> (Vec<u8>, usize, PacketProperty) {
        (self.data, self.size, self.property)
    }
}

/// Parsed `ConnectRequest` handshake payload.
#[derive(Debug, Clone)]
pub struct ConnectRequestPacket {
    pub protocol_id: u32,
    pub connection_id: u64,
    pub connection_number: u8,
    pub data: Vec<u8>,
}

impl ConnectRequestPacket {
    pub fn parse(packet: &NetPacket) -> Option<Self> {
        if packet.property() != PacketProperty::ConnectRequest {
            return None;
        }
        let raw = packet.raw();
        if raw.len() < CONNECT_REQUEST_HEADER_SIZE {
            return None;
        }
        Some(Self {
            protocol_id: LittleEndian::read_u32(&raw[1..5]),
            connection_id: LittleEndian::read_u64(&raw[5..13]),
            connection_number: raw[13],
            data: raw[CONNECT_REQUEST_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn serialize(
        protocol_id: u32,
        connection_id: u64,
        connection_number: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![0u8; CONNECT_REQUEST_HEADER_SIZE + payload.len()];
        out[0] = PacketProperty::ConnectRequest as u8;
        LittleEndian::write_u32(&mut out[1..5], protocol_id);
        LittleEndian::write_u64(&mut out[5..13], connection_id);
        out[13] = connection_number;
        out[CONNECT_REQUEST_HEADER_SIZE..].copy_from_slice(payload);
        out
    }
}

/// Parsed `ConnectAccept` handshake payload.
#[derive(Debug, Clone, Copy)]
pub struct ConnectAcceptPacket {
    pub connection_id: u64,
    pub connection_number: u8,
}

impl ConnectAcceptPacket {
    pub fn parse(packet: &NetPacket) -> Option<Self> {
        if packet.property() != PacketProperty::ConnectAccept
            || packet.size() != CONNECT_ACCEPT_SIZE
        {
            return None;
        }
        let raw = packet.raw();
        let connection_number = raw[9];
        if connection_number >= crate::config::MAX_CONNECTION_NUMBER {
            return None;
        }
        Some(Self {
            connection_id: LittleEndian::read_u64(&raw[1..9]),
            connection_number,
        })
    }

    pub fn serialize(connection_id: u64, connection_number: u8) -> Vec<u8> {
        let mut out = vec![0u8; CONNECT_ACCEPT_SIZE];
        out[0] = PacketProperty::ConnectAccept as u8;
        LittleEndian::write_u64(&mut out[1..9], connection_id);
        out[9] = connection_number;
        out
    }
}

/// Builds a `Disconnect` datagram carrying the session id and optional user data.
pub(crate) fn serialize_disconnect(connection_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; DISCONNECT_HEADER_SIZE + payload.len()];
    out[0] = PacketProperty::Disconnect as u8;
    LittleEndian::write_u64(&mut out[1..9], connection_id);
    out[DISCONNECT_HEADER_SIZE..].copy_from_slice(payload);
    out
}

/// Connection id carried by a `Disconnect` datagram.
pub(crate) fn disconnect_connection_id(packet: &NetPacket) -> u64 {
    LittleEndian::read_u64(&packet.raw()[1..9])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_round_trip() {
        for byte in 0..=21u8 {
            let property = PacketProperty::from_byte(byte).unwrap();
            assert_eq!(property as u8, byte);
        }
        assert!(PacketProperty::from_byte(22).is_none());
        assert!(PacketProperty::from_byte(255).is_none());
    }

    #[test]
    fn parse_rejects_short_headers() {
        // ConnectAccept needs 10 bytes, give it 3.
        let buf = vec![PacketProperty::ConnectAccept as u8, 0, 0];
        assert!(NetPacket::parse(buf, 3).is_err());
        assert!(NetPacket::parse(Vec::new(), 0).is_err());
    }

    #[test]
    fn parse_rejects_unknown_property() {
        let buf = vec![200u8, 1, 2, 3];
        assert!(NetPacket::parse(buf, 4).is_err());
    }

    #[test]
    fn payload_skips_header() {
        let mut buf = vec![0u8; 8];
        buf[0] = PacketProperty::Sequenced as u8;
        buf[3..8].copy_from_slice(b"hello");
        let packet = NetPacket::parse(buf, 8).unwrap();
        assert_eq!(packet.payload(), b"hello");
    }

    #[test]
    fn connect_request_round_trip() {
        let bytes = ConnectRequestPacket::serialize(0xABCD, 42, 3, b"key");
        let packet = NetPacket::parse(bytes, CONNECT_REQUEST_HEADER_SIZE + 3).unwrap();
        let parsed = ConnectRequestPacket::parse(&packet).unwrap();
        assert_eq!(parsed.protocol_id, 0xABCD);
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.connection_number, 3);
        assert_eq!(parsed.data, b"key");
    }

    #[test]
    fn connect_accept_rejects_bad_number() {
        let bytes = ConnectAcceptPacket::serialize(7, crate::config::MAX_CONNECTION_NUMBER);
        let packet = NetPacket::parse(bytes, CONNECT_ACCEPT_SIZE).unwrap();
        assert!(ConnectAcceptPacket::parse(&packet).is_none());
    }

    #[test]
    fn sequence_wraparound_ordering() {
        assert!(sequence_greater_than(1, 0));
        assert!(sequence_greater_than(0, 65535));
        assert!(!sequence_greater_than(65535, 0));
        assert_eq!(sequence_diff(1, 65535), 2);
        assert_eq!(sequence_diff(65535, 1), -2);
    }
}
