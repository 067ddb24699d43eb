//! Byte-buffer serialization helpers used by listeners and the unconnected
//! message surfaces.
//!
//! [`NetDataWriter`] builds outbound payloads; [`NetDataReader`] walks a
//! received payload. Integers are little-endian on the wire.
use std::net::{IpAddr, SocketAddr};

use byteorder::{ByteOrder, LittleEndian};

/// Growable little-endian byte writer.
#[derive(Debug, Default)]
pub struct NetDataWriter {
    data: Vec<u8>,
}

impl NetDataWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.data.extend_from_slice(&buf);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.data.extend_from_slice(&buf);
    }

    pub fn put_u64(&mut self, value: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.data.extend_from_slice(&buf);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.put_u32(value.to_bits());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Length-prefixed UTF-8 string.
    pub fn put_string(&mut self, value: &str) {
        self.put_u16(value.len() as u16);
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Length-tagged IP address plus port.
    pub fn put_endpoint(&mut self, endpoint: SocketAddr) {
        match endpoint.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(4);
                self.put_bytes(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.put_u8(16);
                self.put_bytes(&ip.octets());
            }
        }
        self.put_u16(endpoint.port());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor over a received payload.
///
/// Holds the packet's pooled buffer for the duration of a listener callback;
/// the buffer returns to the pool when the callback ends. Use
/// [`detach`](NetDataReader::detach) to keep the remaining bytes longer.
#[derive(Debug)]
pub struct NetDataReader {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    pos: usize,
}

impl NetDataReader {
    pub(crate) fn from_buffer(buf: Vec<u8>, start: usize, end: usize) -> Self {
        Self {
            buf,
            start,
            end,
            pos: start,
        }
    }

    /// Reader over an owned byte vector (used in tests and by NAT module).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let end = bytes.len();
        Self::from_buffer(bytes, 0, end)
    }

    pub fn available(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// The whole unread payload.
    pub fn remaining(&self) -> &[u8] {
        &self.buf[self.pos..self.end]
    }

    fn take(&mut self, count: usize) -> Option<&[u8]> {
        if self.available() < count {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Some(slice)
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    pub fn get_u16(&mut self) -> Option<u16> {
        self.take(2).map(LittleEndian::read_u16)
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.take(4).map(LittleEndian::read_u32)
    }

    pub fn get_u64(&mut self) -> Option<u64> {
        self.take(8).map(LittleEndian::read_u64)
    }

    pub fn get_f32(&mut self) -> Option<f32> {
        self.get_u32().map(f32::from_bits)
    }

    pub fn get_bytes(&mut self, count: usize) -> Option<&[u8]> {
        self.take(count)
    }

    pub fn get_string(&mut self) -> Option<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    pub fn get_endpoint(&mut self) -> Option<SocketAddr> {
        let ip = match self.get_u8()? {
            4 => {
                let octets: [u8; 4] = self.take(4)?.try_into().ok()?;
                IpAddr::from(octets)
            }
            16 => {
                let octets: [u8; 16] = self.take(16)?.try_into().ok()?;
                IpAddr::from(octets)
            }
            _ => return None,
        };
        let port = self.get_u16()?;
        Some(SocketAddr::new(ip, port))
    }

    /// Copies the unread bytes out, consuming them from the reader. The
    /// pooled buffer itself stays with the manager.
    pub fn detach(&mut self) -> Vec<u8> {
        let bytes = self.buf[self.pos..self.end].to_vec();
        self.pos = self.end;
        bytes
    }

    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    /// Restart reading from the payload start.
    pub fn rewind(&mut self) {
        self.pos = self.start;
    }
}
