//! Reusable buffer arena for packet allocation on the receive and send paths.
use parking_lot::Mutex;

use crate::packet::{NetPacket, PacketProperty, MAX_PACKET_SIZE};

/// Size classes a recycled buffer can be shelved under. A request is served
/// from the smallest class that fits it.
const SIZE_CLASSES: [usize; 5] = [64, 512, 2048, 8192, MAX_PACKET_SIZE];

/// Cap per shelf so a burst cannot pin unbounded memory.
const MAX_POOLED_PER_CLASS: usize = 64;

/// Recycles packet buffers bucketed by size class.
///
/// Thread-safe under concurrent use by the socket-receive and logic threads.
/// Buffers come back with stale contents; pass `clear` when zeroed memory is
/// required.
pub struct PacketPool {
    shelves: [Mutex<Vec<Vec<u8>>>; SIZE_CLASSES.len()],
}

impl PacketPool {
    pub fn new() -> Self {
        Self {
            shelves: Default::default(),
        }
    }

    fn class_index(size: usize) -> usize {
        SIZE_CLASSES
            .iter()
            .position(|&class| size <= class)
            .unwrap_or(SIZE_CLASSES.len() - 1)
    }

    /// Hands out a buffer with `len() >= size`, pooled when available.
    pub(crate) fn get_buffer(&self, size: usize, clear: bool) -> Vec<u8> {
        let index = Self::class_index(size);
        let class = SIZE_CLASSES[index];
        let mut buf = match self.shelves[index].lock().pop() {
            Some(buf) => buf,
            None => vec![0u8; class],
        };
        if clear {
            buf[..size].fill(0);
        }
        buf
    }

    /// Allocates a packet of `size` bytes with an unset property byte.
    pub fn get_packet(&self, size: usize, clear: bool) -> NetPacket {
        let buf = self.get_buffer(size.max(1), clear);
        NetPacket::from_parts(buf, size.max(1), PacketProperty::Unreliable)
    }

    /// Builds a send-ready packet: the property header is written and `data`
    /// is placed right after it.
    pub fn get_with_data(&self, property: PacketProperty, data: &[u8]) -> NetPacket {
        let header = property.header_size();
        let size = header + data.len();
        let mut buf = self.get_buffer(size, false);
        buf[..header].fill(0);
        buf[0] = property as u8;
        buf[header..size].copy_from_slice(data);
        NetPacket::from_parts(buf, size, property)
    }

    /// Parses received wire bytes into a pooled packet.
    pub(crate) fn get_from_bytes(&self, data: &[u8]) -> Result<NetPacket, Vec<u8>> {
        let mut buf = self.get_buffer(data.len().max(1), false);
        buf[..data.len()].copy_from_slice(data);
        NetPacket::parse(buf, data.len())
    }

    /// Returns a packet's buffer to its shelf.
    pub fn recycle(&self, packet: NetPacket) {
        self.recycle_buffer(packet.into_buffer());
    }

    pub(crate) fn recycle_buffer(&self, buf: Vec<u8>) {
        let len = buf.len();
        // Only buffers we sized ourselves go back on a shelf; detached or
        // foreign vectors are simply dropped.
        if let Some(index) = SIZE_CLASSES.iter().position(|&class| class == len) {
            let mut shelf = self.shelves[index].lock();
            if shelf.len() < MAX_POOLED_PER_CLASS {
                shelf.push(buf);
            }
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.shelves.iter().map(|s| s.lock().len()).sum()
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_with_data_round_trip() {
        let pool = PacketPool::new();
        let packet = pool.get_with_data(PacketProperty::UnconnectedMessage, b"payload");
        assert_eq!(packet.property(), PacketProperty::UnconnectedMessage);
        assert_eq!(packet.payload(), b"payload");
        assert_eq!(packet.raw()[0], PacketProperty::UnconnectedMessage as u8);
    }

    #[test]
    fn recycled_buffer_is_reused() {
        let pool = PacketPool::new();
        let packet = pool.get_packet(100, false);
        pool.recycle(packet);
        assert_eq!(pool.pooled_count(), 1);
        let _again = pool.get_packet(100, false);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn clear_zeroes_requested_prefix() {
        let pool = PacketPool::new();
        let packet = pool.get_with_data(PacketProperty::UnconnectedMessage, &[0xFF; 32]);
        pool.recycle(packet);
        let packet = pool.get_packet(16, true);
        assert!(packet.raw().iter().all(|&b| b == 0));
    }

    #[test]
    fn size_class_selection() {
        assert_eq!(PacketPool::class_index(1), 0);
        assert_eq!(PacketPool::class_index(64), 0);
        assert_eq!(PacketPool::class_index(65), 1);
        assert_eq!(PacketPool::class_index(9000), 4);
    }
}
