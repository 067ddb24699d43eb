//! Endpoint-keyed collection of peer records.
//!
//! Peers live in a map for O(1) endpoint lookup and in an insertion-ordered
//! list for tick/broadcast iteration. Iteration works on a cloned snapshot of
//! `Arc` handles, so the logic thread can walk peers while the socket thread
//! adds or removes records; the snapshot may be momentarily stale, which
//! callers must tolerate.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::peer::NetPeer;

#[derive(Default)]
struct TableInner {
    map: HashMap<SocketAddr, Arc<NetPeer>>,
    list: Vec<Arc<NetPeer>>,
}

/// Concurrent peer table. A removed record is never re-inserted; reconnects
/// always allocate a fresh peer.
#[derive(Default)]
pub(crate) struct PeerTable {
    inner: RwLock<TableInner>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, endpoint: SocketAddr) -> Option<Arc<NetPeer>> {
        self.inner.read().map.get(&endpoint).cloned()
    }

    /// Inserts `peer` unless its endpoint is already present, and returns the
    /// record actually resident in the table.
    pub fn try_add(&self, peer: Arc<NetPeer>) -> Arc<NetPeer> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.map.get(&peer.endpoint()) {
            return existing.clone();
        }
        inner.map.insert(peer.endpoint(), peer.clone());
        inner.list.push(peer.clone());
        peer
    }

    /// Removes `peer` if it is still the resident record for its endpoint.
    /// A different record at the same endpoint is left alone.
    pub fn remove(&self, peer: &Arc<NetPeer>) -> bool {
        let mut inner = self.inner.write();
        let resident = match inner.map.get(&peer.endpoint()) {
            Some(resident) => Arc::ptr_eq(resident, peer),
            None => false,
        };
        if !resident {
            return false;
        }
        inner.map.remove(&peer.endpoint());
        inner.list.retain(|p| !Arc::ptr_eq(p, peer));
        true
    }

    /// Batch removal under a single write lock; used by the tick's reaper.
    pub fn remove_many(&self, peers: &[Arc<NetPeer>]) {
        if peers.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for peer in peers {
            let resident = match inner.map.get(&peer.endpoint()) {
                Some(resident) => Arc::ptr_eq(resident, peer),
                None => false,
            };
            if resident {
                inner.map.remove(&peer.endpoint());
            }
        }
        inner
            .list
            .retain(|p| !peers.iter().any(|dead| Arc::ptr_eq(p, dead)));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.list.clear();
    }

    /// Insertion-ordered snapshot for iteration.
    pub fn snapshot(&self) -> Vec<Arc<NetPeer>> {
        self.inner.read().list.clone()
    }

    pub fn first(&self) -> Option<Arc<NetPeer>> {
        self.inner.read().list.first().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::peer::ConnectionState;
    use std::sync::Weak;

    fn make_peer(port: u16) -> Arc<NetPeer> {
        NetPeer::new_incoming(
            Weak::new(),
            NetConfig::default(),
            format!("127.0.0.1:{port}").parse().unwrap(),
            1,
            0,
        )
    }

    #[test]
    fn second_add_on_same_endpoint_returns_first() {
        let table = PeerTable::new();
        let first = table.try_add(make_peer(9000));
        let second = table.try_add(make_peer(9000));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn snapshot_keeps_insertion_order_minus_removals() {
        let table = PeerTable::new();
        let a = table.try_add(make_peer(1));
        let b = table.try_add(make_peer(2));
        let c = table.try_add(make_peer(3));

        table.remove(&b);
        let order: Vec<_> = table.snapshot().iter().map(|p| p.endpoint()).collect();
        assert_eq!(order, vec![a.endpoint(), c.endpoint()]);
        assert!(table.first().map(|p| Arc::ptr_eq(&p, &a)).unwrap_or(false));
    }

    #[test]
    fn remove_ignores_stale_record() {
        let table = PeerTable::new();
        let stale = make_peer(5);
        let resident = table.try_add(make_peer(5));
        assert!(!table.remove(&stale));
        assert!(table.get(resident.endpoint()).is_some());
        assert!(table.remove(&resident));
        assert!(table.get(resident.endpoint()).is_none());
    }

    #[test]
    fn batch_removal() {
        let table = PeerTable::new();
        let peers: Vec<_> = (10..15).map(|p| table.try_add(make_peer(p))).collect();
        table.remove_many(&peers[1..3]);
        assert_eq!(table.len(), 3);
        assert!(table.get(peers[1].endpoint()).is_none());
        assert!(table.get(peers[4].endpoint()).is_some());
        assert_eq!(
            peers[0].connection_state(),
            ConnectionState::Incoming
        );
    }
}
