//! End-to-end connection lifecycle scenarios over loopback sockets.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, loopback, wait_until, Recorded, RecordingListener};
use netmux::prelude::*;
use netmux::MAX_CONNECTION_NUMBER;

fn start_pair() -> (NetManager, Arc<RecordingListener>, NetManager, Arc<RecordingListener>) {
    let server_listener = RecordingListener::accepting();
    let server = NetManager::new(fast_config(), server_listener.clone());
    assert!(server.start(0));

    let client_listener = RecordingListener::accepting();
    let client = NetManager::new(fast_config(), client_listener.clone());
    assert!(client.start(0));

    (server, server_listener, client, client_listener)
}

#[test]
fn connect_receive_disconnect() {
    let (server, server_listener, client, client_listener) = start_pair();
    let server_addr = loopback(server.local_port());

    let peer = client.connect(server_addr, b"key").unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
            && server_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));
    assert_eq!(server_listener.request_payloads.lock()[0], b"key");
    assert_eq!(server.connected_peers_count(), 1);
    assert_eq!(client.connected_peers_count(), 1);
    assert_eq!(peer.connection_state(), ConnectionState::Connected);
    assert_eq!(
        server.get_peers(ConnectionState::Connected.mask()).len(),
        1
    );

    client.send_to_all(&[0x01, 0x02, 0x03], DeliveryMethod::Unreliable);
    client.flush();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        server_listener.count_where(|e| {
            matches!(
                e,
                Recorded::Receive(_, data, DeliveryMethod::Unreliable) if data == &[0x01, 0x02, 0x03]
            )
        }) == 1
    }));

    client.disconnect_peer(&peer);
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        server_listener.count_where(|e| {
            matches!(e, Recorded::Disconnected(_, DisconnectReason::RemoteConnectionClose, _))
        }) == 1
            && client_listener.count_where(|e| {
                matches!(e, Recorded::Disconnected(_, DisconnectReason::DisconnectPeerCalled, _))
            }) == 1
    }));
    assert_eq!(server.connected_peers_count(), 0);
    assert_eq!(client.connected_peers_count(), 0);

    client.stop();
    server.stop();
}

#[test]
fn connect_is_ordered_before_receive() {
    let (server, server_listener, client, client_listener) = start_pair();
    let server_addr = loopback(server.local_port());

    let _peer = client.connect(server_addr, &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));
    client.send_to_all(b"early", DeliveryMethod::ReliableOrdered);
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        server_listener.count_where(|e| matches!(e, Recorded::Receive(..))) == 1
    }));

    let events = server_listener.snapshot();
    let connect_pos = events
        .iter()
        .position(|e| matches!(e, Recorded::Connected(_)))
        .unwrap();
    let receive_pos = events
        .iter()
        .position(|e| matches!(e, Recorded::Receive(..)))
        .unwrap();
    assert!(connect_pos < receive_pos);

    client.stop();
    server.stop();
}

#[test]
fn reliable_ordered_stays_ordered() {
    let (server, server_listener, client, client_listener) = start_pair();
    let server_addr = loopback(server.local_port());

    client.connect(server_addr, &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));

    for i in 0..10u8 {
        client.send_to_all(&[i], DeliveryMethod::ReliableOrdered);
    }
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        server_listener.count_where(|e| matches!(e, Recorded::Receive(..))) == 10
    }));

    let payloads: Vec<Vec<u8>> = server_listener
        .snapshot()
        .iter()
        .filter_map(|e| match e {
            Recorded::Receive(_, data, DeliveryMethod::ReliableOrdered) => Some(data.clone()),
            _ => None,
        })
        .collect();
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    assert_eq!(payloads, expected);

    client.stop();
    server.stop();
}

#[test]
fn reject_reaches_initiator_with_data() {
    let server_listener = RecordingListener::rejecting(&[0xFF]);
    let server = NetManager::new(fast_config(), server_listener.clone());
    assert!(server.start(0));

    let client_listener = RecordingListener::accepting();
    let client = NetManager::new(fast_config(), client_listener.clone());
    assert!(client.start(0));

    client.connect(loopback(server.local_port()), b"hello").unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| {
            matches!(
                e,
                Recorded::Disconnected(_, DisconnectReason::ConnectionRejected, data) if data == &[0xFF]
            )
        }) == 1
    }));
    assert_eq!(
        server_listener.count_where(|e| matches!(e, Recorded::Connected(_))),
        0
    );
    assert_eq!(server.connected_peers_count(), 0);

    client.stop();
    server.stop();
}

#[test]
fn reconnect_replaces_identity() {
    let (server, server_listener, client1, client1_listener) = start_pair();
    let server_addr = loopback(server.local_port());

    let peer1 = client1.connect(server_addr, &[]).unwrap();
    assert!(wait_until(&[&server, &client1], Duration::from_secs(3), || {
        client1_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));
    let old_number = server.first_peer().unwrap().connection_num();
    let client_port = client1.local_port();

    // Die without a goodbye, then come back from the same endpoint.
    client1.disconnect_peer_force(&peer1);
    client1.stop();

    let client2_listener = RecordingListener::accepting();
    let client2 = NetManager::new(fast_config().with_reuse_address(true), client2_listener.clone());
    assert!(client2.start(client_port));
    client2.connect(server_addr, &[]).unwrap();

    assert!(wait_until(&[&server, &client2], Duration::from_secs(3), || {
        client2_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));

    // The stale session was synthetically disconnected before the new one
    // was surfaced.
    assert_eq!(
        server_listener.count_where(|e| {
            matches!(e, Recorded::Disconnected(_, DisconnectReason::RemoteConnectionClose, _))
        }),
        1
    );
    let new_peer = server.first_peer().unwrap();
    assert_eq!(
        new_peer.connection_num(),
        (old_number + 1) % MAX_CONNECTION_NUMBER
    );
    assert_eq!(server.connected_peers_count(), 1);

    client2.stop();
    server.stop();
}

#[test]
fn idle_peer_times_out_and_is_reaped() {
    let (server, server_listener, client, client_listener) = start_pair();
    let server_addr = loopback(server.local_port());

    let peer = client.connect(server_addr, &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));

    // Force-drop on the client side: no disconnect datagram, no more pings.
    client.disconnect_peer_force(&peer);

    assert!(wait_until(&[&server, &client], Duration::from_secs(4), || {
        server_listener
            .count_where(|e| matches!(e, Recorded::Disconnected(_, DisconnectReason::Timeout, _)))
            == 1
    }));
    assert_eq!(server.connected_peers_count(), 0);

    // The lingering record is reaped after one more timeout.
    assert!(wait_until(&[&server], Duration::from_secs(4), || {
        server.peers_count() == 0
    }));

    client.stop();
    server.stop();
}

#[test]
fn latency_updates_flow() {
    let (server, _server_listener, client, client_listener) = start_pair();

    client.connect(loopback(server.local_port()), &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(5), || {
        client_listener.count_where(|e| matches!(e, Recorded::Latency(..))) >= 1
    }));

    client.stop();
    server.stop();
}

#[test]
fn connect_before_start_fails() {
    let client = NetManager::new(fast_config(), RecordingListener::accepting());
    assert!(matches!(
        client.connect(loopback(9050), &[]),
        Err(NetError::NotRunning)
    ));
}

#[test]
fn start_twice_returns_false_and_stop_is_idempotent() {
    let manager = NetManager::new(fast_config(), RecordingListener::accepting());
    assert!(manager.start(0));
    assert!(!manager.start(0));
    assert!(manager.is_running());

    manager.stop();
    assert!(!manager.is_running());
    manager.stop();
    assert!(!manager.is_running());

    // A stopped manager can be started again.
    assert!(manager.start(0));
    manager.stop();
}

#[test]
fn second_connect_returns_resident_peer() {
    let (server, _server_listener, client, client_listener) = start_pair();
    let server_addr = loopback(server.local_port());

    let first = client.connect(server_addr, &[]).unwrap();
    let second = client.connect(server_addr, &[]).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));

    client.stop();
    server.stop();
}
