//! Unconnected messages, discovery gating and round-trips, merged datagrams,
//! and the receive-path condition simulator.
mod common;

use std::net::UdpSocket;
use std::time::Duration;

use common::{fast_config, loopback, wait_until, Recorded, RecordingListener};
use netmux::prelude::*;
use netmux::PacketProperty;

#[test]
fn unconnected_message_requires_enable() {
    let open_listener = RecordingListener::accepting();
    let open = NetManager::new(
        fast_config().with_unconnected_messages(true),
        open_listener.clone(),
    );
    assert!(open.start(0));

    let closed_listener = RecordingListener::accepting();
    let closed = NetManager::new(fast_config(), closed_listener.clone());
    assert!(closed.start(0));

    let sender = NetManager::new(fast_config(), RecordingListener::accepting());
    assert!(sender.start(0));

    assert!(sender.send_unconnected_message(b"hi", loopback(open.local_port())));
    assert!(sender.send_unconnected_message(b"hi", loopback(closed.local_port())));

    assert!(wait_until(&[&open, &closed], Duration::from_secs(2), || {
        open_listener.count_where(|e| {
            matches!(
                e,
                Recorded::Unconnected(_, data, UnconnectedMessageType::BasicMessage) if data == b"hi"
            )
        }) == 1
    }));

    // The gated manager swallows it silently.
    std::thread::sleep(Duration::from_millis(200));
    closed.poll_events();
    assert_eq!(
        closed_listener.count_where(|e| matches!(e, Recorded::Unconnected(..))),
        0
    );

    sender.stop();
    open.stop();
    closed.stop();
}

#[test]
fn discovery_round_trip_with_raw_socket() {
    let listener = RecordingListener::accepting();
    let manager = NetManager::new(fast_config().with_discovery(true), listener.clone());
    assert!(manager.start(0));

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    probe
        .send_to(
            &[PacketProperty::DiscoveryRequest as u8, 0xAA],
            ("127.0.0.1", manager.local_port()),
        )
        .unwrap();

    assert!(wait_until(&[&manager], Duration::from_secs(2), || {
        listener.count_where(|e| {
            matches!(
                e,
                Recorded::Unconnected(_, data, UnconnectedMessageType::DiscoveryRequest)
                    if data == &[0xAA]
            )
        }) == 1
    }));

    // Answer the prober directly.
    let prober_endpoint = probe.local_addr().unwrap();
    assert!(manager.send_discovery_response(&[0xBB], prober_endpoint));

    let mut buf = [0u8; 64];
    let (len, _) = probe.recv_from(&mut buf).unwrap();
    assert_eq!(
        &buf[..len],
        &[PacketProperty::DiscoveryResponse as u8, 0xBB]
    );

    manager.stop();
}

#[test]
fn discovery_disabled_drops_request() {
    let listener = RecordingListener::accepting();
    let manager = NetManager::new(fast_config(), listener.clone());
    assert!(manager.start(0));

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
    probe
        .send_to(
            &[PacketProperty::DiscoveryRequest as u8, 0xAA],
            ("127.0.0.1", manager.local_port()),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));
    manager.poll_events();
    assert_eq!(
        listener.count_where(|e| matches!(e, Recorded::Unconnected(..))),
        0
    );

    manager.stop();
}

#[test]
fn merged_datagrams_are_split_transparently() {
    let server_listener = RecordingListener::accepting();
    let server = NetManager::new(fast_config(), server_listener.clone());
    assert!(server.start(0));

    let client_listener = RecordingListener::accepting();
    let client = NetManager::new(fast_config().with_merge(true), client_listener.clone());
    assert!(client.start(0));

    client.connect(loopback(server.local_port()), &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));

    // Two messages queued in the same tick leave as one merged datagram.
    client.send_to_all(b"first", DeliveryMethod::ReliableOrdered);
    client.send_to_all(b"second", DeliveryMethod::ReliableOrdered);
    client.flush();

    assert!(wait_until(&[&server, &client], Duration::from_secs(3), || {
        server_listener.count_where(|e| matches!(e, Recorded::Receive(..))) == 2
    }));

    client.stop();
    server.stop();
}

#[test]
fn full_packet_loss_fails_the_handshake() {
    // The server drops every incoming datagram, so the client's connect
    // attempts run out.
    let server = NetManager::new(
        fast_config().with_simulated_loss(100),
        RecordingListener::accepting(),
    );
    assert!(server.start(0));

    let client_listener = RecordingListener::accepting();
    let client = NetManager::new(
        fast_config().with_max_connect_attempts(3),
        client_listener.clone(),
    );
    assert!(client.start(0));

    client.connect(loopback(server.local_port()), &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(5), || {
        client_listener.count_where(|e| {
            matches!(e, Recorded::Disconnected(_, DisconnectReason::ConnectionFailed, _))
        }) == 1
    }));

    client.stop();
    server.stop();
}

#[test]
fn simulated_latency_still_connects() {
    let server_listener = RecordingListener::accepting();
    let server = NetManager::new(
        fast_config()
            .with_simulated_latency(Duration::from_millis(20), Duration::from_millis(40)),
        server_listener.clone(),
    );
    assert!(server.start(0));

    let client_listener = RecordingListener::accepting();
    let client = NetManager::new(fast_config(), client_listener.clone());
    assert!(client.start(0));

    client.connect(loopback(server.local_port()), &[]).unwrap();
    assert!(wait_until(&[&server, &client], Duration::from_secs(5), || {
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
    }));

    client.stop();
    server.stop();
}

#[test]
fn unsynced_events_dispatch_without_polling() {
    let server_listener = RecordingListener::accepting();
    let server = NetManager::new(
        fast_config().with_unsynced_events(true),
        server_listener.clone(),
    );
    assert!(server.start(0));

    let client_listener = RecordingListener::accepting();
    let client = NetManager::new(
        fast_config().with_unsynced_events(true),
        client_listener.clone(),
    );
    assert!(client.start(0));

    client.connect(loopback(server.local_port()), &[]).unwrap();

    // No poll_events anywhere: callbacks fire on the internal threads.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < deadline {
        if server_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
            && client_listener.count_where(|e| matches!(e, Recorded::Connected(_))) == 1
        {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        server_listener.count_where(|e| matches!(e, Recorded::Connected(_))),
        1
    );
    assert_eq!(
        client_listener.count_where(|e| matches!(e, Recorded::Connected(_))),
        1
    );

    client.stop();
    server.stop();
}
