//! Shared listener harness for the loopback end-to-end tests.
#![allow(dead_code)]
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use netmux::prelude::*;

#[derive(Debug, Clone)]
pub enum Recorded {
    Connected(SocketAddr),
    Disconnected(SocketAddr, DisconnectReason, Vec<u8>),
    Receive(SocketAddr, Vec<u8>, DeliveryMethod),
    Unconnected(SocketAddr, Vec<u8>, UnconnectedMessageType),
    Latency(SocketAddr, u32),
    Error(i32),
}

enum RequestPolicy {
    Accept,
    Reject(Vec<u8>),
    Ignore,
}

/// Records every callback and resolves connection requests per its policy.
pub struct RecordingListener {
    pub events: Mutex<Vec<Recorded>>,
    pub request_payloads: Mutex<Vec<Vec<u8>>>,
    policy: RequestPolicy,
}

impl RecordingListener {
    fn with_policy(policy: RequestPolicy) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            request_payloads: Mutex::new(Vec::new()),
            policy,
        })
    }

    pub fn accepting() -> Arc<Self> {
        Self::with_policy(RequestPolicy::Accept)
    }

    pub fn rejecting(data: &[u8]) -> Arc<Self> {
        Self::with_policy(RequestPolicy::Reject(data.to_vec()))
    }

    #[allow(dead_code)]
    pub fn ignoring() -> Arc<Self> {
        Self::with_policy(RequestPolicy::Ignore)
    }

    pub fn snapshot(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn count_where(&self, pred: impl Fn(&Recorded) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl NetListener for RecordingListener {
    fn on_peer_connected(&self, peer: &Arc<NetPeer>) {
        self.events.lock().push(Recorded::Connected(peer.endpoint()));
    }

    fn on_peer_disconnected(&self, peer: &Arc<NetPeer>, info: DisconnectInfo) {
        self.events.lock().push(Recorded::Disconnected(
            peer.endpoint(),
            info.reason,
            info.additional_data,
        ));
    }

    fn on_network_receive(
        &self,
        peer: &Arc<NetPeer>,
        reader: &mut NetDataReader,
        method: DeliveryMethod,
    ) {
        self.events.lock().push(Recorded::Receive(
            peer.endpoint(),
            reader.remaining().to_vec(),
            method,
        ));
    }

    fn on_network_receive_unconnected(
        &self,
        endpoint: SocketAddr,
        reader: &mut NetDataReader,
        message_type: UnconnectedMessageType,
    ) {
        self.events.lock().push(Recorded::Unconnected(
            endpoint,
            reader.remaining().to_vec(),
            message_type,
        ));
    }

    fn on_network_error(&self, _endpoint: Option<SocketAddr>, error_code: i32) {
        self.events.lock().push(Recorded::Error(error_code));
    }

    fn on_network_latency_update(&self, peer: &Arc<NetPeer>, latency_ms: u32) {
        self.events
            .lock()
            .push(Recorded::Latency(peer.endpoint(), latency_ms));
    }

    fn on_connection_request(&self, request: Arc<ConnectionRequest>) {
        self.request_payloads.lock().push(request.data().to_vec());
        match &self.policy {
            RequestPolicy::Accept => {
                let _ = request.accept();
            }
            RequestPolicy::Reject(data) => request.reject(data),
            RequestPolicy::Ignore => {}
        }
    }
}

/// Polls the managers until `pred` holds or `timeout` expires.
pub fn wait_until(
    managers: &[&NetManager],
    timeout: Duration,
    mut pred: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for manager in managers {
            manager.poll_events();
        }
        if pred() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Tight timers so the scenarios finish quickly.
pub fn fast_config() -> NetConfig {
    NetConfig::default()
        .with_ping_interval(Duration::from_millis(200))
        .with_disconnect_timeout(Duration::from_millis(700))
        .with_reconnect_delay(Duration::from_millis(100))
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
