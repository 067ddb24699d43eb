//! Echo server demo — accepts every connection and reflects all received
//! messages back to the sender.
//!
//! Run with: `cargo run --example echo_server`

use std::sync::Arc;

use netmux::prelude::*;

struct EchoListener;

impl NetListener for EchoListener {
    fn on_peer_connected(&self, peer: &Arc<NetPeer>) {
        println!("[+] peer connected: {}", peer.endpoint());
    }

    fn on_peer_disconnected(&self, peer: &Arc<NetPeer>, info: DisconnectInfo) {
        println!(
            "[-] peer disconnected: {} ({:?})",
            peer.endpoint(),
            info.reason
        );
    }

    fn on_network_receive(
        &self,
        peer: &Arc<NetPeer>,
        reader: &mut NetDataReader,
        method: DeliveryMethod,
    ) {
        let data = reader.remaining().to_vec();
        println!(
            "[<] {} bytes via {:?} from {}",
            data.len(),
            method,
            peer.endpoint()
        );
        if let Err(e) = peer.send(&data, method) {
            eprintln!("echo failed: {e}");
        }
    }

    fn on_network_latency_update(&self, peer: &Arc<NetPeer>, latency_ms: u32) {
        println!("[~] {} latency {} ms", peer.endpoint(), latency_ms);
    }

    fn on_connection_request(&self, request: Arc<ConnectionRequest>) {
        println!("[?] connection request from {}", request.remote_endpoint());
        let _ = request.accept();
    }
}

fn main() {
    let manager = NetManager::new(NetConfig::default(), Arc::new(EchoListener));
    if !manager.start(7777) {
        eprintln!("failed to bind port 7777");
        return;
    }
    println!("echo server listening on {}", manager.local_port());

    loop {
        manager.poll_events();
        std::thread::sleep(std::time::Duration::from_millis(15));
    }
}
