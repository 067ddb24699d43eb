//! UDP socket abstraction: dual-stack binding, background receive threads,
//! and the send paths (unicast and broadcast).
//!
//! Each bound socket gets its own receive thread which hands every datagram
//! to the manager through [`MessageSink`]. Threads poll with a short read
//! timeout so `close` can stop them without platform-specific socket
//! shutdown tricks.
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::packet::MAX_PACKET_SIZE;

/// How long a receive thread blocks before re-checking the running flag.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Placeholder endpoint reported with socket-level receive failures.
fn null_endpoint() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Receiver of raw datagrams and socket errors. `error_code` is 0 for a
/// clean datagram, otherwise the OS error (or -1 when none is available).
pub(crate) trait MessageSink: Send + Sync + 'static {
    fn on_message_received(&self, data: &[u8], error_code: i32, remote: SocketAddr);
}

/// The bound socket pair plus its receive threads.
pub(crate) struct NetSocket {
    v4: Option<UdpSocket>,
    v6: Option<UdpSocket>,
    local_port: u16,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

fn bind_socket(
    addr: SocketAddr,
    ipv6: bool,
    reuse_address: bool,
) -> io::Result<UdpSocket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(reuse_address)?;
    if ipv6 {
        // Keep the v6 socket from shadowing the separately bound v4 one.
        socket.set_only_v6(true)?;
    } else {
        socket.set_broadcast(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(RECEIVE_POLL_INTERVAL))?;
    Ok(socket.into())
}

fn receive_loop(socket: UdpSocket, running: Arc<AtomicBool>, sink: Arc<dyn MessageSink>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, remote)) => sink.on_message_received(&buf[..len], 0, remote),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            // Per-datagram ICMP rejections show up as resets; not fatal.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    sink.on_message_received(&[], e.raw_os_error().unwrap_or(-1), null_endpoint());
                }
                break;
            }
        }
    }
}

impl NetSocket {
    /// Binds the v4 socket (and optionally a v6 twin on the same port) and
    /// starts a receive thread per socket.
    pub fn bind(
        addr_v4: Ipv4Addr,
        addr_v6: Option<Ipv6Addr>,
        port: u16,
        reuse_address: bool,
        sink: Arc<dyn MessageSink>,
    ) -> io::Result<NetSocket> {
        let v4 = bind_socket(
            SocketAddr::V4(SocketAddrV4::new(addr_v4, port)),
            false,
            reuse_address,
        )?;
        let local_port = v4.local_addr()?.port();

        let v6 = match addr_v6 {
            Some(addr) => Some(bind_socket(
                SocketAddr::V6(SocketAddrV6::new(addr, local_port, 0, 0)),
                true,
                reuse_address,
            )?),
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();
        for socket in [Some(&v4), v6.as_ref()].into_iter().flatten() {
            let socket = socket.try_clone()?;
            let running = running.clone();
            let sink = sink.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("netmux-recv".into())
                    .spawn(move || receive_loop(socket, running, sink))?,
            );
        }

        Ok(NetSocket {
            v4: Some(v4),
            v6,
            local_port,
            running,
            threads: Mutex::new(threads),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Sends a datagram, choosing the socket by address family.
    pub fn send_to(&self, data: &[u8], endpoint: SocketAddr) -> io::Result<usize> {
        let socket = match endpoint {
            SocketAddr::V4(_) => self.v4.as_ref(),
            SocketAddr::V6(_) => self.v6.as_ref(),
        };
        match socket {
            Some(socket) => socket.send_to(data, endpoint),
            None => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no socket bound for this address family",
            )),
        }
    }

    /// Broadcasts on the v4 socket to every host on the local network.
    pub fn send_broadcast(&self, data: &[u8], port: u16) -> bool {
        match &self.v4 {
            Some(socket) => socket
                .send_to(data, SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
                .is_ok(),
            None => false,
        }
    }

    /// Stops and joins the receive threads. Safe to call more than once.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for NetSocket {
    fn drop(&mut self) {
        self.close();
    }
}
