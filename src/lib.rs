//! # netmux
//!
//! A connection-oriented, reliable message transport layered on UDP.
//!
//! The central [`NetManager`] owns the datagram sockets, maintains the table
//! of remote peers, demultiplexes every incoming datagram to a per-peer
//! state machine, and drives a fixed-period logic tick. Activity is reported
//! to a [`NetListener`] as an ordered stream of events drained with
//! [`NetManager::poll_events`].
//!
//! ## Features
//!
//! - **5 delivery methods**: Unreliable, ReliableUnordered, ReliableOrdered,
//!   Sequenced, ReliableSequenced
//! - **Connection identity**: 64-bit connection ids plus a wrapping
//!   connection number disambiguate retries, reconnects, endpoint reuse, and
//!   simultaneous peer-to-peer dials
//! - **Explicit disconnect lifecycle** with shutdown acknowledgment, plus
//!   idle timeouts
//! - **Pooled buffers**: packets and events are recycled, not reallocated,
//!   on the hot paths
//! - **Discovery and unconnected messages** over the same socket
//! - **NAT punch-through** module behind a feature gate in the configuration
//! - **Debug loss/latency simulation** on the receive path
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use netmux::{NetConfig, NetListener, NetManager};
//!
//! struct Listener;
//! impl NetListener for Listener {
//!     fn on_connection_request(&self, request: Arc<netmux::ConnectionRequest>) {
//!         let _ = request.accept();
//!     }
//! }
//!
//! let server = NetManager::new(NetConfig::default(), Arc::new(Listener));
//! assert!(server.start(9050));
//! loop {
//!     server.poll_events();
//!     std::thread::sleep(std::time::Duration::from_millis(15));
//! }
//! ```

mod channel;
pub mod config;
pub mod data;
pub mod event;
pub mod manager;
pub mod nat;
pub mod packet;
pub mod peer;
mod peer_table;
pub mod pool;
mod simulator;
mod socket;
pub mod stats;

pub use config::{ConfigError, DeliveryMethod, NetConfig, MAX_CONNECTION_NUMBER};
pub use data::{NetDataReader, NetDataWriter};
pub use event::{
    ConnectionRequest, ConnectionRequestType, DisconnectInfo, DisconnectReason, NetListener,
    UnconnectedMessageType,
};
pub use manager::NetManager;
pub use nat::{NatPunchListener, NatPunchModule};
pub use packet::{NetPacket, PacketProperty};
pub use peer::{
    classify_connect_request, ConnectRequestResult, ConnectionState, NetPeer, ShutdownResult,
};
pub use pool::PacketPool;
pub use stats::NetStatistics;

/// Unified error type for the user-facing API.
#[derive(Debug)]
pub enum NetError {
    /// The manager is not started.
    NotRunning,
    /// Payload exceeds the maximum datagram size.
    MessageTooLarge,
    /// The peer is not in a connected state.
    PeerNotConnected,
    Io(std::io::Error),
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetError::NotRunning => write!(f, "manager is not running"),
            NetError::MessageTooLarge => write!(f, "message exceeds maximum packet size"),
            NetError::PeerNotConnected => write!(f, "peer is not connected"),
            NetError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NetError {}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        NetError::Io(err)
    }
}

/// Prelude: import everything commonly needed.
pub mod prelude {
    pub use crate::{
        ConnectionRequest, ConnectionState, DeliveryMethod, DisconnectInfo, DisconnectReason,
        NetConfig, NetDataReader, NetDataWriter, NetError, NetListener, NetManager, NetPeer,
        UnconnectedMessageType,
    };
}
