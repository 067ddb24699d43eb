//! Manager configuration constants and structures.
//!
//! [`NetConfig`] controls all tunable parameters: logic tick period, ping and
//! disconnect timing, handshake retries, and the feature gates read by the
//! receive and logic paths. Configuration is frozen once the manager starts;
//! mutating it afterwards is out of contract.
use std::time::Duration;

pub const DEFAULT_UPDATE_TIME_MILLIS: u64 = 15;
pub const DEFAULT_PING_INTERVAL_MILLIS: u64 = 1000;
pub const DEFAULT_DISCONNECT_TIMEOUT_MILLIS: u64 = 5000;
pub const DEFAULT_RECONNECT_DELAY_MILLIS: u64 = 500;
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_PROTOCOL_ID: u32 = 0x4E4D_5831;
pub const DEFAULT_SIMULATION_MIN_LATENCY_MILLIS: u64 = 30;
pub const DEFAULT_SIMULATION_MAX_LATENCY_MILLIS: u64 = 100;

/// Connection numbers cycle modulo this value to disambiguate rapid
/// reconnects on the same endpoint.
pub const MAX_CONNECTION_NUMBER: u8 = 4;

/// The 5 delivery methods selectable for outbound user data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMethod {
    /// Fire and forget, no sequence tracking.
    #[default]
    Unreliable,
    /// ACK-based retransmission, deliver immediately on arrival.
    ReliableUnordered,
    /// ACK + buffer out-of-order, deliver in send order.
    ReliableOrdered,
    /// Deliver only if newer than last received, drop stale.
    Sequenced,
    /// ACK + deliver only latest, drop stale but still retransmit.
    ReliableSequenced,
}

impl DeliveryMethod {
    /// Returns `true` if this method provides guaranteed delivery.
    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            DeliveryMethod::ReliableUnordered
                | DeliveryMethod::ReliableOrdered
                | DeliveryMethod::ReliableSequenced
        )
    }

    /// Returns `true` if this method drops stale (out-of-sequence) messages.
    pub fn is_sequenced(&self) -> bool {
        matches!(
            self,
            DeliveryMethod::Sequenced | DeliveryMethod::ReliableSequenced
        )
    }
}

/// Configuration validation error.
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidUpdateTime,
    TimeoutNotGreaterThanPing,
    InvalidLossChance,
    InvalidLatencyRange,
    InvalidConnectAttempts,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidUpdateTime => write!(f, "update_time must be >= 1ms"),
            ConfigError::TimeoutNotGreaterThanPing => {
                write!(f, "disconnect_timeout must be > ping_interval")
            }
            ConfigError::InvalidLossChance => {
                write!(f, "simulation_packet_loss_chance must be <= 100")
            }
            ConfigError::InvalidLatencyRange => {
                write!(f, "simulation_min_latency must be <= simulation_max_latency")
            }
            ConfigError::InvalidConnectAttempts => {
                write!(f, "max_connect_attempts must be > 0")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level configuration shared by all peers of a manager.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Wire protocol identifier carried in every connect request.
    pub protocol_id: u32,

    /// Target period of the logic tick.
    pub update_time: Duration,
    /// Interval between pings on a connected peer.
    pub ping_interval: Duration,
    /// Idle time after which a peer is considered lost, and the time a
    /// disconnected record lingers before it is reaped.
    pub disconnect_timeout: Duration,
    /// Delay between connect-request (and shutdown) retransmissions.
    pub reconnect_delay: Duration,
    /// Connect-request attempts before the handshake is declared failed.
    pub max_connect_attempts: u32,

    /// Bind the sockets with `SO_REUSEADDR`.
    pub reuse_address: bool,

    /// Accept datagrams from endpoints without a peer record.
    pub unconnected_messages_enabled: bool,
    /// Hand NAT introduction/punch properties to the NAT module.
    pub nat_punch_enabled: bool,
    /// Answer and surface discovery requests.
    pub discovery_enabled: bool,
    /// Coalesce small queued datagrams into merged datagrams on flush.
    pub merge_enabled: bool,

    /// Dispatch events inline on the producing thread instead of queueing
    /// them for [`poll_events`](crate::NetManager::poll_events). The listener
    /// is then responsible for its own synchronization.
    pub unsynced_events: bool,
    /// Recycle a receive packet as soon as its callback returns. When false,
    /// the listener may detach the buffer out of the pool.
    pub auto_recycle: bool,

    /// Debug: randomly drop incoming datagrams.
    pub simulate_packet_loss: bool,
    /// Debug: randomly delay incoming datagrams.
    pub simulate_latency: bool,
    /// Drop chance in percent, 0-100.
    pub simulation_packet_loss_chance: u8,
    pub simulation_min_latency: Duration,
    pub simulation_max_latency: Duration,
}

impl NetConfig {
    /// Validates the configuration, returning an error if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_time < Duration::from_millis(1) {
            return Err(ConfigError::InvalidUpdateTime);
        }
        if self.disconnect_timeout <= self.ping_interval {
            return Err(ConfigError::TimeoutNotGreaterThanPing);
        }
        if self.simulation_packet_loss_chance > 100 {
            return Err(ConfigError::InvalidLossChance);
        }
        if self.simulation_min_latency > self.simulation_max_latency {
            return Err(ConfigError::InvalidLatencyRange);
        }
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::InvalidConnectAttempts);
        }
        Ok(())
    }
}

impl NetConfig {
    pub fn with_protocol_id(mut self, id: u32) -> Self {
        self.protocol_id = id;
        self
    }
    pub fn with_update_time(mut self, period: Duration) -> Self {
        self.update_time = period;
        self
    }
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }
    pub fn with_unconnected_messages(mut self, enabled: bool) -> Self {
        self.unconnected_messages_enabled = enabled;
        self
    }
    pub fn with_nat_punch(mut self, enabled: bool) -> Self {
        self.nat_punch_enabled = enabled;
        self
    }
    pub fn with_merge(mut self, enabled: bool) -> Self {
        self.merge_enabled = enabled;
        self
    }
    pub fn with_unsynced_events(mut self, enabled: bool) -> Self {
        self.unsynced_events = enabled;
        self
    }
    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }
    pub fn with_simulated_loss(mut self, chance_percent: u8) -> Self {
        self.simulate_packet_loss = true;
        self.simulation_packet_loss_chance = chance_percent;
        self
    }
    pub fn with_simulated_latency(mut self, min: Duration, max: Duration) -> Self {
        self.simulate_latency = true;
        self.simulation_min_latency = min;
        self.simulation_max_latency = max;
        self
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            protocol_id: DEFAULT_PROTOCOL_ID,

            update_time: Duration::from_millis(DEFAULT_UPDATE_TIME_MILLIS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MILLIS),
            disconnect_timeout: Duration::from_millis(DEFAULT_DISCONNECT_TIMEOUT_MILLIS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MILLIS),
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,

            reuse_address: false,

            unconnected_messages_enabled: false,
            nat_punch_enabled: false,
            discovery_enabled: false,
            merge_enabled: false,

            unsynced_events: false,
            auto_recycle: true,

            simulate_packet_loss: false,
            simulate_latency: false,
            simulation_packet_loss_chance: 10,
            simulation_min_latency: Duration::from_millis(DEFAULT_SIMULATION_MIN_LATENCY_MILLIS),
            simulation_max_latency: Duration::from_millis(DEFAULT_SIMULATION_MAX_LATENCY_MILLIS),
        }
    }
}
