//! Runtime configuration
//!
//! Defaults match the fixed constants of the two-process ping-pong setup:
//! a 3s request timeout, a 1s candidate pairing window, a 3s message period,
//! 1500-byte reads and 15-character payloads.

use std::net::SocketAddr;
use std::time::Duration;

/// Default signaling port
pub const DEFAULT_SIGNALING_PORT: u16 = 9001;

/// Default STUN servers, used only when explicitly requested
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// The two independent role axes of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Role {
    /// ICE controlling (dials) or controlled (accepts)
    pub is_controlling: bool,
    /// Signaling listener or initiator
    pub is_server: bool,
}

impl Role {
    pub fn new(is_controlling: bool, is_server: bool) -> Self {
        Self {
            is_controlling,
            is_server,
        }
    }

    pub fn ice_role(&self) -> &'static str {
        if self.is_controlling {
            "controlling"
        } else {
            "controlled"
        }
    }

    pub fn signaling_role(&self) -> &'static str {
        if self.is_server {
            "server"
        } else {
            "client"
        }
    }
}

/// Backoff schedule for recoverable signaling faults
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based), doubling from the initial backoff
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << shift)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Exchange channel configuration
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Base URL of the peer's listener (client role)
    pub peer_url: String,
    /// Address the listener binds to (server role)
    pub listen_addr: SocketAddr,
    /// Bound on each initiator request
    pub request_timeout: Duration,
    /// How long the initiator polls for the listener to come up
    pub ready_timeout: Duration,
    /// How long a candidate request waits for a local candidate to piggyback
    pub pairing_window: Duration,
    /// Capacity of the local candidate relay queue
    pub relay_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            peer_url: format!("http://127.0.0.1:{}", DEFAULT_SIGNALING_PORT),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SIGNALING_PORT)),
            request_timeout: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(60),
            pairing_window: Duration::from_secs(1),
            relay_capacity: 3,
            retry: RetryPolicy::default(),
        }
    }
}

/// When dial/accept may start relative to local candidate gathering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidatePolicy {
    /// Start as soon as gathering has been triggered and rely on trickle
    #[default]
    Immediate,
    /// Wait until this many local candidates were relayed or gathering finished
    AtLeast(usize),
}

/// ICE network types offered to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Udp4,
    Udp6,
    Tcp4,
    Tcp6,
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub role: Role,
    pub exchange: ExchangeConfig,
    /// Bound on dial/accept
    pub establish_timeout: Duration,
    pub candidate_policy: CandidatePolicy,
    /// Capacity of the engine event channel
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            exchange: ExchangeConfig::default(),
            establish_timeout: Duration::from_secs(30),
            candidate_policy: CandidatePolicy::Immediate,
            event_capacity: 32,
        }
    }
}

/// ICE agent configuration
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub network_types: Vec<NetworkKind>,
    /// Public addresses announced in place of host addresses (1:1 NAT)
    pub nat_1to1_ips: Vec<String>,
    pub stun_urls: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            network_types: vec![NetworkKind::Udp4],
            nat_1to1_ips: Vec::new(),
            stun_urls: Vec::new(),
        }
    }
}

/// Message loop configuration
#[derive(Debug, Clone)]
pub struct MessageLoopConfig {
    /// Interval between outgoing payloads
    pub period: Duration,
    /// Read buffer capacity in bytes
    pub read_buffer: usize,
    /// Length of each random payload
    pub payload_len: usize,
}

impl Default for MessageLoopConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(3),
            read_buffer: 1500,
            payload_len: 15,
        }
    }
}
