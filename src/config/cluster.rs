//! Cluster Configuration
//!
//! Peer connections, reconnect policy, advertisement timing and optional
//! gossip discovery.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::protocol::DEFAULT_MAX_FRAME_SIZE;

/// A statically configured peer node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticPeer {
    /// Node id the peer announces in its handshake
    pub id: String,
    /// Address of the peer's cluster listener
    pub addr: SocketAddr,
}

/// Cluster configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Whether clustering is enabled
    pub enabled: bool,

    /// Address the peer listener binds to
    /// Default: 0.0.0.0:7947
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,

    /// Address peers use to reach us (published through gossip)
    /// If not set, resolved from hostname or falls back to peer_addr
    pub peer_advertise_addr: Option<SocketAddr>,

    /// Statically configured peers
    #[serde(default)]
    pub peers: Vec<StaticPeer>,

    /// Gossip seed nodes ("host:port"); gossip discovery is off when empty
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Address for the gossip protocol (chitchat) to bind to
    /// Default: 0.0.0.0:7946
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: SocketAddr,

    /// Gossip advertise address
    pub gossip_advertise_addr: Option<SocketAddr>,

    #[serde(default = "default_gossip_interval", with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// Grace period before a dead gossip node is removed
    #[serde(default = "default_dead_node_grace_period", with = "humantime_serde")]
    pub dead_node_grace_period: Duration,

    /// First reconnect delay; doubles on each failure
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Upper bound for the reconnect delay
    #[serde(default = "default_max_retry_interval", with = "humantime_serde")]
    pub max_retry_interval: Duration,

    /// Consecutive failures before a peer is marked down
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// How long a transfer may wait for the peer's acknowledgment
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Period of the consumer-count heartbeat
    #[serde(default = "default_advertise_interval", with = "humantime_serde")]
    pub advertise_interval: Duration,

    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    /// Largest accepted cluster frame in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7947))
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_gossip_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_dead_node_grace_period() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_retry_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_advertise_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_ping_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peer_addr: default_peer_addr(),
            peer_advertise_addr: None,
            peers: Vec::new(),
            seeds: Vec::new(),
            gossip_addr: default_gossip_addr(),
            gossip_advertise_addr: None,
            gossip_interval: default_gossip_interval(),
            dead_node_grace_period: default_dead_node_grace_period(),
            retry_interval: default_retry_interval(),
            max_retry_interval: default_max_retry_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout: default_connect_timeout(),
            ack_timeout: default_ack_timeout(),
            advertise_interval: default_advertise_interval(),
            ping_interval: default_ping_interval(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ClusterConfig {
    /// Whether gossip discovery is configured
    pub fn gossip_enabled(&self) -> bool {
        !self.seeds.is_empty()
    }

    /// Get the gossip advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_gossip_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.gossip_advertise_addr {
            return addr;
        }
        if let Some(ip) = resolve_local_ip() {
            return SocketAddr::new(ip, self.gossip_addr.port());
        }
        self.gossip_addr
    }

    /// Get the peer advertise address (what peers use to reach us)
    /// Priority: explicit config > resolved hostname > bind address
    pub fn get_peer_advertise_addr(&self) -> SocketAddr {
        if let Some(addr) = self.peer_advertise_addr {
            return addr;
        }
        if let Some(ip) = resolve_local_ip() {
            return SocketAddr::new(ip, self.peer_addr.port());
        }
        self.peer_addr
    }
}

/// Resolve the local machine's IP address by resolving the hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    let addr_str = format!("{}:0", hostname.to_string_lossy());
    addr_str
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}
