//! Remote Peer Abstraction
//!
//! Trait for handing messages and advertisements to another cluster node.
//! The redistribution controller and the producer balancer only talk to
//! peers through this trait; the TCP bridge in `cluster::peer` implements it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::cluster::protocol::TransferKind;
use crate::message::Message;
use crate::relay::RelayError;

/// Error type for remote peer operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection to the peer was lost while the operation was pending
    ConnectionLost(String),
    /// The peer is not connected; the operation was not attempted
    Unreachable(String),
    /// The peer refused the transfer
    Rejected(String),
    /// No acknowledgment within the ack timeout
    Timeout,
    /// The body could not be read or streamed completely
    RelayInterrupted(String),
    /// The whole transfer was written but no verdict arrived; the peer may
    /// already own the message
    Indeterminate(String),
    /// Other error
    Other(String),
}

impl RemoteError {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            RemoteError::ConnectionLost(_) => "connection_lost",
            RemoteError::Unreachable(_) => "unreachable",
            RemoteError::Rejected(_) => "rejected",
            RemoteError::Timeout => "timeout",
            RemoteError::RelayInterrupted(_) => "relay_interrupted",
            RemoteError::Indeterminate(_) => "indeterminate",
            RemoteError::Other(_) => "other",
        }
    }

    /// True when the peer may hold the message despite the error. The sender
    /// must not hand it to anyone but the same peer again.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, RemoteError::Indeterminate(_))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            RemoteError::Unreachable(node) => write!(f, "Peer {} unreachable", node),
            RemoteError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::RelayInterrupted(msg) => write!(f, "Relay interrupted: {}", msg),
            RemoteError::Indeterminate(msg) => write!(f, "Transfer outcome unknown: {}", msg),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<RelayError> for RemoteError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Sink(e) => RemoteError::ConnectionLost(e.to_string()),
            other => RemoteError::RelayInterrupted(other.to_string()),
        }
    }
}

/// Status of a remote peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePeerStatus {
    /// Not connected, will attempt to connect
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
    /// Reconnect attempts exhausted; still retrying at the maximum interval
    Down,
}

/// A consumer-count announcement for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub queue: Arc<str>,
    pub consumer_count: u32,
    pub seq: u64,
}

/// Trait for cluster peer communication
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Node id of the peer
    fn name(&self) -> &str;

    /// Get the current connection status
    fn status(&self) -> RemotePeerStatus;

    /// Transfer a message to the peer's binding for `queue`.
    ///
    /// Resolves once the peer acknowledged the message as pending on its
    /// side. Fails fast with `Unreachable` while not connected. The caller
    /// keeps its copy of the message so it can restore it on failure.
    async fn send(
        &self,
        queue: &str,
        message: &Message,
        kind: TransferKind,
    ) -> Result<(), RemoteError>;

    /// Announce a local consumer count to the peer
    async fn advertise(&self, advertisement: Advertisement) -> Result<(), RemoteError>;

    /// Start the peer connection (called once at startup)
    async fn start(&self) -> Result<(), RemoteError>;

    /// Stop the peer connection gracefully
    async fn stop(&self) -> Result<(), RemoteError>;
}

/// Lookup of peers by node id
pub trait PeerDirectory: Send + Sync {
    fn peer(&self, node_id: &str) -> Option<Arc<dyn RemotePeer>>;
}

/// The set of known cluster peers
pub struct RemotePeers {
    peers: RwLock<Vec<Arc<dyn RemotePeer>>>,
}

impl RemotePeers {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Add a peer; a peer with the same name is replaced and returned
    pub fn add(&self, peer: Arc<dyn RemotePeer>) -> Option<Arc<dyn RemotePeer>> {
        let mut peers = self.peers.write();
        if let Some(pos) = peers.iter().position(|p| p.name() == peer.name()) {
            return Some(std::mem::replace(&mut peers[pos], peer));
        }
        peers.push(peer);
        None
    }

    pub fn remove(&self, node_id: &str) -> Option<Arc<dyn RemotePeer>> {
        let mut peers = self.peers.write();
        let pos = peers.iter().position(|p| p.name() == node_id)?;
        Some(peers.remove(pos))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.peers.read().iter().any(|p| p.name() == node_id)
    }

    /// Snapshot of all peers
    pub fn all(&self) -> Vec<Arc<dyn RemotePeer>> {
        self.peers.read().clone()
    }

    /// Send an advertisement to every connected peer
    pub async fn advertise_all(&self, advertisement: &Advertisement) {
        for peer in self.all() {
            if peer.status() == RemotePeerStatus::Connected {
                let _ = peer.advertise(advertisement.clone()).await;
            }
        }
    }

    /// Start all peer connections
    pub async fn start_all(&self) -> Vec<(String, Result<(), RemoteError>)> {
        let mut results = Vec::new();
        for peer in self.all() {
            let result = peer.start().await;
            results.push((peer.name().to_string(), result));
        }
        results
    }

    /// Stop all peer connections
    pub async fn stop_all(&self) -> Vec<(String, Result<(), RemoteError>)> {
        let mut results = Vec::new();
        for peer in self.all() {
            let result = peer.stop().await;
            results.push((peer.name().to_string(), result));
        }
        results
    }

    /// Get number of peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Check if there are no peers
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Get number of connected peers
    pub fn connected_count(&self) -> usize {
        self.peers
            .read()
            .iter()
            .filter(|p| p.status() == RemotePeerStatus::Connected)
            .count()
    }
}

impl Default for RemotePeers {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory for RemotePeers {
    fn peer(&self, node_id: &str) -> Option<Arc<dyn RemotePeer>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.name() == node_id)
            .cloned()
    }
}
