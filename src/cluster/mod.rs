//! Cluster Module
//!
//! Peer-to-peer plumbing for a RelayMQ cluster.
//!
//! # Architecture
//!
//! - **Membership**: which peers are reachable and how many consumers each
//!   advertises per queue
//! - **Peer TCP**: one outbound bridge per peer carrying transfers and
//!   advertisements; inbound connections are served by the manager
//! - **Gossip (UDP via chitchat)**: optional peer discovery
//!
//! # Usage
//!
//! ```toml
//! # relaymq.toml
//! [cluster]
//! enabled = true
//! peer_addr = "0.0.0.0:7947"
//!
//! [[cluster.peers]]
//! id = "node2"
//! addr = "10.0.0.2:7947"
//! ```

mod manager;
pub mod membership;
mod peer;
pub mod protocol;

pub use manager::{ClusterHandler, ClusterManager};
pub use membership::{AdvertisementOutcome, Candidate, ClusterNode, MembershipView, Reachability};
pub use peer::ClusterPeer;
pub use protocol::{ClusterMessage, TransferKind, CLUSTER_PROTOCOL_VERSION};

// Re-export cluster config
pub use crate::config::ClusterConfig;

#[cfg(test)]
mod tests;
