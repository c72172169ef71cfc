//! RelayMQ - clustered point-to-point queue broker core
//!
//! Queues are bound on every node of a cluster. Messages left pending on a
//! node without consumers are redistributed to a peer that advertises
//! consumers for the same queue, with bodies relayed in chunks so large
//! messages never sit wholly in memory.

pub mod broker;
pub mod cluster;
pub mod config;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod redistribution;
pub mod relay;
pub mod remote;

pub use broker::{Broker, BrokerError};
pub use cluster::{ClusterConfig, ClusterManager};
pub use config::Config;
pub use message::{Message, MessageId, Properties};
pub use metrics::{Metrics, MetricsServer};
pub use queue::{Consumer, Delivery, QueueError, Session};
pub use redistribution::RedistributionController;
pub use relay::{Body, BodyRelay, RelayError};
pub use remote::{RemoteError, RemotePeer, RemotePeerStatus};
