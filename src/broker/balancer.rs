//! Producer Load Balancing
//!
//! With `load_balancing = "on_demand"` a producer message is placed on the
//! next target of a per-queue rotation over the local binding (when it has
//! consumers) and every peer currently advertising consumers for the queue,
//! in node-id order. A message routed to a peer that fails is enqueued
//! locally instead, where redistribution can still move it later. A route
//! whose outcome is unknown is resent to the same peer until it answers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::cluster::membership::MembershipView;
use crate::cluster::protocol::TransferKind;
use crate::config::LoadBalancing;
use crate::message::{Message, MessageId};
use crate::metrics::Metrics;
use crate::queue::{validate_queue_name, BindingRegistry, QueueError};
use crate::remote::{PeerDirectory, RemoteError, RemotePeer};

/// Where a producer message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(Arc<str>),
}

pub struct Balancer {
    mode: LoadBalancing,
    registry: Arc<BindingRegistry>,
    membership: Arc<MembershipView>,
    peers: Arc<dyn PeerDirectory>,
    cursors: DashMap<Arc<str>, usize>,
    metrics: Option<Arc<Metrics>>,
    resend_interval: Duration,
}

impl Balancer {
    pub fn new(
        mode: LoadBalancing,
        registry: Arc<BindingRegistry>,
        membership: Arc<MembershipView>,
        peers: Arc<dyn PeerDirectory>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            mode,
            registry,
            membership,
            peers,
            cursors: DashMap::new(),
            metrics,
            resend_interval: Duration::from_secs(1),
        }
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Rotation members for a queue: local first when it has consumers,
    /// then candidate peers by node id
    pub fn targets(&self, queue: &str) -> Vec<Target> {
        let mut targets = Vec::new();
        if self.registry.consumer_count(queue) > 0 {
            targets.push(Target::Local);
        }
        let mut remote: Vec<Arc<str>> = self
            .membership
            .candidates_for(queue)
            .into_iter()
            .map(|c| c.node_id)
            .collect();
        remote.sort();
        targets.extend(remote.into_iter().map(Target::Remote));
        targets
    }

    /// Pick the next target for a queue and advance its rotation
    pub fn next_target(&self, queue: &str) -> Target {
        if self.mode == LoadBalancing::Off {
            return Target::Local;
        }
        let mut targets = self.targets(queue);
        if targets.len() <= 1 {
            return targets.pop().unwrap_or(Target::Local);
        }
        let index = {
            let mut cursor = self.cursors.entry(Arc::from(queue)).or_insert(0);
            let index = *cursor % targets.len();
            *cursor = cursor.wrapping_add(1);
            index
        };
        targets.swap_remove(index)
    }

    /// Place a producer message on this node or a peer
    pub async fn enqueue(&self, queue: &str, message: Message) -> Result<MessageId, QueueError> {
        validate_queue_name(queue)?;
        let id = message.id();

        let node_id = match self.next_target(queue) {
            Target::Local => {
                self.registry.enqueue(queue, message)?;
                return Ok(id);
            }
            Target::Remote(node_id) => node_id,
        };

        let Some(peer) = self.peers.peer(&node_id) else {
            self.registry.enqueue(queue, message)?;
            return Ok(id);
        };

        let result = match peer.send(queue, &message, TransferKind::Route).await {
            Err(e) if e.is_indeterminate() => {
                warn!(
                    "Balancer: outcome of routing {} to '{}' unknown, resending: {}",
                    id, node_id, e
                );
                if let Some(ref metrics) = self.metrics {
                    metrics.bridge_send_failed(e.reason());
                }
                self.resend(peer.as_ref(), queue, &message).await
            }
            result => result,
        };

        match result {
            Ok(()) => {
                debug!("Balancer: routed {} for '{}' to '{}'", id, queue, node_id);
                if let Some(ref metrics) = self.metrics {
                    metrics.message_routed();
                }
            }
            Err(e) => {
                warn!(
                    "Balancer: routing {} for '{}' to '{}' failed, keeping it local: {}",
                    id, queue, node_id, e
                );
                self.membership.record_failure(&node_id);
                if let Some(ref metrics) = self.metrics {
                    metrics.bridge_send_failed(e.reason());
                }
                self.registry.enqueue(queue, message)?;
            }
        }
        Ok(id)
    }

    /// Resend until the peer acknowledges or rejects. The peer acknowledges
    /// an id it already holds, so a rejection is the only proof it has none.
    async fn resend(
        &self,
        peer: &dyn RemotePeer,
        queue: &str,
        message: &Message,
    ) -> Result<(), RemoteError> {
        loop {
            tokio::time::sleep(self.resend_interval).await;
            match peer.send(queue, message, TransferKind::Route).await {
                Ok(()) => return Ok(()),
                Err(e @ RemoteError::Rejected(_)) => return Err(e),
                Err(e) => {
                    debug!(
                        "Balancer: resend of {} to '{}' failed: {}",
                        message.id(),
                        peer.name(),
                        e
                    );
                    if let Some(ref metrics) = self.metrics {
                        metrics.bridge_send_failed(e.reason());
                    }
                }
            }
        }
    }
}
