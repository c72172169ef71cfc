//! RelayMQ Node
//!
//! The broker wires the binding registry, the cluster manager, the
//! redistribution controller and the producer balancer into one node, and
//! runs the node event loop that connects them:
//!
//! - local consumer-count changes are advertised to peers,
//! - stranded bindings wake the redistribution controller,
//! - peers advertising consumers (or reconnecting) re-check stranded bindings.

mod balancer;

pub use balancer::{Balancer, Target};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use crate::cluster::{ClusterHandler, ClusterManager, MembershipView, TransferKind};
use crate::config::{Config, LoadBalancing};
use crate::message::{Message, MessageId, Properties};
use crate::metrics::{Metrics, MetricsServer};
use crate::queue::{BindingEvent, BindingRegistry, QueueError, Session};
use crate::redistribution::RedistributionController;
use crate::relay::{BodyRelay, RelayError};
use crate::remote::{PeerDirectory, RemotePeers};

/// Errors from producer operations
#[derive(Debug)]
pub enum BrokerError {
    Queue(QueueError),
    Relay(RelayError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Queue(e) => write!(f, "{}", e),
            BrokerError::Relay(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Queue(e) => Some(e),
            BrokerError::Relay(e) => Some(e),
        }
    }
}

impl From<QueueError> for BrokerError {
    fn from(e: QueueError) -> Self {
        BrokerError::Queue(e)
    }
}

impl From<RelayError> for BrokerError {
    fn from(e: RelayError) -> Self {
        BrokerError::Relay(e)
    }
}

/// Cluster notifications forwarded to the node event loop
#[derive(Debug)]
enum ClusterEvent {
    RemoteConsumers { queue: String },
    PeerConnected { node_id: String },
}

/// Receives transfers and notifications from peers
struct NodeHandler {
    registry: Arc<BindingRegistry>,
    events: mpsc::UnboundedSender<ClusterEvent>,
}

impl ClusterHandler for NodeHandler {
    fn on_transfer(
        &self,
        from: &str,
        queue: &str,
        message: Message,
        kind: TransferKind,
    ) -> Result<(), QueueError> {
        debug!(
            "Broker: received {} for '{}' from '{}' ({})",
            message.id(),
            queue,
            from,
            kind.as_str()
        );
        // Messages from peers are never balanced again
        self.registry.enqueue(queue, message)
    }

    fn on_remote_consumers(&self, queue: &str) {
        let _ = self.events.send(ClusterEvent::RemoteConsumers {
            queue: queue.to_string(),
        });
    }

    fn on_peer_connected(&self, node_id: &str) {
        let _ = self.events.send(ClusterEvent::PeerConnected {
            node_id: node_id.to_string(),
        });
    }
}

type EventReceivers = (
    mpsc::UnboundedReceiver<BindingEvent>,
    mpsc::UnboundedReceiver<ClusterEvent>,
);

/// A RelayMQ node
pub struct Broker {
    node_id: Arc<str>,
    config: Config,
    registry: Arc<BindingRegistry>,
    membership: Arc<MembershipView>,
    relay: BodyRelay,
    cluster: Option<Arc<ClusterManager>>,
    controller: RedistributionController,
    balancer: Balancer,
    metrics: Arc<Metrics>,
    /// Taken by `start`
    receivers: Mutex<Option<EventReceivers>>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    ready: Arc<AtomicBool>,
}

impl Broker {
    pub fn new(config: Config) -> Self {
        let node_id: Arc<str> = Arc::from(config.node.get_node_id());
        let metrics = Arc::new(Metrics::new());
        let (shutdown, _) = broadcast::channel(1);

        let (binding_tx, binding_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(
            BindingRegistry::new(config.queues.consumer_window, binding_tx)
                .with_metrics(metrics.clone()),
        );
        let membership = Arc::new(MembershipView::new(
            node_id.clone(),
            config.redistribution.failure_cooldown,
        ));
        let relay = BodyRelay::new(&config.relay);

        let (cluster_tx, cluster_rx) = mpsc::unbounded_channel();
        let cluster = config.cluster.enabled.then(|| {
            let handler = Arc::new(NodeHandler {
                registry: registry.clone(),
                events: cluster_tx,
            });
            Arc::new(ClusterManager::new(
                &node_id,
                config.cluster.clone(),
                relay.clone(),
                membership.clone(),
                handler,
                Some(metrics.clone()),
            ))
        });
        let peers: Arc<dyn PeerDirectory> = match cluster {
            Some(ref manager) => manager.peers(),
            None => Arc::new(RemotePeers::new()),
        };

        let controller = RedistributionController::new(
            registry.clone(),
            membership.clone(),
            peers.clone(),
            config.redistribution.clone(),
            shutdown.clone(),
        )
        .with_metrics(metrics.clone());

        let balancer = Balancer::new(
            config.queues.load_balancing,
            registry.clone(),
            membership.clone(),
            peers,
            Some(metrics.clone()),
        )
        .with_resend_interval(config.redistribution.failure_cooldown);

        Self {
            node_id,
            config,
            registry,
            membership,
            relay,
            cluster,
            controller,
            balancer,
            metrics,
            receivers: Mutex::new(Some((binding_rx, cluster_rx))),
            shutdown,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the cluster, the redistribution controller and the node event
    /// loop. Returns once the node accepts peer connections.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some((binding_rx, cluster_rx)) = self.receivers.lock().take() else {
            return Err("broker already started".into());
        };

        for queue in &self.config.queue {
            self.registry.binding(&queue.name)?;
            debug!("Declared queue '{}'", queue.name);
        }

        if self.config.metrics.enabled {
            let server = MetricsServer::new(
                self.metrics.clone(),
                self.config.metrics.bind,
                self.ready.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Metrics server error: {}", e);
                }
            });
        }

        if let Some(ref cluster) = self.cluster {
            cluster.start().await?;
        }

        self.controller.start();

        let event_loop = EventLoop {
            registry: self.registry.clone(),
            controller: self.controller.clone(),
            cluster: self.cluster.clone(),
        };
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(event_loop.run(binding_rx, cluster_rx, shutdown_rx));

        self.ready.store(true, Ordering::Release);
        info!(
            "RelayMQ node '{}' started (cluster={}, redistribution={}, load_balancing={})",
            self.node_id,
            self.cluster.is_some(),
            self.controller.is_enabled(),
            match self.config.queues.load_balancing {
                LoadBalancing::OnDemand => "on_demand",
                LoadBalancing::Off => "off",
            }
        );
        Ok(())
    }

    /// Stop background tasks and say Goodbye to peers
    pub async fn shutdown(&self) {
        info!("RelayMQ node '{}' shutting down", self.node_id);
        self.ready.store(false, Ordering::Release);
        let _ = self.shutdown.send(());
        if let Some(ref cluster) = self.cluster {
            cluster.stop().await;
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.membership
    }

    pub fn cluster(&self) -> Option<&Arc<ClusterManager>> {
        self.cluster.as_ref()
    }

    pub fn relay(&self) -> &BodyRelay {
        &self.relay
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Open a consumer session on this node
    pub fn create_session(&self) -> Session {
        Session::new(self.registry.clone())
    }

    /// Send a message to a queue. With on-demand load balancing the
    /// message may be placed on a peer that has consumers.
    pub async fn enqueue(&self, queue: &str, message: Message) -> Result<MessageId, QueueError> {
        self.balancer.enqueue(queue, message).await
    }

    /// Send a message whose body is read from a stream. Large bodies are
    /// spooled to disk and never held in memory.
    pub async fn enqueue_stream<R>(
        &self,
        queue: &str,
        properties: Properties,
        reader: R,
    ) -> Result<MessageId, BrokerError>
    where
        R: AsyncRead + Unpin,
    {
        crate::queue::validate_queue_name(queue)?;
        let body = self.relay.spool(reader).await?;
        let message = Message::new(body).with_properties(properties);
        Ok(self.enqueue(queue, message).await?)
    }
}

struct EventLoop {
    registry: Arc<BindingRegistry>,
    controller: RedistributionController,
    cluster: Option<Arc<ClusterManager>>,
}

impl EventLoop {
    async fn run(
        self,
        mut binding_events: mpsc::UnboundedReceiver<BindingEvent>,
        mut cluster_events: mpsc::UnboundedReceiver<ClusterEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(event) = binding_events.recv() => self.on_binding_event(event).await,
                Some(event) = cluster_events.recv() => self.on_cluster_event(event),
                else => break,
            }
        }
        debug!("Node event loop stopped");
    }

    async fn on_binding_event(&self, event: BindingEvent) {
        match event {
            BindingEvent::ConsumerCountChanged { queue, .. } => {
                if let Some(ref cluster) = self.cluster {
                    // Events may arrive out of order; advertise the current count
                    let count = self.registry.consumer_count(&queue);
                    cluster
                        .advertise(&queue, u32::try_from(count).unwrap_or(u32::MAX))
                        .await;
                }
            }
            BindingEvent::Stranded { queue } => self.controller.on_stranded(&queue),
        }
    }

    fn on_cluster_event(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::RemoteConsumers { queue } => self.controller.on_remote_consumers(&queue),
            ClusterEvent::PeerConnected { node_id } => {
                debug!("Peer '{}' connected, re-checking stranded bindings", node_id);
                self.controller.recheck_all();
            }
        }
    }
}
