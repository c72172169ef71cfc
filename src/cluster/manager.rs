//! Cluster Manager
//!
//! Owns the peer listener, the outbound bridges and the local
//! advertisement bookkeeping of a RelayMQ node.
//!
//! Every pair of nodes uses two TCP connections: a node's outbound bridge
//! carries its transfers and advertisements, and the peer's inbound
//! handler answers them. Peers come from the static `cluster.peers` list
//! and, when seeds are configured, from chitchat gossip.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use parking_lot::Mutex;
use tokio::io::BufWriter;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::message::{Message, MessageId, Properties};
use crate::metrics::Metrics;
use crate::queue::QueueError;
use crate::relay::{BodyAssembler, BodyRelay};
use crate::remote::{Advertisement, RemotePeers};

use super::membership::{AdvertisementOutcome, MembershipView};
use super::peer::{ClusterPeer, LocalAdvertisements, PeerContext};
use super::protocol::{write_message, ClusterMessage, FrameReader, TransferKind, CLUSTER_PROTOCOL_VERSION};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Receives what peers send to this node
pub trait ClusterHandler: Send + Sync {
    /// A complete message arrived from `from`. `Ok` and
    /// `QueueError::Duplicate` are acknowledged, anything else is refused.
    fn on_transfer(
        &self,
        from: &str,
        queue: &str,
        message: Message,
        kind: TransferKind,
    ) -> Result<(), QueueError>;

    /// A peer newly advertised consumers for a queue
    fn on_remote_consumers(&self, queue: &str);

    /// The outbound bridge to a peer completed its handshake
    fn on_peer_connected(&self, node_id: &str);
}

/// Cluster manager for peer connections and advertisements
pub struct ClusterManager {
    /// Our node ID
    node_id: Arc<str>,
    /// Cluster configuration
    config: ClusterConfig,
    ctx: Arc<PeerContext>,
    /// Outbound bridges by node id
    peers: Arc<RemotePeers>,
    /// Chitchat handle, when gossip discovery is enabled
    chitchat: Mutex<Option<ChitchatHandle>>,
    /// Address the peer listener is bound to
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: broadcast::Sender<()>,
}

impl ClusterManager {
    pub fn new(
        node_id: &str,
        config: ClusterConfig,
        relay: BodyRelay,
        membership: Arc<MembershipView>,
        handler: Arc<dyn ClusterHandler>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let node_id: Arc<str> = Arc::from(node_id);
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1);

        let ctx = Arc::new(PeerContext {
            local_node_id: node_id.clone(),
            incarnation,
            config: config.clone(),
            membership,
            relay,
            advertisements: LocalAdvertisements::default(),
            handler,
            metrics,
        });
        let (shutdown, _) = broadcast::channel(1);

        Self {
            node_id,
            config,
            ctx,
            peers: Arc::new(RemotePeers::new()),
            chitchat: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown,
        }
    }

    /// Get our node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start time of this process, sent in handshakes
    pub fn incarnation(&self) -> u64 {
        self.ctx.incarnation
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.ctx.membership
    }

    /// Outbound bridges, also usable as a `PeerDirectory`
    pub fn peers(&self) -> Arc<RemotePeers> {
        self.peers.clone()
    }

    /// Address the peer listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Get the number of connected peers
    pub fn connected_peer_count(&self) -> usize {
        self.peers.connected_count()
    }

    /// Latest advertisement sent for a queue
    pub fn advertisement(&self, queue: &str) -> Option<Advertisement> {
        self.ctx.advertisements.get(queue)
    }

    /// Announce a local consumer count for a queue to all connected peers
    pub async fn advertise(&self, queue: &str, consumer_count: u32) {
        let ad = self.ctx.advertisements.record(queue, consumer_count);
        debug!(
            "Cluster: advertising '{}' count={} seq={}",
            queue, ad.consumer_count, ad.seq
        );
        self.peers.advertise_all(&ad).await;
    }

    /// Add an outbound bridge to a peer. Returns false for ourselves or a
    /// peer that is already known.
    pub fn add_peer(&self, node_id: &str, addr: SocketAddr) -> bool {
        connect_peer(&self.ctx, &self.peers, node_id, addr)
    }

    /// Start the cluster manager background tasks
    pub async fn start(&self) -> Result<(), BoxError> {
        // Spawn peer listener (accepts incoming TCP connections from other nodes)
        let listener = TcpListener::bind(self.config.peer_addr).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);
        info!("Cluster manager '{}' listening for peers on {}", self.node_id, bound);

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            peer_listener_loop(listener, ctx, shutdown).await;
        });

        for peer in &self.config.peers {
            self.add_peer(&peer.id, peer.addr);
        }
        for (name, result) in self.peers.start_all().await {
            if let Err(e) = result {
                warn!("Cluster: starting peer '{}' failed: {}", name, e);
            }
        }

        if self.config.gossip_enabled() {
            let handle = self.start_gossip().await?;
            let chitchat = handle.chitchat();
            *self.chitchat.lock() = Some(handle);

            let ctx = self.ctx.clone();
            let peers = self.peers.clone();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                gossip_watcher_loop(chitchat, ctx, peers, shutdown).await;
            });
        }

        let ctx = self.ctx.clone();
        let peers = self.peers.clone();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            heartbeat_loop(ctx, peers, shutdown).await;
        });

        Ok(())
    }

    async fn start_gossip(&self) -> Result<ChitchatHandle, BoxError> {
        let gossip_advertise_addr = self.config.get_gossip_advertise_addr();
        let bound_port = self
            .local_addr()
            .map_or(self.config.peer_addr.port(), |addr| addr.port());
        let peer_advertise_addr = self.config.peer_advertise_addr.unwrap_or_else(|| {
            SocketAddr::new(self.config.get_peer_advertise_addr().ip(), bound_port)
        });

        info!(
            "Starting gossip for node {} (gossip_advertise={}, peer_advertise={})",
            self.node_id, gossip_advertise_addr, peer_advertise_addr
        );

        // The incarnation doubles as chitchat generation, so a restarted
        // node replaces its old gossip state
        let chitchat_id = ChitchatId::new(
            self.node_id.to_string(),
            self.ctx.incarnation,
            gossip_advertise_addr,
        );

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: self.config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: "relaymq".to_string(),
            gossip_interval: self.config.gossip_interval,
            listen_addr: self.config.gossip_addr,
            seed_nodes: self.config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: self.config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let initial_kvs = vec![(KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string())];

        let handle = spawn_chitchat(chitchat_config, initial_kvs, &transport).await?;
        Ok(handle)
    }

    /// Stop the cluster manager. Outbound bridges say Goodbye.
    pub async fn stop(&self) {
        info!("Stopping cluster manager '{}'", self.node_id);
        let _ = self.shutdown.send(());

        for (name, result) in self.peers.stop_all().await {
            if let Err(e) = result {
                debug!("Cluster: stopping peer '{}' failed: {}", name, e);
            }
        }

        // Chitchat stops when its handle is dropped
        let handle = self.chitchat.lock().take();
        drop(handle);
    }
}

fn connect_peer(
    ctx: &Arc<PeerContext>,
    peers: &RemotePeers,
    node_id: &str,
    addr: SocketAddr,
) -> bool {
    if node_id == &*ctx.local_node_id || peers.contains(node_id) {
        return false;
    }
    info!("Cluster: adding peer '{}' at {}", node_id, addr);
    ctx.membership.add_node(node_id);
    let peer = ClusterPeer::new(node_id, addr, ctx.clone()).spawn();
    peers.add(peer);
    true
}

/// Listen for incoming peer connections
async fn peer_listener_loop(
    listener: TcpListener,
    ctx: Arc<PeerContext>,
    shutdown: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Cluster peer listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Incoming cluster peer connection from {}", addr);
                    let ctx = ctx.clone();
                    let shutdown_rx = shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_incoming_peer(stream, ctx, shutdown_rx).await {
                            debug!("Incoming peer connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept peer connection: {}", e);
                }
            }
        }
    }
}

/// A transfer whose body is still arriving
struct InboundTransfer {
    kind: TransferKind,
    queue: String,
    message_id: MessageId,
    properties: Properties,
    delivery_count: u32,
    body: BodyAssembler,
}

/// Handle an incoming peer connection
async fn handle_incoming_peer(
    stream: TcpStream,
    ctx: Arc<PeerContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), BoxError> {
    let _ = stream.set_nodelay(true);
    let (mut read_half, write_half) = stream.into_split();
    let mut writer = BufWriter::new(write_half);
    let mut reader = FrameReader::new(ctx.config.max_frame_size);

    // Wait for Hello
    let hello = tokio::time::timeout(
        ctx.config.connect_timeout,
        reader.read_message(&mut read_half),
    )
    .await??;

    let (peer_id, incarnation) = match hello {
        Some(ClusterMessage::Hello {
            node_id,
            version,
            incarnation,
        }) => {
            if version != CLUSTER_PROTOCOL_VERSION {
                return Err(format!(
                    "Protocol version mismatch: {} vs {}",
                    version, CLUSTER_PROTOCOL_VERSION
                )
                .into());
            }
            (node_id, incarnation)
        }
        Some(other) => return Err(format!("Expected Hello, got {}", other.type_name()).into()),
        None => return Err("Connection closed".into()),
    };

    if peer_id == *ctx.local_node_id {
        return Err("Peer uses our own node id".into());
    }

    ctx.membership.on_hello(&peer_id, incarnation);

    let ack = ClusterMessage::HelloAck {
        node_id: ctx.local_node_id.to_string(),
        version: CLUSTER_PROTOCOL_VERSION,
        incarnation: ctx.incarnation,
    };
    send(&mut writer, &ack).await?;

    info!("Incoming cluster peer: {}", peer_id);

    let mut transfers: HashMap<u64, InboundTransfer> = HashMap::new();

    loop {
        let msg = tokio::select! {
            _ = shutdown.recv() => {
                let _ = send(&mut writer, &ClusterMessage::Goodbye).await;
                return Ok(());
            }
            msg = reader.read_message(&mut read_half) => msg?,
        };

        let Some(msg) = msg else {
            info!("Cluster peer '{}' disconnected", peer_id);
            return Ok(());
        };

        match msg {
            ClusterMessage::Advertise {
                node_id,
                queue,
                consumer_count,
                seq,
            } => {
                if node_id != peer_id {
                    warn!(
                        "Cluster peer '{}' advertised on behalf of '{}', ignoring",
                        peer_id, node_id
                    );
                    continue;
                }
                let outcome = ctx
                    .membership
                    .on_advertisement(&node_id, &queue, consumer_count, seq);
                if let Some(ref metrics) = ctx.metrics {
                    metrics.advertisement_received(match outcome {
                        AdvertisementOutcome::Accepted => "accepted",
                        AdvertisementOutcome::Stale => "stale",
                    });
                }
                if outcome == AdvertisementOutcome::Accepted && consumer_count > 0 {
                    ctx.handler.on_remote_consumers(&queue);
                }
            }
            ClusterMessage::TransferBegin {
                transfer_id,
                kind,
                queue,
                message_id,
                properties,
                delivery_count,
                body_len,
            } => match ctx.relay.assembler(body_len).await {
                Ok(body) => {
                    transfers.insert(
                        transfer_id,
                        InboundTransfer {
                            kind,
                            queue,
                            message_id,
                            properties,
                            delivery_count,
                            body,
                        },
                    );
                }
                Err(e) => {
                    warn!(
                        "Cluster peer '{}': cannot accept transfer {}: {}",
                        peer_id, transfer_id, e
                    );
                    let nack = ClusterMessage::TransferNack {
                        transfer_id,
                        reason: e.to_string(),
                    };
                    send(&mut writer, &nack).await?;
                }
            },
            ClusterMessage::BodyChunk { transfer_id, data } => {
                let Some(transfer) = transfers.get_mut(&transfer_id) else {
                    // already refused
                    continue;
                };
                if let Err(e) = transfer.body.push(&data).await {
                    transfers.remove(&transfer_id);
                    warn!(
                        "Cluster peer '{}': transfer {} failed: {}",
                        peer_id, transfer_id, e
                    );
                    let nack = ClusterMessage::TransferNack {
                        transfer_id,
                        reason: e.to_string(),
                    };
                    send(&mut writer, &nack).await?;
                }
            }
            ClusterMessage::BodyEnd { transfer_id } => {
                let Some(transfer) = transfers.remove(&transfer_id) else {
                    continue;
                };
                let reply = complete_transfer(&ctx, &peer_id, transfer_id, transfer).await;
                send(&mut writer, &reply).await?;
            }
            ClusterMessage::TransferAbort {
                transfer_id,
                reason,
            } => {
                if transfers.remove(&transfer_id).is_some() {
                    debug!(
                        "Cluster peer '{}' aborted transfer {}: {}",
                        peer_id, transfer_id, reason
                    );
                }
            }
            ClusterMessage::Ping => {
                send(&mut writer, &ClusterMessage::Pong).await?;
            }
            ClusterMessage::Pong => {}
            ClusterMessage::Goodbye => {
                info!("Cluster peer '{}' said goodbye", peer_id);
                return Ok(());
            }
            other => {
                debug!(
                    "Cluster peer '{}': unexpected {} on inbound connection",
                    peer_id,
                    other.type_name()
                );
            }
        }
    }
}

/// Finish an inbound body and hand the message to the node
async fn complete_transfer(
    ctx: &PeerContext,
    peer_id: &str,
    transfer_id: u64,
    transfer: InboundTransfer,
) -> ClusterMessage {
    let body = match transfer.body.finish().await {
        Ok(body) => body,
        Err(e) => {
            warn!(
                "Cluster peer '{}': transfer {} incomplete: {}",
                peer_id, transfer_id, e
            );
            return ClusterMessage::TransferNack {
                transfer_id,
                reason: e.to_string(),
            };
        }
    };

    let mut message =
        Message::with_id(transfer.message_id, body).with_properties(transfer.properties);
    message.set_delivery_count(transfer.delivery_count);

    if let Some(ref metrics) = ctx.metrics {
        metrics.cluster_message_received(transfer.kind.as_str());
    }

    match ctx
        .handler
        .on_transfer(peer_id, &transfer.queue, message, transfer.kind)
    {
        Ok(()) => ClusterMessage::TransferAck { transfer_id },
        Err(QueueError::Duplicate(id)) => {
            debug!(
                "Cluster peer '{}': {} already queued on '{}'",
                peer_id, id, transfer.queue
            );
            ClusterMessage::TransferAck { transfer_id }
        }
        Err(e) => ClusterMessage::TransferNack {
            transfer_id,
            reason: e.to_string(),
        },
    }
}

async fn send(
    writer: &mut BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    msg: &ClusterMessage,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    write_message(writer, msg).await?;
    writer.flush().await
}

/// Re-advertise every tracked queue with fresh sequence numbers
async fn heartbeat_loop(
    ctx: Arc<PeerContext>,
    peers: Arc<RemotePeers>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(ctx.config.advertise_interval);
    interval.reset();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                let ads = ctx.advertisements.refresh();
                for ad in &ads {
                    peers.advertise_all(ad).await;
                }
            }
        }
    }
}

/// Watch gossip state for new peers and connect to them
async fn gossip_watcher_loop(
    chitchat: Arc<tokio::sync::Mutex<chitchat::Chitchat>>,
    ctx: Arc<PeerContext>,
    peers: Arc<RemotePeers>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut known_nodes: HashSet<String> = HashSet::new();
    let mut interval = tokio::time::interval(ctx.config.gossip_interval);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }

        // Get current cluster state
        let cluster_state = {
            let cc = chitchat.lock().await;
            cc.state_snapshot()
        };

        // Find new nodes
        for node_state in &cluster_state.node_states {
            let node_id = node_state.chitchat_id().node_id.clone();

            // Skip ourselves
            if node_id == *ctx.local_node_id || known_nodes.contains(&node_id) {
                continue;
            }

            let Some(peer_addr) = node_state
                .get(KEY_PEER_ADDR)
                .and_then(|s| s.parse::<SocketAddr>().ok())
            else {
                continue;
            };

            // Statically configured peers are never removed by gossip
            if connect_peer(&ctx, &peers, &node_id, peer_addr) {
                info!(
                    "Discovered new cluster peer: {} at peer={} gossip={}",
                    node_id,
                    peer_addr,
                    node_state.chitchat_id().gossip_advertise_addr
                );
                known_nodes.insert(node_id);
            }
        }

        // Remove dead nodes
        let current_nodes: HashSet<&str> = cluster_state
            .node_states
            .iter()
            .map(|ns| ns.chitchat_id().node_id.as_str())
            .collect();

        let dead_nodes: Vec<String> = known_nodes
            .iter()
            .filter(|n| !current_nodes.contains(n.as_str()))
            .cloned()
            .collect();

        for node_id in dead_nodes {
            info!("Cluster peer '{}' left the cluster", node_id);
            known_nodes.remove(&node_id);
            if let Some(peer) = peers.remove(&node_id) {
                let _ = peer.stop().await;
            }
            ctx.membership.remove_node(&node_id);
        }
    }
}
