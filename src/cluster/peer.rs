//! Cluster Peer
//!
//! The outbound bridge to another node. One connection task per peer
//! drains a single command channel, so transfers to a peer leave in
//! submission order. Each transfer resolves when the peer answers with
//! `TransferAck`/`TransferNack`, when the ack timeout expires, or when the
//! connection is lost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::relay::{BodyRelay, RelayError};
use crate::remote::{Advertisement, RemoteError, RemotePeer, RemotePeerStatus};

use super::manager::ClusterHandler;
use super::membership::{MembershipView, Reachability};
use super::protocol::{
    write_message, ClusterMessage, FrameReader, TransferKind, CLUSTER_PROTOCOL_VERSION,
};

/// Commands sent to the peer connection task
enum ClusterCommand {
    /// Relay a message and report the peer's verdict
    Transfer {
        queue: Arc<str>,
        message: Message,
        kind: TransferKind,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    },
    /// Send a consumer-count advertisement
    Advertise(Advertisement),
    /// Shutdown the connection
    Shutdown,
}

/// Latest local consumer-count advertisement per queue.
///
/// Sequence numbers come from one node-wide counter and are assigned while
/// the queue's entry is locked, so the stored advertisement is always the
/// newest one for that queue.
#[derive(Default)]
pub(crate) struct LocalAdvertisements {
    latest: DashMap<Arc<str>, Advertisement>,
    seq: AtomicU64,
}

impl LocalAdvertisements {
    /// Stamp a new advertisement for a queue
    pub(crate) fn record(&self, queue: &str, consumer_count: u32) -> Advertisement {
        let mut entry = self
            .latest
            .entry(Arc::from(queue))
            .or_insert_with(|| Advertisement {
                queue: Arc::from(queue),
                consumer_count,
                seq: 0,
            });
        entry.consumer_count = consumer_count;
        entry.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        entry.clone()
    }

    pub(crate) fn get(&self, queue: &str) -> Option<Advertisement> {
        self.latest.get(queue).map(|e| e.value().clone())
    }

    pub(crate) fn snapshot(&self) -> Vec<Advertisement> {
        self.latest.iter().map(|e| e.value().clone()).collect()
    }

    /// Re-stamp every tracked queue with a fresh sequence number
    pub(crate) fn refresh(&self) -> Vec<Advertisement> {
        let queues: Vec<(Arc<str>, u32)> = self
            .latest
            .iter()
            .map(|e| (e.key().clone(), e.value().consumer_count))
            .collect();
        queues
            .into_iter()
            .map(|(queue, count)| self.record(&queue, count))
            .collect()
    }
}

/// State shared by the cluster manager and every peer bridge
pub(crate) struct PeerContext {
    pub(crate) local_node_id: Arc<str>,
    pub(crate) incarnation: u64,
    pub(crate) config: ClusterConfig,
    pub(crate) membership: Arc<MembershipView>,
    pub(crate) relay: BodyRelay,
    pub(crate) advertisements: LocalAdvertisements,
    pub(crate) handler: Arc<dyn ClusterHandler>,
    pub(crate) metrics: Option<Arc<Metrics>>,
}

/// A connection to another cluster node
pub struct ClusterPeer {
    /// Remote node ID
    node_id: Arc<str>,
    /// Remote peer address for TCP connection
    peer_addr: SocketAddr,
    /// Current connection status
    status: Arc<RwLock<RemotePeerStatus>>,
    /// Command channel for sending operations to the connection task
    command_tx: Option<mpsc::Sender<ClusterCommand>>,
    ctx: Arc<PeerContext>,
}

impl ClusterPeer {
    pub(crate) fn new(node_id: &str, peer_addr: SocketAddr, ctx: Arc<PeerContext>) -> Self {
        Self {
            node_id: Arc::from(node_id),
            peer_addr,
            status: Arc::new(RwLock::new(RemotePeerStatus::Disconnected)),
            command_tx: None,
            ctx,
        }
    }

    /// Get the remote node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the peer address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Spawn the connection task and return the peer ready to use
    pub(crate) fn spawn(mut self) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1000);
        self.command_tx = Some(tx);

        let task = ConnectionTask {
            node_id: self.node_id.clone(),
            peer_addr: self.peer_addr,
            ctx: self.ctx.clone(),
            status: self.status.clone(),
            pending: HashMap::new(),
            next_transfer_id: 0,
            established: false,
        };

        tokio::spawn(task.connection_loop(rx));

        Arc::new(self)
    }
}

/// Where writing a transfer broke off
enum WriteFailure {
    /// Before the end marker; the peer cannot have completed the message
    Body(RelayError),
    /// While writing the end marker; the peer may have completed it
    EndMarker(std::io::Error),
}

/// A transfer whose body and end marker were written in full
struct PendingTransfer {
    reply: oneshot::Sender<Result<(), RemoteError>>,
    started: Instant,
    deadline: Instant,
    bytes: u64,
}

struct ConnectionTask {
    node_id: Arc<str>,
    peer_addr: SocketAddr,
    ctx: Arc<PeerContext>,
    status: Arc<RwLock<RemotePeerStatus>>,
    /// Transfers written to the socket and waiting for the peer's verdict
    pending: HashMap<u64, PendingTransfer>,
    next_transfer_id: u64,
    /// Set once the handshake of the current connection completed
    established: bool,
}

impl ConnectionTask {
    /// Run the connection loop with reconnection
    async fn connection_loop(mut self, mut command_rx: mpsc::Receiver<ClusterCommand>) {
        let base_retry = self.ctx.config.retry_interval;
        let max_retry = self.ctx.config.max_retry_interval;
        let max_attempts = self.ctx.config.max_reconnect_attempts.max(1);
        let mut retry_interval = base_retry;
        let mut failures = 0u32;

        loop {
            self.set_status(RemotePeerStatus::Connecting);
            debug!("ClusterPeer '{}': Connecting to {}", self.node_id, self.peer_addr);

            let result = self.connect_and_run(&mut command_rx).await;

            if std::mem::take(&mut self.established) {
                retry_interval = base_retry;
                failures = 0;
                if let Some(ref metrics) = self.ctx.metrics {
                    metrics.cluster_peer_disconnected();
                }
            }

            match result {
                Ok(()) => {
                    self.fail_pending(&RemoteError::ConnectionLost("Peer stopped".to_string()));
                    self.refuse_queued(&mut command_rx);
                    info!("ClusterPeer '{}': Disconnected gracefully", self.node_id);
                    self.set_status(RemotePeerStatus::Disconnected);
                    self.ctx
                        .membership
                        .set_reachability(&self.node_id, Reachability::Reconnecting);
                    return;
                }
                Err(e) => {
                    self.fail_pending(&e);
                    failures = failures.saturating_add(1);

                    if failures >= max_attempts {
                        if failures == max_attempts {
                            error!(
                                "ClusterPeer '{}': {} consecutive connection failures, marking down: {}",
                                self.node_id, failures, e
                            );
                        }
                        self.set_status(RemotePeerStatus::Down);
                        self.ctx
                            .membership
                            .set_reachability(&self.node_id, Reachability::Down);
                    } else {
                        warn!("ClusterPeer '{}': Connection failed: {}", self.node_id, e);
                        self.set_status(RemotePeerStatus::Backoff);
                        self.ctx
                            .membership
                            .set_reachability(&self.node_id, Reachability::Reconnecting);
                    }

                    debug!(
                        "ClusterPeer '{}': Reconnecting in {:?}",
                        self.node_id, retry_interval
                    );

                    if !self.backoff(retry_interval, &mut command_rx).await {
                        info!("ClusterPeer '{}': Shutdown requested", self.node_id);
                        self.refuse_queued(&mut command_rx);
                        self.set_status(RemotePeerStatus::Disconnected);
                        return;
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }
        }
    }

    /// Sleep before the next attempt, failing transfers fast meanwhile.
    /// Returns false when shutdown was requested.
    async fn backoff(
        &self,
        delay: Duration,
        command_rx: &mut mpsc::Receiver<ClusterCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = command_rx.recv() => match cmd {
                    Some(ClusterCommand::Transfer { reply, .. }) => {
                        let _ = reply.send(Err(RemoteError::Unreachable(self.node_id.to_string())));
                    }
                    // the latest advertisements are re-sent after reconnecting
                    Some(ClusterCommand::Advertise(_)) => {}
                    Some(ClusterCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        &mut self,
        command_rx: &mut mpsc::Receiver<ClusterCommand>,
    ) -> Result<(), RemoteError> {
        let ctx = self.ctx.clone();
        let config = &ctx.config;

        // Connect with timeout
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(self.peer_addr))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        debug!("ClusterPeer '{}': TCP connected", self.node_id);

        let (mut read_half, write_half) = stream.into_split();
        let mut writer = BufWriter::new(write_half);
        let mut reader = FrameReader::new(config.max_frame_size);

        let hello = ClusterMessage::Hello {
            node_id: self.ctx.local_node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
            incarnation: self.ctx.incarnation,
        };
        send_frame(&mut writer, &hello).await?;

        // Wait for HelloAck
        let reply = tokio::time::timeout(config.connect_timeout, reader.read_message(&mut read_half))
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;

        match reply {
            Some(ClusterMessage::HelloAck {
                node_id: peer_id,
                version,
                incarnation,
            }) => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RemoteError::Rejected(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                if peer_id != *self.node_id {
                    return Err(RemoteError::Rejected(format!(
                        "Expected node '{}', peer identifies as '{}'",
                        self.node_id, peer_id
                    )));
                }
                info!(
                    "ClusterPeer '{}': Connected (incarnation={})",
                    self.node_id, incarnation
                );
            }
            Some(other) => {
                return Err(RemoteError::Other(format!(
                    "Expected HelloAck, got {}",
                    other.type_name()
                )));
            }
            None => return Err(RemoteError::ConnectionLost("Connection closed".to_string())),
        }

        self.established = true;
        self.set_status(RemotePeerStatus::Connected);
        self.ctx
            .membership
            .set_reachability(&self.node_id, Reachability::Connected);
        if let Some(ref metrics) = self.ctx.metrics {
            metrics.cluster_peer_connected();
        }

        // Status is Connected before the snapshot, so any advertisement
        // recorded after it goes through the command channel
        let advertisements = self.ctx.advertisements.snapshot();
        for ad in &advertisements {
            write_message(&mut writer, &self.advertise_frame(ad))
                .await
                .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
        }
        flush(&mut writer).await?;
        debug!(
            "ClusterPeer '{}': Re-sent {} advertisements",
            self.node_id,
            advertisements.len()
        );

        self.ctx.handler.on_peer_connected(&self.node_id);

        // Message loop
        let mut ping_timer = tokio::time::interval(config.ping_interval);
        ping_timer.reset();
        let sweep_period = (config.ack_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut sweep_timer = tokio::time::interval(sweep_period);
        sweep_timer.reset();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(ClusterCommand::Transfer { queue, message, kind, reply }) => {
                        self.transfer(&mut writer, &queue, &message, kind, reply).await?;
                    }
                    Some(ClusterCommand::Advertise(ad)) => {
                        send_frame(&mut writer, &self.advertise_frame(&ad)).await?;
                    }
                    Some(ClusterCommand::Shutdown) | None => {
                        let _ = send_frame(&mut writer, &ClusterMessage::Goodbye).await;
                        return Ok(());
                    }
                },

                // Handle incoming messages from peer
                msg = reader.read_message(&mut read_half) => {
                    let msg = msg.map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
                    match msg {
                        Some(ClusterMessage::TransferAck { transfer_id }) => {
                            if let Some(p) = self.pending.remove(&transfer_id) {
                                if let Some(ref metrics) = self.ctx.metrics {
                                    metrics.transfer_completed(p.bytes, p.started.elapsed());
                                }
                                let _ = p.reply.send(Ok(()));
                            }
                        }
                        Some(ClusterMessage::TransferNack { transfer_id, reason }) => {
                            if let Some(p) = self.pending.remove(&transfer_id) {
                                warn!(
                                    "ClusterPeer '{}': Transfer {} rejected: {}",
                                    self.node_id, transfer_id, reason
                                );
                                let _ = p.reply.send(Err(RemoteError::Rejected(reason)));
                            }
                        }
                        Some(ClusterMessage::Ping) => {
                            send_frame(&mut writer, &ClusterMessage::Pong).await?;
                        }
                        Some(ClusterMessage::Pong) => {
                            debug!("ClusterPeer '{}': Pong received", self.node_id);
                        }
                        Some(ClusterMessage::Goodbye) => {
                            info!("ClusterPeer '{}': Received Goodbye", self.node_id);
                            return Err(RemoteError::ConnectionLost("Peer disconnected".to_string()));
                        }
                        Some(other) => {
                            debug!(
                                "ClusterPeer '{}': Ignoring unexpected {}",
                                self.node_id,
                                other.type_name()
                            );
                        }
                        None => {
                            return Err(RemoteError::ConnectionLost("Connection closed".to_string()));
                        }
                    }
                }

                // Send periodic ping
                _ = ping_timer.tick() => {
                    send_frame(&mut writer, &ClusterMessage::Ping).await?;
                }

                _ = sweep_timer.tick() => {
                    self.expire_pending();
                }
            }
        }
    }

    /// Write one transfer. Only a broken connection is returned as an
    /// error; every other outcome is reported through `reply`.
    async fn transfer<W>(
        &mut self,
        writer: &mut W,
        queue: &str,
        message: &Message,
        kind: TransferKind,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    ) -> Result<(), RemoteError>
    where
        W: AsyncWrite + Unpin,
    {
        self.next_transfer_id += 1;
        let transfer_id = self.next_transfer_id;
        let started = Instant::now();

        match self.write_transfer(writer, transfer_id, queue, message, kind).await {
            Ok(bytes) => {
                debug!(
                    "ClusterPeer '{}': Sent {} ({} bytes) for '{}' as transfer {}",
                    self.node_id,
                    message.id(),
                    bytes,
                    queue,
                    transfer_id
                );
                self.pending.insert(
                    transfer_id,
                    PendingTransfer {
                        reply,
                        started,
                        deadline: Instant::now() + self.ctx.config.ack_timeout,
                        bytes,
                    },
                );
                Ok(())
            }
            Err(WriteFailure::Body(RelayError::Sink(e))) => {
                error!("ClusterPeer '{}': TCP write error: {}", self.node_id, e);
                let err = RemoteError::ConnectionLost(e.to_string());
                let _ = reply.send(Err(err.clone()));
                Err(err)
            }
            Err(WriteFailure::EndMarker(e)) => {
                error!(
                    "ClusterPeer '{}': TCP write error finishing transfer {}: {}",
                    self.node_id, transfer_id, e
                );
                let _ = reply.send(Err(RemoteError::Indeterminate(e.to_string())));
                Err(RemoteError::ConnectionLost(e.to_string()))
            }
            Err(WriteFailure::Body(e)) => {
                warn!(
                    "ClusterPeer '{}': Transfer {} of {} aborted: {}",
                    self.node_id,
                    transfer_id,
                    message.id(),
                    e
                );
                let _ = reply.send(Err(RemoteError::from(e)));
                Ok(())
            }
        }
    }

    async fn write_transfer<W>(
        &self,
        writer: &mut W,
        transfer_id: u64,
        queue: &str,
        message: &Message,
        kind: TransferKind,
    ) -> Result<u64, WriteFailure>
    where
        W: AsyncWrite + Unpin,
    {
        let begin = ClusterMessage::TransferBegin {
            transfer_id,
            kind,
            queue: queue.to_string(),
            message_id: message.id(),
            properties: message.properties().clone(),
            delivery_count: message.delivery_count(),
            body_len: message.body().len(),
        };
        write_message(writer, &begin)
            .await
            .map_err(|e| WriteFailure::Body(RelayError::Sink(e)))?;

        match self
            .ctx
            .relay
            .relay_chunks(transfer_id, message.body(), writer)
            .await
        {
            Ok(bytes) => {
                write_message(writer, &ClusterMessage::BodyEnd { transfer_id })
                    .await
                    .map_err(WriteFailure::EndMarker)?;
                writer.flush().await.map_err(WriteFailure::EndMarker)?;
                Ok(bytes)
            }
            Err(RelayError::Sink(e)) => Err(WriteFailure::Body(RelayError::Sink(e))),
            Err(e) => {
                // The body source failed; the peer discards what it has
                let abort = ClusterMessage::TransferAbort {
                    transfer_id,
                    reason: e.to_string(),
                };
                write_message(writer, &abort)
                    .await
                    .map_err(|e| WriteFailure::Body(RelayError::Sink(e)))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| WriteFailure::Body(RelayError::Sink(e)))?;
                Err(WriteFailure::Body(e))
            }
        }
    }

    fn advertise_frame(&self, ad: &Advertisement) -> ClusterMessage {
        ClusterMessage::Advertise {
            node_id: self.ctx.local_node_id.to_string(),
            queue: ad.queue.to_string(),
            consumer_count: ad.consumer_count,
            seq: ad.seq,
        }
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for transfer_id in expired {
            if let Some(p) = self.pending.remove(&transfer_id) {
                warn!(
                    "ClusterPeer '{}': Transfer {} not acknowledged within {:?}",
                    self.node_id, transfer_id, self.ctx.config.ack_timeout
                );
                let _ = p.reply.send(Err(RemoteError::Indeterminate(format!(
                    "no acknowledgment within {:?}",
                    self.ctx.config.ack_timeout
                ))));
            }
        }
    }

    /// Every pending transfer was written in full, so losing the connection
    /// leaves its outcome unknown
    fn fail_pending(&mut self, err: &RemoteError) {
        for (_, p) in self.pending.drain() {
            let _ = p.reply.send(Err(RemoteError::Indeterminate(err.to_string())));
        }
    }

    /// Refuse transfers still queued when the task exits; none was written
    fn refuse_queued(&self, command_rx: &mut mpsc::Receiver<ClusterCommand>) {
        command_rx.close();
        while let Ok(cmd) = command_rx.try_recv() {
            if let ClusterCommand::Transfer { reply, .. } = cmd {
                let _ = reply.send(Err(RemoteError::Unreachable(self.node_id.to_string())));
            }
        }
    }

    fn set_status(&self, status: RemotePeerStatus) {
        *self.status.write() = status;
    }
}

async fn send_frame<W>(writer: &mut W, msg: &ClusterMessage) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
{
    write_message(writer, msg)
        .await
        .map_err(|e| RemoteError::ConnectionLost(e.to_string()))?;
    flush(writer).await
}

async fn flush<W>(writer: &mut W) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .flush()
        .await
        .map_err(|e| RemoteError::ConnectionLost(e.to_string()))
}

#[async_trait]
impl RemotePeer for ClusterPeer {
    fn name(&self) -> &str {
        &self.node_id
    }

    fn status(&self) -> RemotePeerStatus {
        *self.status.read()
    }

    async fn send(
        &self,
        queue: &str,
        message: &Message,
        kind: TransferKind,
    ) -> Result<(), RemoteError> {
        if self.status() != RemotePeerStatus::Connected {
            return Err(RemoteError::Unreachable(self.node_id.to_string()));
        }
        let Some(ref tx) = self.command_tx else {
            return Err(RemoteError::Unreachable(self.node_id.to_string()));
        };

        let (reply, verdict) = oneshot::channel();
        tx.send(ClusterCommand::Transfer {
            queue: Arc::from(queue),
            message: message.clone(),
            kind,
            reply,
        })
        .await
        .map_err(|_| RemoteError::ConnectionLost("Command channel closed".to_string()))?;

        verdict
            .await
            .unwrap_or_else(|_| Err(RemoteError::Indeterminate("Transfer dropped".to_string())))
    }

    async fn advertise(&self, advertisement: Advertisement) -> Result<(), RemoteError> {
        let Some(ref tx) = self.command_tx else {
            return Ok(());
        };
        match tx.try_send(ClusterCommand::Advertise(advertisement)) {
            Ok(()) => Ok(()),
            // A backed-up peer gets the latest state on the next heartbeat
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(
                    "ClusterPeer '{}': Command queue full, skipping advertisement",
                    self.node_id
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RemoteError::ConnectionLost(
                "Command channel closed".to_string(),
            )),
        }
    }

    async fn start(&self) -> Result<(), RemoteError> {
        info!("ClusterPeer '{}': Starting", self.node_id);
        Ok(())
    }

    async fn stop(&self) -> Result<(), RemoteError> {
        if let Some(ref tx) = self.command_tx {
            let _ = tx.send(ClusterCommand::Shutdown).await;
        }
        info!("ClusterPeer '{}': Stopped", self.node_id);
        Ok(())
    }
}
