//! Cluster bridge and manager tests over localhost TCP

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use super::peer::LocalAdvertisements;
use super::*;
use crate::config::RelayConfig;
use crate::message::Message;
use crate::queue::QueueError;
use crate::relay::{Body, BodyRelay};
use crate::remote::{PeerDirectory, RemoteError, RemotePeer, RemotePeerStatus};

#[derive(Default)]
struct RecordingHandler {
    transfers: Mutex<Vec<(String, String, Message, TransferKind)>>,
    remote_consumers: Mutex<Vec<String>>,
    connected: Mutex<Vec<String>>,
    reject: AtomicBool,
}

impl ClusterHandler for RecordingHandler {
    fn on_transfer(
        &self,
        from: &str,
        queue: &str,
        message: Message,
        kind: TransferKind,
    ) -> Result<(), QueueError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(QueueError::InvalidQueueName(queue.to_string()));
        }
        let mut transfers = self.transfers.lock();
        if transfers.iter().any(|(_, _, m, _)| m.id() == message.id()) {
            return Err(QueueError::Duplicate(message.id()));
        }
        transfers.push((from.to_string(), queue.to_string(), message, kind));
        Ok(())
    }

    fn on_remote_consumers(&self, queue: &str) {
        self.remote_consumers.lock().push(queue.to_string());
    }

    fn on_peer_connected(&self, node_id: &str) {
        self.connected.lock().push(node_id.to_string());
    }
}

struct TestNode {
    manager: ClusterManager,
    handler: Arc<RecordingHandler>,
    relay: BodyRelay,
    _spool: TempDir,
}

impl TestNode {
    fn addr(&self) -> SocketAddr {
        self.manager.local_addr().unwrap()
    }

    fn peer(&self, node_id: &str) -> Arc<dyn RemotePeer> {
        self.manager.peers().peer(node_id).unwrap()
    }
}

fn test_config() -> ClusterConfig {
    ClusterConfig {
        enabled: true,
        peer_addr: "127.0.0.1:0".parse().unwrap(),
        retry_interval: Duration::from_millis(20),
        max_retry_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(1),
        ack_timeout: Duration::from_secs(5),
        advertise_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn start_node(node_id: &str, tweak: impl FnOnce(&mut ClusterConfig)) -> TestNode {
    let spool = tempfile::tempdir().unwrap();
    let relay = BodyRelay::new(&RelayConfig {
        chunk_size: 1024,
        large_message_threshold: 4096,
        spool_dir: spool.path().to_path_buf(),
    });
    let mut config = test_config();
    tweak(&mut config);

    let handler = Arc::new(RecordingHandler::default());
    let membership = Arc::new(MembershipView::new(node_id, Duration::from_secs(60)));
    let manager = ClusterManager::new(
        node_id,
        config,
        relay.clone(),
        membership,
        handler.clone(),
        None,
    );
    manager.start().await.unwrap();

    TestNode {
        manager,
        handler,
        relay,
        _spool: spool,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

async fn connected_pair() -> (TestNode, TestNode) {
    let a = start_node("a", |_| {}).await;
    let b = start_node("b", |_| {}).await;
    assert!(a.manager.add_peer("b", b.addr()));
    let peer = a.peer("b");
    assert!(wait_until(|| peer.status() == RemotePeerStatus::Connected).await);
    (a, b)
}

fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[test]
fn test_local_advertisements_use_one_increasing_sequence() {
    let ads = LocalAdvertisements::default();
    assert_eq!(ads.record("orders", 1).seq, 1);
    assert_eq!(ads.record("invoices", 3).seq, 2);
    assert_eq!(ads.record("orders", 0).seq, 3);

    assert_eq!(ads.get("orders").unwrap().consumer_count, 0);

    let mut refreshed = ads.refresh();
    refreshed.sort_by(|a, b| a.queue.cmp(&b.queue));
    assert_eq!(refreshed.len(), 2);
    assert_eq!(&*refreshed[0].queue, "invoices");
    assert_eq!(refreshed[0].consumer_count, 3);
    assert!(refreshed.iter().all(|ad| ad.seq > 3));
}

#[tokio::test]
async fn test_transfer_is_acknowledged() {
    let (a, b) = connected_pair().await;

    let message = Message::new("hello").with_property("color", "red");
    a.peer("b")
        .send("orders", &message, TransferKind::Redistribute)
        .await
        .unwrap();

    let transfers = b.handler.transfers.lock();
    assert_eq!(transfers.len(), 1);
    let (from, queue, received, kind) = &transfers[0];
    assert_eq!(from, "a");
    assert_eq!(queue, "orders");
    assert_eq!(*kind, TransferKind::Redistribute);
    assert_eq!(received.id(), message.id());
    assert_eq!(received.string_property("color"), Some("red"));
    assert_eq!(&received.body().as_inline().unwrap()[..], b"hello");
    drop(transfers);

    assert_eq!(a.handler.connected.lock().clone(), vec!["b".to_string()]);
    let nodes = b.manager.membership().nodes();
    assert_eq!(&*nodes[0].node_id, "a");
    assert_eq!(nodes[0].incarnation, a.manager.incarnation());
}

#[tokio::test]
async fn test_large_body_is_spooled_on_receiver() {
    let (a, b) = connected_pair().await;

    let data: Vec<u8> = (0..20_000).map(|i| (i % 241) as u8).collect();
    let body = a.relay.spool(&data[..]).await.unwrap();
    assert!(body.is_large());
    let message = Message::new(body);

    a.peer("b")
        .send("orders", &message, TransferKind::Route)
        .await
        .unwrap();

    let received = b.handler.transfers.lock()[0].2.clone();
    let Body::Large(large) = received.body() else {
        panic!("expected a spooled body");
    };
    assert_eq!(large.len(), 20_000);
    let bytes = tokio::fs::read(large.path()).await.unwrap();
    assert_eq!(bytes, data);

    let mut saved = Vec::new();
    b.relay.copy_to(received.body(), &mut saved).await.unwrap();
    assert_eq!(saved, data);
}

#[tokio::test]
async fn test_refused_transfer_is_rejected() {
    let (a, b) = connected_pair().await;
    b.handler.reject.store(true, Ordering::SeqCst);

    let result = a
        .peer("b")
        .send("orders", &Message::new("x"), TransferKind::Redistribute)
        .await;
    assert!(matches!(result, Err(RemoteError::Rejected(_))));
    assert!(b.handler.transfers.lock().is_empty());
}

#[tokio::test]
async fn test_duplicate_transfer_is_acknowledged_once() {
    let (a, b) = connected_pair().await;
    let message = Message::new("once");
    let peer = a.peer("b");

    peer.send("orders", &message, TransferKind::Redistribute)
        .await
        .unwrap();
    peer.send("orders", &message, TransferKind::Redistribute)
        .await
        .unwrap();

    assert_eq!(b.handler.transfers.lock().len(), 1);
}

#[tokio::test]
async fn test_transfers_keep_submission_order() {
    let (a, b) = connected_pair().await;
    let peer = a.peer("b");

    let messages: Vec<Message> = (0..20).map(|i| Message::new(format!("m{}", i))).collect();
    let sends = messages
        .iter()
        .map(|m| peer.send("orders", m, TransferKind::Redistribute));
    for result in futures_util::future::join_all(sends).await {
        result.unwrap();
    }

    let received: Vec<_> = b
        .handler
        .transfers
        .lock()
        .iter()
        .map(|(_, _, m, _)| m.id())
        .collect();
    let sent: Vec<_> = messages.iter().map(|m| m.id()).collect();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_send_to_unreachable_peer_fails_fast() {
    let a = start_node("a", |_| {}).await;
    a.manager.add_peer("ghost", closed_port());

    let result = a
        .peer("ghost")
        .send("orders", &Message::new("x"), TransferKind::Redistribute)
        .await;
    assert!(matches!(result, Err(RemoteError::Unreachable(_))));
}

#[tokio::test]
async fn test_peer_marked_down_after_reconnect_attempts() {
    let a = start_node("a", |c| c.max_reconnect_attempts = 2).await;
    a.manager.add_peer("ghost", closed_port());
    let peer = a.peer("ghost");

    assert!(wait_until(|| peer.status() == RemotePeerStatus::Down).await);
    assert_eq!(
        a.manager.membership().reachability("ghost"),
        Some(Reachability::Down)
    );
}

#[tokio::test]
async fn test_add_peer_ignores_self_and_known_peers() {
    let a = start_node("a", |_| {}).await;
    assert!(!a.manager.add_peer("a", closed_port()));
    assert!(a.manager.add_peer("b", closed_port()));
    assert!(!a.manager.add_peer("b", closed_port()));
}

#[tokio::test]
async fn test_advertisements_reach_peer_and_are_resent_on_connect() {
    let a = start_node("a", |_| {}).await;
    let b = start_node("b", |_| {}).await;

    // Recorded before any peer is connected
    a.manager.advertise("orders", 2).await;
    a.manager.add_peer("b", b.addr());

    let membership = b.manager.membership().clone();
    assert!(wait_until(|| membership.consumer_count("a", "orders") == 2).await);
    assert_eq!(b.handler.remote_consumers.lock().clone(), vec!["orders".to_string()]);

    a.manager.advertise("orders", 0).await;
    assert!(wait_until(|| membership.consumer_count("a", "orders") == 0).await);
    assert_eq!(a.manager.advertisement("orders").unwrap().seq, 2);
}

/// Accept one connection, complete the handshake as `node_id`, then read
/// transfers and acknowledge each after `ack_delay`. Reports every fully
/// received transfer id on the returned channel.
async fn slow_acking_peer(
    node_id: &'static str,
    ack_delay: Duration,
) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<u64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        let mut reader = protocol::FrameReader::new(protocol::DEFAULT_MAX_FRAME_SIZE);
        let hello = reader.read_message(&mut read_half).await.unwrap();
        assert!(matches!(hello, Some(ClusterMessage::Hello { .. })));
        let ack = ClusterMessage::HelloAck {
            node_id: node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
            incarnation: 1,
        };
        protocol::write_message(&mut write_half, &ack).await.unwrap();
        write_half.flush().await.unwrap();

        while let Ok(Some(msg)) = reader.read_message(&mut read_half).await {
            if let ClusterMessage::BodyEnd { transfer_id } = msg {
                let _ = done_tx.send(transfer_id);
                tokio::time::sleep(ack_delay).await;
                let ack = ClusterMessage::TransferAck { transfer_id };
                if protocol::write_message(&mut write_half, &ack).await.is_err() {
                    return;
                }
                let _ = write_half.flush().await;
            }
        }
    });

    (addr, done_rx)
}

#[tokio::test]
async fn test_late_ack_leaves_outcome_indeterminate() {
    let (addr, mut completed) = slow_acking_peer("slow", Duration::from_millis(300)).await;

    let a = start_node("a", |c| c.ack_timeout = Duration::from_millis(100)).await;
    a.manager.add_peer("slow", addr);
    let peer = a.peer("slow");
    assert!(wait_until(|| peer.status() == RemotePeerStatus::Connected).await);

    let result = peer
        .send("orders", &Message::new("x"), TransferKind::Redistribute)
        .await;

    // The peer got the whole body, so the sender may not treat it as lost
    assert!(completed.try_recv().is_ok());
    assert!(matches!(result, Err(RemoteError::Indeterminate(_))));
    assert!(result.unwrap_err().is_indeterminate());
}

#[tokio::test]
async fn test_connection_loss_after_full_write_is_indeterminate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Takes the whole transfer, then hangs up without a verdict
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        let mut reader = protocol::FrameReader::new(protocol::DEFAULT_MAX_FRAME_SIZE);
        let _ = reader.read_message(&mut read_half).await.unwrap();
        let ack = ClusterMessage::HelloAck {
            node_id: "flaky".to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
            incarnation: 1,
        };
        protocol::write_message(&mut write_half, &ack).await.unwrap();
        write_half.flush().await.unwrap();
        while let Ok(Some(msg)) = reader.read_message(&mut read_half).await {
            if matches!(msg, ClusterMessage::BodyEnd { .. }) {
                return;
            }
        }
    });

    let a = start_node("a", |_| {}).await;
    a.manager.add_peer("flaky", addr);
    let peer = a.peer("flaky");
    assert!(wait_until(|| peer.status() == RemotePeerStatus::Connected).await);

    let result = peer
        .send("orders", &Message::new("x"), TransferKind::Redistribute)
        .await;
    assert!(matches!(result, Err(RemoteError::Indeterminate(_))));
}

#[tokio::test]
async fn test_inline_body_above_frame_limit_is_chunked() {
    let (a, b) = connected_pair().await;
    let data = vec![7u8; 5 * 1024 * 1024];
    assert!(data.len() > protocol::DEFAULT_MAX_FRAME_SIZE);
    let message = Message::new(data.clone());

    a.peer("b")
        .send("orders", &message, TransferKind::Redistribute)
        .await
        .unwrap();

    let transfers = b.handler.transfers.lock().clone();
    assert_eq!(transfers.len(), 1);
    let received = &transfers[0].2;
    assert_eq!(received.id(), message.id());
    assert!(received.body().is_large());

    let mut out = Vec::new();
    b.relay.copy_to(received.body(), &mut out).await.unwrap();
    assert!(out == data, "relayed body differs");
    assert_eq!(a.peer("b").status(), RemotePeerStatus::Connected);
}

#[tokio::test]
async fn test_broken_body_source_aborts_transfer_and_keeps_connection() {
    let (a, b) = connected_pair().await;
    let peer = a.peer("b");

    let body = a.relay.spool(&vec![3u8; 16 * 1024][..]).await.unwrap();
    match &body {
        Body::Large(large) => std::fs::write(large.path(), vec![3u8; 2000]).unwrap(),
        Body::Inline(_) => panic!("expected a spooled body"),
    }

    let result = peer
        .send("orders", &Message::new(body), TransferKind::Redistribute)
        .await;
    assert!(matches!(result, Err(RemoteError::RelayInterrupted(_))));
    assert!(b.handler.transfers.lock().is_empty());
    assert_eq!(peer.status(), RemotePeerStatus::Connected);

    // The partial transfer was discarded and the link still carries traffic
    peer.send("orders", &Message::new("next"), TransferKind::Redistribute)
        .await
        .unwrap();
    assert_eq!(b.handler.transfers.lock().len(), 1);
}

#[tokio::test]
async fn test_peer_with_unexpected_node_id_is_not_connected() {
    let b = start_node("b", |_| {}).await;
    let a = start_node("a", |_| {}).await;
    a.manager.add_peer("c", b.addr());
    let peer = a.peer("c");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ne!(peer.status(), RemotePeerStatus::Connected);
}

#[tokio::test]
async fn test_stop_sends_goodbye_and_fails_fast_afterwards() {
    let (a, _b) = connected_pair().await;
    let peer = a.peer("b");

    a.manager.stop().await;
    assert!(wait_until(|| peer.status() == RemotePeerStatus::Disconnected).await);

    let result = peer
        .send("orders", &Message::new("x"), TransferKind::Redistribute)
        .await;
    assert!(matches!(result, Err(RemoteError::Unreachable(_))));
}
