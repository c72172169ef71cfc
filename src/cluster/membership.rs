//! Cluster Membership View
//!
//! This node's picture of its peers: reachability, incarnation, the last
//! accepted consumer-count advertisement per queue, and how many
//! redistribution tasks currently target each peer.
//!
//! Advertisements are accepted only when their sequence number is strictly
//! greater than the last accepted one for the same (node, queue), so
//! reordered or replayed announcements never overwrite newer state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

/// Reachability of a peer as seen by its bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    Connected,
    Reconnecting,
    Down,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reachability::Connected => "connected",
            Reachability::Reconnecting => "reconnecting",
            Reachability::Down => "down",
        }
    }
}

/// Result of applying an advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementOutcome {
    Accepted,
    Stale,
}

#[derive(Debug, Clone, Copy)]
struct QueueAd {
    consumer_count: u32,
    seq: u64,
}

struct NodeEntry {
    reachability: Reachability,
    incarnation: u64,
    queues: HashMap<Arc<str>, QueueAd>,
    outstanding: Arc<AtomicUsize>,
    last_failure: Option<Instant>,
}

impl NodeEntry {
    fn new() -> Self {
        Self {
            reachability: Reachability::Reconnecting,
            incarnation: 0,
            queues: HashMap::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
            last_failure: None,
        }
    }
}

/// Snapshot of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub node_id: Arc<str>,
    pub reachability: Reachability,
    pub incarnation: u64,
    /// Last accepted (consumer_count, seq) per queue
    pub queues: Vec<(Arc<str>, u32, u64)>,
    pub outstanding_tasks: usize,
}

/// A peer eligible to receive messages for a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub node_id: Arc<str>,
    pub consumer_count: u32,
    pub outstanding_tasks: usize,
}

/// Per-node view of cluster peers
pub struct MembershipView {
    local_node_id: Arc<str>,
    nodes: RwLock<HashMap<Arc<str>, NodeEntry>>,
    failure_cooldown: Duration,
}

impl MembershipView {
    pub fn new(local_node_id: impl Into<Arc<str>>, failure_cooldown: Duration) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            nodes: RwLock::new(HashMap::new()),
            failure_cooldown,
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Make sure a node is tracked (e.g. from static configuration)
    pub fn add_node(&self, node_id: &str) {
        if node_id == &*self.local_node_id {
            return;
        }
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(node_id) {
            nodes.insert(Arc::from(node_id), NodeEntry::new());
        }
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        self.nodes.write().remove(node_id).is_some()
    }

    /// Apply a peer's consumer-count announcement for a queue
    pub fn on_advertisement(
        &self,
        node_id: &str,
        queue: &str,
        consumer_count: u32,
        seq: u64,
    ) -> AdvertisementOutcome {
        if node_id == &*self.local_node_id {
            return AdvertisementOutcome::Stale;
        }
        let mut nodes = self.nodes.write();
        let entry = nodes
            .entry(Arc::from(node_id))
            .or_insert_with(NodeEntry::new);

        match entry.queues.get_mut(queue) {
            Some(ad) if seq <= ad.seq => {
                debug!(
                    "Membership: stale advertisement from '{}' for '{}' (seq {} <= {})",
                    node_id, queue, seq, ad.seq
                );
                AdvertisementOutcome::Stale
            }
            Some(ad) => {
                *ad = QueueAd {
                    consumer_count,
                    seq,
                };
                AdvertisementOutcome::Accepted
            }
            None => {
                entry.queues.insert(
                    Arc::from(queue),
                    QueueAd {
                        consumer_count,
                        seq,
                    },
                );
                AdvertisementOutcome::Accepted
            }
        }
    }

    /// Record a handshake. A higher incarnation means the peer restarted:
    /// its sequence table is cleared so fresh sequence numbers are accepted.
    pub fn on_hello(&self, node_id: &str, incarnation: u64) {
        if node_id == &*self.local_node_id {
            return;
        }
        let mut nodes = self.nodes.write();
        let entry = nodes
            .entry(Arc::from(node_id))
            .or_insert_with(NodeEntry::new);
        if incarnation > entry.incarnation {
            if entry.incarnation != 0 {
                info!(
                    "Membership: node '{}' restarted (incarnation {} -> {})",
                    node_id, entry.incarnation, incarnation
                );
            }
            entry.incarnation = incarnation;
            entry.queues.clear();
        }
    }

    pub fn set_reachability(&self, node_id: &str, reachability: Reachability) {
        if node_id == &*self.local_node_id {
            return;
        }
        let mut nodes = self.nodes.write();
        let entry = nodes
            .entry(Arc::from(node_id))
            .or_insert_with(NodeEntry::new);
        if entry.reachability != reachability {
            debug!(
                "Membership: node '{}' is {}",
                node_id,
                reachability.as_str()
            );
            entry.reachability = reachability;
        }
    }

    pub fn reachability(&self, node_id: &str) -> Option<Reachability> {
        self.nodes.read().get(node_id).map(|e| e.reachability)
    }

    /// Last accepted consumer count a node advertised for a queue
    pub fn consumer_count(&self, node_id: &str, queue: &str) -> u32 {
        self.nodes
            .read()
            .get(node_id)
            .and_then(|e| e.queues.get(queue))
            .map(|ad| ad.consumer_count)
            .unwrap_or(0)
    }

    /// True if the node is connected and advertises consumers for the queue
    pub fn is_eligible(&self, node_id: &str, queue: &str) -> bool {
        let nodes = self.nodes.read();
        nodes.get(node_id).is_some_and(|e| {
            e.reachability == Reachability::Connected
                && e.queues.get(queue).is_some_and(|ad| ad.consumer_count > 0)
        })
    }

    /// Connected nodes advertising at least one consumer for the queue,
    /// least busy first, then by node id. Nodes that failed a transfer
    /// within the failure cooldown are left out.
    pub fn candidates_for(&self, queue: &str) -> Vec<Candidate> {
        let nodes = self.nodes.read();
        let mut candidates: Vec<Candidate> = nodes
            .iter()
            .filter(|(_, e)| e.reachability == Reachability::Connected)
            .filter(|(_, e)| {
                e.last_failure
                    .map_or(true, |at| at.elapsed() >= self.failure_cooldown)
            })
            .filter_map(|(id, e)| {
                let ad = e.queues.get(queue)?;
                (ad.consumer_count > 0).then(|| Candidate {
                    node_id: id.clone(),
                    consumer_count: ad.consumer_count,
                    outstanding_tasks: e.outstanding.load(Ordering::Relaxed),
                })
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.outstanding_tasks
                .cmp(&b.outstanding_tasks)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates
    }

    pub fn task_started(&self, node_id: &str) {
        if let Some(e) = self.nodes.read().get(node_id) {
            e.outstanding.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn task_finished(&self, node_id: &str) {
        if let Some(e) = self.nodes.read().get(node_id) {
            let _ = e
                .outstanding
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    pub fn outstanding_tasks(&self, node_id: &str) -> usize {
        self.nodes
            .read()
            .get(node_id)
            .map(|e| e.outstanding.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a failed transfer; the node sits out candidate selection for
    /// the failure cooldown
    pub fn record_failure(&self, node_id: &str) {
        if let Some(e) = self.nodes.write().get_mut(node_id) {
            e.last_failure = Some(Instant::now());
        }
    }

    /// Record a successful transfer
    pub fn record_success(&self, node_id: &str) {
        let mut nodes = self.nodes.write();
        if let Some(e) = nodes.get_mut(node_id) {
            e.last_failure = None;
        }
    }

    /// Snapshot of all known peers, sorted by node id
    pub fn nodes(&self) -> Vec<ClusterNode> {
        let nodes = self.nodes.read();
        let mut out: Vec<ClusterNode> = nodes
            .iter()
            .map(|(id, e)| {
                let mut queues: Vec<_> = e
                    .queues
                    .iter()
                    .map(|(q, ad)| (q.clone(), ad.consumer_count, ad.seq))
                    .collect();
                queues.sort();
                ClusterNode {
                    node_id: id.clone(),
                    reachability: e.reachability,
                    incarnation: e.incarnation,
                    queues,
                    outstanding_tasks: e.outstanding.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    pub fn connected_count(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|e| e.reachability == Reachability::Connected)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn view() -> MembershipView {
        MembershipView::new("local", Duration::from_secs(60))
    }

    fn connected(view: &MembershipView, nodes: &[&str]) {
        for node in nodes {
            view.set_reachability(node, Reachability::Connected);
        }
    }

    fn ids(candidates: &[Candidate]) -> Vec<&str> {
        candidates.iter().map(|c| &*c.node_id).collect()
    }

    #[test]
    fn test_only_strictly_newer_seq_accepted() {
        let v = view();
        assert_eq!(v.on_advertisement("a", "q", 2, 5), AdvertisementOutcome::Accepted);
        assert_eq!(v.on_advertisement("a", "q", 0, 5), AdvertisementOutcome::Stale);
        assert_eq!(v.on_advertisement("a", "q", 0, 4), AdvertisementOutcome::Stale);
        assert_eq!(v.consumer_count("a", "q"), 2);
        assert_eq!(v.on_advertisement("a", "q", 0, 6), AdvertisementOutcome::Accepted);
        assert_eq!(v.consumer_count("a", "q"), 0);
    }

    #[test]
    fn test_sequence_tracked_per_queue() {
        let v = view();
        v.on_advertisement("a", "q1", 1, 10);
        assert_eq!(v.on_advertisement("a", "q2", 1, 3), AdvertisementOutcome::Accepted);
    }

    #[test]
    fn test_candidates_require_connection_and_consumers() {
        let v = view();
        connected(&v, &["a", "b"]);
        v.set_reachability("c", Reachability::Down);
        v.on_advertisement("a", "q", 1, 1);
        v.on_advertisement("b", "q", 0, 1);
        v.on_advertisement("c", "q", 3, 1);
        assert_eq!(ids(&v.candidates_for("q")), vec!["a"]);
        assert!(v.candidates_for("other").is_empty());
    }

    #[test]
    fn test_candidates_ordered_by_load_then_id() {
        let v = view();
        connected(&v, &["c", "a", "b"]);
        for node in ["a", "b", "c"] {
            v.on_advertisement(node, "q", 1, 1);
        }
        assert_eq!(ids(&v.candidates_for("q")), vec!["a", "b", "c"]);

        v.task_started("a");
        v.task_started("a");
        v.task_started("b");
        assert_eq!(ids(&v.candidates_for("q")), vec!["c", "b", "a"]);

        v.task_finished("a");
        v.task_finished("a");
        v.task_finished("a");
        assert_eq!(v.outstanding_tasks("a"), 0);
    }

    #[test]
    fn test_failed_node_sits_out_cooldown() {
        let v = view();
        connected(&v, &["a", "b"]);
        v.on_advertisement("a", "q", 1, 1);
        v.on_advertisement("b", "q", 1, 1);

        v.record_failure("a");
        assert_eq!(ids(&v.candidates_for("q")), vec!["b"]);
        v.record_success("a");
        assert_eq!(ids(&v.candidates_for("q")), vec!["a", "b"]);
    }

    #[test]
    fn test_zero_cooldown_keeps_failed_node() {
        let v = MembershipView::new("local", Duration::ZERO);
        connected(&v, &["a"]);
        v.on_advertisement("a", "q", 1, 1);
        v.record_failure("a");
        assert_eq!(ids(&v.candidates_for("q")), vec!["a"]);
    }

    #[test]
    fn test_restart_resets_sequence_tracking() {
        let v = view();
        v.on_hello("a", 100);
        v.on_advertisement("a", "q", 1, 50);
        assert_eq!(v.on_advertisement("a", "q", 2, 1), AdvertisementOutcome::Stale);

        // Same incarnation again (reconnect) keeps the table
        v.on_hello("a", 100);
        assert_eq!(v.consumer_count("a", "q"), 1);

        v.on_hello("a", 200);
        assert_eq!(v.consumer_count("a", "q"), 0);
        assert_eq!(v.on_advertisement("a", "q", 2, 1), AdvertisementOutcome::Accepted);
    }

    #[test]
    fn test_local_node_ignored() {
        let v = view();
        v.set_reachability("local", Reachability::Connected);
        assert_eq!(
            v.on_advertisement("local", "q", 1, 1),
            AdvertisementOutcome::Stale
        );
        assert!(v.nodes().is_empty());
    }

    #[test]
    fn test_nodes_snapshot() {
        let v = view();
        v.add_node("b");
        connected(&v, &["a"]);
        v.on_hello("a", 7);
        v.on_advertisement("a", "q", 3, 9);

        let nodes = v.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(&*nodes[0].node_id, "a");
        assert_eq!(nodes[0].incarnation, 7);
        assert_eq!(nodes[0].queues, vec![(Arc::from("q"), 3, 9)]);
        assert_eq!(nodes[1].reachability, Reachability::Reconnecting);

        assert!(v.remove_node("b"));
        assert_eq!(v.connected_count(), 1);
    }

    proptest! {
        // Replaying any advertisement whose seq is not newer leaves the
        // candidate list unchanged.
        #[test]
        fn prop_stale_advertisements_have_no_effect(
            ads in proptest::collection::vec((0usize..3, 0u32..3, 1u64..20), 1..40),
            stale in proptest::collection::vec((0usize..3, 0u32..3), 1..10),
        ) {
            let nodes = ["a", "b", "c"];
            let v = view();
            connected(&v, &nodes);
            let mut max_seq = [0u64; 3];
            for (node, count, seq) in ads {
                v.on_advertisement(nodes[node], "q", count, seq);
                max_seq[node] = max_seq[node].max(seq);
            }

            let before = v.candidates_for("q");
            for (node, count) in stale {
                if max_seq[node] == 0 {
                    continue;
                }
                let outcome = v.on_advertisement(nodes[node], "q", count, max_seq[node]);
                prop_assert_eq!(outcome, AdvertisementOutcome::Stale);
            }
            prop_assert_eq!(v.candidates_for("q"), before);
        }
    }
}
