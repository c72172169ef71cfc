//! Prometheus metrics for RelayMQ
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use std::time::Duration;

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

mod server;

pub use server::MetricsServer;

/// All RelayMQ metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Queue metrics
    pub messages_enqueued: IntCounter,
    pub messages_delivered: IntCounter,
    pub messages_redelivered: IntCounter,
    pub messages_acknowledged: IntCounter,
    pub bindings_stranded: IntGauge,

    // Redistribution metrics
    pub redistribution_tasks: IntCounterVec,
    pub messages_redistributed: IntCounter,
    pub messages_routed: IntCounter,

    // Cluster metrics
    pub cluster_peers_connected: IntGauge,
    pub cluster_messages_received: IntCounterVec,
    pub bridge_send_failures: IntCounterVec,
    pub advertisements: IntCounterVec,
    pub relayed_bytes: IntCounter,
    pub transfer_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // Queue metrics
        let messages_enqueued = IntCounter::with_opts(Opts::new(
            "relaymq_messages_enqueued_total",
            "Messages added to a local binding (producers and peers)",
        ))
        .unwrap();

        let messages_delivered = IntCounter::with_opts(Opts::new(
            "relaymq_messages_delivered_total",
            "Messages handed to local consumers",
        ))
        .unwrap();

        let messages_redelivered = IntCounter::with_opts(Opts::new(
            "relaymq_messages_redelivered_total",
            "Deliveries of messages that were delivered before",
        ))
        .unwrap();

        let messages_acknowledged = IntCounter::with_opts(Opts::new(
            "relaymq_messages_acknowledged_total",
            "Messages acknowledged by local consumers",
        ))
        .unwrap();

        let bindings_stranded = IntGauge::with_opts(Opts::new(
            "relaymq_bindings_stranded",
            "Bindings with pending messages and no local consumer",
        ))
        .unwrap();

        // Redistribution metrics
        let redistribution_tasks = IntCounterVec::new(
            Opts::new(
                "relaymq_redistribution_tasks_total",
                "Redistribution tasks by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let messages_redistributed = IntCounter::with_opts(Opts::new(
            "relaymq_messages_redistributed_total",
            "Stranded messages moved to a peer",
        ))
        .unwrap();

        let messages_routed = IntCounter::with_opts(Opts::new(
            "relaymq_messages_routed_total",
            "Producer messages forwarded to a peer by load balancing",
        ))
        .unwrap();

        // Cluster metrics
        let cluster_peers_connected = IntGauge::with_opts(Opts::new(
            "relaymq_cluster_peers_connected",
            "Peers with an established bridge connection",
        ))
        .unwrap();

        let cluster_messages_received = IntCounterVec::new(
            Opts::new(
                "relaymq_cluster_messages_received_total",
                "Messages received from peers by transfer kind",
            ),
            &["kind"],
        )
        .unwrap();

        let bridge_send_failures = IntCounterVec::new(
            Opts::new(
                "relaymq_bridge_send_failures_total",
                "Failed transfers to peers by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let advertisements = IntCounterVec::new(
            Opts::new(
                "relaymq_advertisements_received_total",
                "Consumer-count advertisements received by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let relayed_bytes = IntCounter::with_opts(Opts::new(
            "relaymq_relayed_bytes_total",
            "Body bytes streamed to peers",
        ))
        .unwrap();

        let transfer_latency = Histogram::with_opts(
            HistogramOpts::new(
                "relaymq_transfer_latency_seconds",
                "Time from transfer start to peer acknowledgment",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
            ]),
        )
        .unwrap();

        registry
            .register(Box::new(messages_enqueued.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_delivered.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_redelivered.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_acknowledged.clone()))
            .unwrap();
        registry
            .register(Box::new(bindings_stranded.clone()))
            .unwrap();
        registry
            .register(Box::new(redistribution_tasks.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_redistributed.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_routed.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_peers_connected.clone()))
            .unwrap();
        registry
            .register(Box::new(cluster_messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(bridge_send_failures.clone()))
            .unwrap();
        registry
            .register(Box::new(advertisements.clone()))
            .unwrap();
        registry
            .register(Box::new(relayed_bytes.clone()))
            .unwrap();
        registry
            .register(Box::new(transfer_latency.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_enqueued,
            messages_delivered,
            messages_redelivered,
            messages_acknowledged,
            bindings_stranded,
            redistribution_tasks,
            messages_redistributed,
            messages_routed,
            cluster_peers_connected,
            cluster_messages_received,
            bridge_send_failures,
            advertisements,
            relayed_bytes,
            transfer_latency,
        }
    }

    // Queue helpers

    pub fn message_enqueued(&self) {
        self.messages_enqueued.inc();
    }

    pub fn messages_delivered(&self, delivered: usize, redelivered: usize) {
        self.messages_delivered.inc_by(delivered as u64);
        self.messages_redelivered.inc_by(redelivered as u64);
    }

    pub fn message_acknowledged(&self) {
        self.messages_acknowledged.inc();
    }

    pub fn binding_stranded(&self) {
        self.bindings_stranded.inc();
    }

    pub fn binding_unstranded(&self) {
        self.bindings_stranded.dec();
    }

    // Redistribution helpers

    pub fn redistribution_task(&self, outcome: &str) {
        self.redistribution_tasks
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn message_redistributed(&self) {
        self.messages_redistributed.inc();
    }

    pub fn message_routed(&self) {
        self.messages_routed.inc();
    }

    // Cluster helpers

    pub fn cluster_peer_connected(&self) {
        self.cluster_peers_connected.inc();
    }

    pub fn cluster_peer_disconnected(&self) {
        self.cluster_peers_connected.dec();
    }

    pub fn cluster_message_received(&self, kind: &str) {
        self.cluster_messages_received
            .with_label_values(&[kind])
            .inc();
    }

    pub fn bridge_send_failed(&self, reason: &str) {
        self.bridge_send_failures
            .with_label_values(&[reason])
            .inc();
    }

    pub fn advertisement_received(&self, outcome: &str) {
        self.advertisements.with_label_values(&[outcome]).inc();
    }

    pub fn transfer_completed(&self, bytes: u64, elapsed: Duration) {
        self.relayed_bytes.inc_by(bytes);
        self.transfer_latency.observe(elapsed.as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
