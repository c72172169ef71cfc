//! Redistribution Controller
//!
//! Moves stranded messages (pending on a binding that has no local
//! consumer) to a peer that advertises consumers for the same queue.
//!
//! Each binding gets one evaluator task, created on the first `Stranded`
//! event for its queue. An evaluator wakes when:
//! - the binding becomes stranded,
//! - a peer starts advertising consumers for the queue,
//! - the periodic re-check finds the binding still stranded.
//!
//! The evaluator claims the binding, snapshots its pending ids and runs a
//! [`RedistributionTask`] against the least busy candidate. It loops while
//! the binding stays stranded and an untried candidate exists.

mod task;

pub use task::{RedistributionTask, TaskControl, TaskOutcome};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::membership::MembershipView;
use crate::config::RedistributionConfig;
use crate::metrics::Metrics;
use crate::queue::{BindingRegistry, BindingState};
use crate::remote::PeerDirectory;

struct ControllerInner {
    registry: Arc<BindingRegistry>,
    membership: Arc<MembershipView>,
    peers: Arc<dyn PeerDirectory>,
    config: RedistributionConfig,
    evaluators: DashMap<Arc<str>, Arc<Notify>>,
    metrics: Option<Arc<Metrics>>,
    shutdown: broadcast::Sender<()>,
}

/// Watches stranded bindings and relocates their messages
#[derive(Clone)]
pub struct RedistributionController {
    inner: Arc<ControllerInner>,
}

impl RedistributionController {
    pub fn new(
        registry: Arc<BindingRegistry>,
        membership: Arc<MembershipView>,
        peers: Arc<dyn PeerDirectory>,
        config: RedistributionConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                registry,
                membership,
                peers,
                config,
                evaluators: DashMap::new(),
                metrics: None,
                shutdown,
            }),
        }
    }

    /// Attach metrics. Must be called before the controller is shared.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Start the periodic re-check of all bindings
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.enabled {
            info!("Redistribution disabled; stranded messages stay where they are");
            return None;
        }
        let controller = self.clone();
        let interval = timer_period(self.inner.config.recheck_interval);
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.recheck_all(),
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Redistribution re-check loop stopped");
        }))
    }

    /// A binding entered the stranded condition
    pub fn on_stranded(&self, queue: &str) {
        if !self.inner.config.enabled {
            return;
        }
        self.wake(queue);
    }

    /// A peer newly advertises consumers for a queue
    pub fn on_remote_consumers(&self, queue: &str) {
        if !self.inner.config.enabled {
            return;
        }
        if self.inner.registry.binding_state(queue) == Some(BindingState::Stranded) {
            self.wake(queue);
        }
    }

    /// Wake the evaluator of every binding that is still stranded
    pub fn recheck_all(&self) {
        for queue in self.inner.registry.queue_names() {
            if self.inner.registry.binding_state(&queue) == Some(BindingState::Stranded) {
                self.wake(&queue);
            }
        }
    }

    fn wake(&self, queue: &str) {
        if let Some(notify) = self.inner.evaluators.get(queue) {
            notify.notify_one();
            return;
        }
        let Some(binding) = self.inner.registry.get(queue) else {
            return;
        };
        let name = binding.name().clone();
        let notify = self
            .inner
            .evaluators
            .entry(name.clone())
            .or_insert_with(|| {
                let notify = Arc::new(Notify::new());
                self.spawn_evaluator(name.clone(), notify.clone());
                notify
            })
            .value()
            .clone();
        notify.notify_one();
    }

    fn spawn_evaluator(&self, queue: Arc<str>, notify: Arc<Notify>) {
        let inner = self.inner.clone();
        let mut shutdown_rx = inner.shutdown.subscribe();
        debug!("Redistribution '{}': evaluator started", queue);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown_rx.recv() => break,
                }
                tokio::select! {
                    _ = inner.evaluate(&queue) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Redistribution '{}': evaluator stopped", queue);
        });
    }
}

impl ControllerInner {
    fn record_outcome(&self, outcome: &TaskOutcome) {
        if let Some(ref metrics) = self.metrics {
            metrics.redistribution_task(outcome.as_str());
        }
    }

    /// Redistribute the binding's pending messages while it stays stranded
    async fn evaluate(&self, queue: &Arc<str>) {
        let mut tried: HashSet<Arc<str>> = HashSet::new();

        loop {
            let Some(binding) = self.registry.get(queue) else {
                return;
            };
            if binding.state() != BindingState::Stranded {
                return;
            }

            // Wait out the configured delay before acting
            if let Some(stranded_for) = binding.stranded_for() {
                if stranded_for < self.config.delay {
                    tokio::time::sleep(self.config.delay - stranded_for).await;
                    continue;
                }
            }

            let Some(target) = self
                .membership
                .candidates_for(queue)
                .into_iter()
                .find(|c| !tried.contains(&c.node_id))
            else {
                debug!(
                    "Redistribution '{}': no candidate node, {} messages stay stranded",
                    queue,
                    binding.pending_count()
                );
                return;
            };
            tried.insert(target.node_id.clone());

            let Some(peer) = self.peers.peer(&target.node_id) else {
                warn!(
                    "Redistribution '{}': no bridge to node '{}'",
                    queue, target.node_id
                );
                continue;
            };

            let control = Arc::new(TaskControl::new(target.node_id.clone()));
            let Some(ids) = binding.begin_task(control.clone()) else {
                return;
            };
            debug!(
                "Redistribution '{}': moving {} messages to '{}'",
                queue,
                ids.len(),
                target.node_id
            );

            self.membership.task_started(&target.node_id);
            let task = RedistributionTask::new(queue.clone(), ids, control.clone())
                .with_resend_interval(self.config.failure_cooldown);
            let outcome = task
                .run(
                    &self.registry,
                    &self.membership,
                    peer.as_ref(),
                    self.metrics.as_deref(),
                )
                .await;
            binding.finish_task(&control);
            self.membership.task_finished(&target.node_id);
            self.record_outcome(&outcome);

            match outcome {
                TaskOutcome::Completed { sent } => {
                    self.membership.record_success(&target.node_id);
                    if sent > 0 {
                        info!(
                            "Redistribution '{}': moved {} messages to '{}'",
                            queue, sent, target.node_id
                        );
                    }
                    // A completed target may take the follow-up as well
                    tried.remove(&target.node_id);
                }
                TaskOutcome::Aborted { sent } | TaskOutcome::TargetLost { sent } => {
                    debug!(
                        "Redistribution '{}': stopped after {} messages to '{}'",
                        queue, sent, target.node_id
                    );
                }
                TaskOutcome::Failed { sent, error } => {
                    self.membership.record_failure(&target.node_id);
                    warn!(
                        "Redistribution '{}': node '{}' failed after {} messages ({}), trying next candidate",
                        queue, target.node_id, sent, error
                    );
                }
            }
        }
    }
}

/// Clamp a configured interval to a usable timer period
pub(crate) fn timer_period(d: Duration) -> Duration {
    d.max(Duration::from_millis(10))
}
