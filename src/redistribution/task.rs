//! A single redistribution run: move a snapshot of stranded messages from
//! one binding to one target node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cluster::membership::MembershipView;
use crate::cluster::protocol::TransferKind;
use crate::message::{Message, MessageId};
use crate::metrics::Metrics;
use crate::queue::BindingRegistry;
use crate::remote::{RemoteError, RemotePeer};

/// Abort flag shared between a running task and its binding
#[derive(Debug)]
pub struct TaskControl {
    target: Arc<str>,
    aborted: AtomicBool,
}

impl TaskControl {
    pub fn new(target: impl Into<Arc<str>>) -> Self {
        Self {
            target: target.into(),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Arc<str> {
        &self.target
    }

    /// Stop the task before its next message
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Every message of the snapshot was handled
    Completed { sent: usize },
    /// A local consumer arrived; the unsent remainder stays local
    Aborted { sent: usize },
    /// The target stopped advertising consumers or became unreachable
    TargetLost { sent: usize },
    /// A send failed; the failed message was restored
    Failed { sent: usize, error: RemoteError },
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOutcome::Completed { .. } => "completed",
            TaskOutcome::Aborted { .. } => "aborted",
            TaskOutcome::TargetLost { .. } => "target_lost",
            TaskOutcome::Failed { .. } => "failed",
        }
    }

    pub fn sent(&self) -> usize {
        match self {
            TaskOutcome::Completed { sent }
            | TaskOutcome::Aborted { sent }
            | TaskOutcome::TargetLost { sent }
            | TaskOutcome::Failed { sent, .. } => *sent,
        }
    }
}

/// Default pause between resends of a transfer with an unknown outcome
const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Ordered transfer of stranded messages to one peer
pub struct RedistributionTask {
    queue: Arc<str>,
    message_ids: Vec<MessageId>,
    control: Arc<TaskControl>,
    resend_interval: Duration,
}

impl RedistributionTask {
    pub fn new(queue: Arc<str>, message_ids: Vec<MessageId>, control: Arc<TaskControl>) -> Self {
        Self {
            queue,
            message_ids,
            control,
            resend_interval: DEFAULT_RESEND_INTERVAL,
        }
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = super::timer_period(interval);
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn target(&self) -> &str {
        self.control.target()
    }

    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    /// Send the snapshot in FIFO order.
    ///
    /// Each message is taken out of the pending set right before its send
    /// and restored to its original position if the send fails. Messages
    /// that left the pending set since the snapshot are skipped.
    ///
    /// A send that fails after the whole transfer was written may have
    /// reached the peer. That message is never restored on an unknown
    /// outcome; it is resent to the same peer until the peer answers.
    pub async fn run(
        self,
        registry: &BindingRegistry,
        membership: &MembershipView,
        peer: &dyn RemotePeer,
        metrics: Option<&Metrics>,
    ) -> TaskOutcome {
        let target = self.control.target().clone();
        let mut sent = 0usize;

        for id in self.message_ids {
            if self.control.is_aborted() {
                debug!(
                    "Redistribution '{}': aborted after {} messages, local consumer attached",
                    self.queue, sent
                );
                return TaskOutcome::Aborted { sent };
            }
            if !membership.is_eligible(&target, &self.queue) {
                debug!(
                    "Redistribution '{}': node '{}' no longer has consumers",
                    self.queue, target
                );
                return TaskOutcome::TargetLost { sent };
            }

            let Some((seq, message)) = registry.take_for_transfer(&self.queue, id) else {
                continue;
            };

            match peer.send(&self.queue, &message, TransferKind::Redistribute).await {
                Ok(()) => {
                    sent += 1;
                    if let Some(metrics) = metrics {
                        metrics.message_redistributed();
                    }
                }
                Err(error) => {
                    warn!(
                        "Redistribution '{}': transfer of {} to '{}' failed: {}",
                        self.queue, id, target, error
                    );
                    if let Some(metrics) = metrics {
                        metrics.bridge_send_failed(error.reason());
                    }
                    if !error.is_indeterminate() {
                        registry.restore(&self.queue, seq, message);
                        return TaskOutcome::Failed { sent, error };
                    }
                    if let Err(error) =
                        resend(&self.queue, self.resend_interval, peer, &message, metrics).await
                    {
                        registry.restore(&self.queue, seq, message);
                        return TaskOutcome::Failed { sent, error };
                    }
                    sent += 1;
                    if let Some(metrics) = metrics {
                        metrics.message_redistributed();
                    }
                }
            }
        }

        TaskOutcome::Completed { sent }
    }
}

/// Resend a message whose transfer outcome is unknown until the peer
/// gives a verdict. The peer acknowledges an id it already owns, so only
/// a rejection proves it does not hold the message.
async fn resend(
    queue: &str,
    interval: Duration,
    peer: &dyn RemotePeer,
    message: &Message,
    metrics: Option<&Metrics>,
) -> Result<(), RemoteError> {
    let mut attempts = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        attempts += 1;
        match peer.send(queue, message, TransferKind::Redistribute).await {
            Ok(()) => {
                debug!(
                    "Redistribution '{}': {} confirmed by '{}' after {} resends",
                    queue,
                    message.id(),
                    peer.name(),
                    attempts
                );
                return Ok(());
            }
            Err(error @ RemoteError::Rejected(_)) => return Err(error),
            Err(error) => {
                if let Some(metrics) = metrics {
                    metrics.bridge_send_failed(error.reason());
                }
                if attempts % 10 == 0 {
                    error!(
                        "Redistribution '{}': {} held for '{}' after {} resends: {}",
                        queue,
                        message.id(),
                        peer.name(),
                        attempts,
                        error
                    );
                } else {
                    debug!(
                        "Redistribution '{}': resend of {} to '{}' failed: {}",
                        queue,
                        message.id(),
                        peer.name(),
                        error
                    );
                }
            }
        }
    }
}
