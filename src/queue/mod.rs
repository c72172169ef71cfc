//! Binding Registry
//!
//! Per-node record of queue bindings: which local consumers each queue has
//! and which messages are waiting for them. This is the source of truth for
//! "does this node currently have a consumer for queue Q".
//!
//! Bindings are created on first use. Consumer-count changes and entries
//! into the stranded condition are published as [`BindingEvent`]s for the
//! node event loop, which advertises counts to peers and wakes the
//! redistribution controller.

mod binding;
mod consumer;
pub mod distributor;

pub use binding::{BindingState, ConsumerId, ConsumerRegistration, QueueBinding, Transition};
pub use consumer::{Consumer, Delivery, Session};
pub use distributor::Distributor;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::{Message, MessageId};
use crate::metrics::Metrics;
use crate::redistribution::TaskControl;

/// Maximum queue name length in bytes
pub const MAX_QUEUE_NAME_LEN: usize = 255;

/// Errors from queue operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Queue name is empty, too long, or contains whitespace/control characters
    InvalidQueueName(String),
    /// The binding already owns a message with this id
    Duplicate(MessageId),
    /// The acknowledging consumer does not hold the message
    NotOwner { id: MessageId, consumer: ConsumerId },
    /// The message is not delivered on this binding
    UnknownMessage(MessageId),
    /// The consumer or session has been closed
    ConsumerClosed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::InvalidQueueName(name) => write!(f, "Invalid queue name: {:?}", name),
            QueueError::Duplicate(id) => write!(f, "Message {} already queued", id),
            QueueError::NotOwner { id, consumer } => {
                write!(f, "Message {} is not held by consumer {}", id, consumer)
            }
            QueueError::UnknownMessage(id) => write!(f, "Message {} is not in flight", id),
            QueueError::ConsumerClosed => write!(f, "Consumer closed"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Validate a queue name
pub fn validate_queue_name(name: &str) -> Result<(), QueueError> {
    if name.is_empty()
        || name.len() > MAX_QUEUE_NAME_LEN
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(QueueError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

/// Events published by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingEvent {
    /// The local consumer count of a queue changed
    ConsumerCountChanged { queue: Arc<str>, count: usize },
    /// A binding has pending messages and no local consumer
    Stranded { queue: Arc<str> },
}

/// Registry of all queue bindings on this node
pub struct BindingRegistry {
    bindings: DashMap<Arc<str>, Arc<QueueBinding>>,
    events: mpsc::UnboundedSender<BindingEvent>,
    next_consumer_id: AtomicU64,
    next_session_id: AtomicU64,
    consumer_window: usize,
    metrics: Option<Arc<Metrics>>,
}

impl BindingRegistry {
    pub fn new(consumer_window: usize, events: mpsc::UnboundedSender<BindingEvent>) -> Self {
        Self {
            bindings: DashMap::new(),
            events,
            next_consumer_id: AtomicU64::new(1),
            next_session_id: AtomicU64::new(1),
            consumer_window: consumer_window.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn consumer_window(&self) -> usize {
        self.consumer_window
    }

    pub(crate) fn next_consumer_id(&self) -> ConsumerId {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get or create the binding for a queue
    pub fn binding(&self, queue: &str) -> Result<Arc<QueueBinding>, QueueError> {
        if let Some(binding) = self.bindings.get(queue) {
            return Ok(binding.value().clone());
        }
        validate_queue_name(queue)?;
        let name: Arc<str> = Arc::from(queue);
        let binding = self
            .bindings
            .entry(name.clone())
            .or_insert_with(|| {
                debug!("Creating binding for queue '{}'", name);
                Arc::new(QueueBinding::new(name))
            })
            .value()
            .clone();
        Ok(binding)
    }

    /// Get an existing binding
    pub fn get(&self, queue: &str) -> Option<Arc<QueueBinding>> {
        self.bindings.get(queue).map(|b| b.value().clone())
    }

    /// Names of all known queues
    pub fn queue_names(&self) -> Vec<Arc<str>> {
        self.bindings.iter().map(|b| b.key().clone()).collect()
    }

    /// Publish events and metrics for a binding transition
    fn apply(&self, queue: &Arc<str>, t: Transition) {
        if let Some(count) = t.consumer_count {
            let _ = self.events.send(BindingEvent::ConsumerCountChanged {
                queue: queue.clone(),
                count,
            });
        }
        if t.became_stranded {
            debug!("Queue '{}' is stranded", queue);
            let _ = self.events.send(BindingEvent::Stranded {
                queue: queue.clone(),
            });
        }
        if let Some(ref metrics) = self.metrics {
            if t.became_stranded {
                metrics.binding_stranded();
            }
            if t.left_stranded {
                metrics.binding_unstranded();
            }
            if t.delivered > 0 {
                metrics.messages_delivered(t.delivered, t.redelivered);
            }
        }
    }

    /// Attach a local consumer to a queue
    pub fn add_consumer(&self, queue: &str, reg: ConsumerRegistration) -> Result<(), QueueError> {
        let binding = self.binding(queue)?;
        let consumer = reg.id;
        let t = binding.add_consumer(reg);
        debug!("Consumer {} attached to '{}'", consumer, queue);
        self.apply(binding.name(), t);
        Ok(())
    }

    /// Detach a local consumer; its unacknowledged messages become pending.
    /// Emits `Stranded` if it was the last consumer and messages remain.
    pub fn remove_consumer(&self, queue: &str, consumer: ConsumerId) -> bool {
        let Some(binding) = self.get(queue) else {
            return false;
        };
        let (removed, t) = binding.remove_consumer(consumer);
        if removed {
            debug!("Consumer {} detached from '{}'", consumer, queue);
        }
        self.apply(binding.name(), t);
        removed
    }

    /// Add a message to a queue's pending FIFO
    pub fn enqueue(&self, queue: &str, message: Message) -> Result<(), QueueError> {
        let binding = self.binding(queue)?;
        let id = message.id();
        let t = binding.enqueue(message)?;
        trace!("Enqueued {} on '{}'", id, queue);
        if let Some(ref metrics) = self.metrics {
            metrics.message_enqueued();
        }
        self.apply(binding.name(), t);
        Ok(())
    }

    /// Deliver the next pending message to a ready consumer, if any
    pub fn try_deliver_next(&self, queue: &str) -> Option<Message> {
        let binding = self.get(queue)?;
        let (delivered, t) = binding.try_deliver_next();
        self.apply(binding.name(), t);
        delivered.map(|(_, message)| message)
    }

    /// Acknowledge a message held by a consumer
    pub fn acknowledge(
        &self,
        queue: &str,
        consumer: ConsumerId,
        id: MessageId,
    ) -> Result<(), QueueError> {
        let binding = self.get(queue).ok_or(QueueError::UnknownMessage(id))?;
        let t = binding.acknowledge(consumer, id)?;
        if let Some(ref metrics) = self.metrics {
            metrics.message_acknowledged();
        }
        self.apply(binding.name(), t);
        Ok(())
    }

    /// Remove a pending message for handoff to the cluster bridge
    pub fn take_for_transfer(&self, queue: &str, id: MessageId) -> Option<(u64, Message)> {
        let binding = self.get(queue)?;
        let (taken, t) = binding.take_for_transfer(id);
        self.apply(binding.name(), t);
        taken
    }

    /// Return a message whose transfer failed
    pub fn restore(&self, queue: &str, seq: u64, message: Message) {
        if let Some(binding) = self.get(queue) {
            let t = binding.restore(seq, message);
            self.apply(binding.name(), t);
        }
    }

    /// Claim a stranded binding for a redistribution task
    pub fn begin_task(&self, queue: &str, control: Arc<TaskControl>) -> Option<Vec<MessageId>> {
        self.get(queue)?.begin_task(control)
    }

    pub fn finish_task(&self, queue: &str, control: &Arc<TaskControl>) {
        if let Some(binding) = self.get(queue) {
            binding.finish_task(control);
        }
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.get(queue).map(|b| b.consumer_count()).unwrap_or(0)
    }

    pub fn pending_count(&self, queue: &str) -> usize {
        self.get(queue).map(|b| b.pending_count()).unwrap_or(0)
    }

    pub fn binding_state(&self, queue: &str) -> Option<BindingState> {
        self.get(queue).map(|b| b.state())
    }
}
