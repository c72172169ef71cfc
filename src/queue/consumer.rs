//! Consumer-facing handles: sessions, consumers and deliveries.
//!
//! Consumers run in client-acknowledge mode. A delivered message stays
//! owned by its consumer until acknowledged; closing the consumer (or its
//! session, or dropping either) hands every unacknowledged message back to
//! the binding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::debug;

use crate::message::{Message, MessageId};
use crate::relay::{BodyRelay, RelayError};

use super::{BindingRegistry, ConsumerId, ConsumerRegistration, QueueError};

/// A group of consumers closed together
pub struct Session {
    id: u64,
    registry: Arc<BindingRegistry>,
    consumers: Mutex<Vec<(Arc<str>, ConsumerId)>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(registry: Arc<BindingRegistry>) -> Self {
        Self {
            id: registry.next_session_id(),
            registry,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to a queue on this node
    pub fn create_consumer(&self, queue: &str) -> Result<Consumer, QueueError> {
        if self.is_closed() {
            return Err(QueueError::ConsumerClosed);
        }
        let binding = self.registry.binding(queue)?;
        let queue = binding.name().clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let detached = Arc::new(AtomicBool::new(false));
        let id = self.registry.next_consumer_id();
        self.consumers.lock().push((queue.clone(), id));

        self.registry.add_consumer(
            &queue,
            ConsumerRegistration {
                id,
                session_id: self.id,
                window: self.registry.consumer_window(),
                tx,
                detached: detached.clone(),
            },
        )?;

        Ok(Consumer {
            id,
            queue,
            registry: self.registry.clone(),
            rx,
            detached,
        })
    }

    /// Close every consumer of this session. Unacknowledged messages
    /// return to their bindings.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        debug!("Session {} closing ({} consumers)", self.id, consumers.len());
        for (queue, id) in consumers {
            self.registry.remove_consumer(&queue, id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// A local consumer of one queue
pub struct Consumer {
    id: ConsumerId,
    queue: Arc<str>,
    registry: Arc<BindingRegistry>,
    rx: mpsc::UnboundedReceiver<Message>,
    detached: Arc<AtomicBool>,
}

impl Consumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn wrap(&self, message: Message) -> Option<Delivery> {
        // Messages buffered before a detach were already handed back
        if self.is_closed() {
            return None;
        }
        Some(Delivery {
            message,
            consumer: self.id,
            queue: self.queue.clone(),
        })
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `None` on timeout or once the consumer is closed.
    pub async fn receive(&mut self, timeout: Duration) -> Option<Delivery> {
        if self.is_closed() {
            return None;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => self.wrap(message),
            Ok(None) | Err(_) => None,
        }
    }

    /// Take an already delivered message without waiting
    pub fn try_receive(&mut self) -> Option<Delivery> {
        let message = self.rx.try_recv().ok()?;
        self.wrap(message)
    }

    /// Acknowledge a delivery made to this consumer
    pub fn acknowledge(&self, delivery: &Delivery) -> Result<(), QueueError> {
        if delivery.consumer != self.id {
            return Err(QueueError::NotOwner {
                id: delivery.id(),
                consumer: self.id,
            });
        }
        if self.is_closed() {
            return Err(QueueError::ConsumerClosed);
        }
        self.registry
            .acknowledge(&self.queue, self.id, delivery.id())
    }

    /// Detach from the queue; unacknowledged messages become pending again
    pub fn close(&mut self) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        self.rx.close();
        self.registry.remove_consumer(&self.queue, self.id);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.close();
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    message: Message,
    consumer: ConsumerId,
    queue: Arc<str>,
}

impl Delivery {
    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_id(&self) -> ConsumerId {
        self.consumer
    }

    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.message.string_property(key)
    }

    /// Stream the body into a writer, chunk by chunk
    pub async fn save_to<W>(&self, relay: &BodyRelay, writer: &mut W) -> Result<u64, RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        relay.copy_to(self.message.body(), writer).await
    }
}
