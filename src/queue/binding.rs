//! Queue binding: the per-node delivery state of one queue.
//!
//! All mutable state sits behind one binding-scoped mutex. Every ownership
//! transfer (binding to consumer, consumer back to binding, binding to the
//! cluster bridge and back) happens inside a single critical section.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::message::{DeliveryState, Message, MessageId};
use crate::redistribution::TaskControl;

use super::distributor::Distributor;
use super::QueueError;

/// Identifier of a local consumer
pub type ConsumerId = u64;

/// Redistribution-relevant state of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    /// At least one local consumer
    Active,
    /// No local consumer, messages pending
    Stranded,
    /// A redistribution task is in flight
    Redistributing,
    /// No local consumer, nothing pending
    Idle,
}

impl BindingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingState::Active => "active",
            BindingState::Stranded => "stranded",
            BindingState::Redistributing => "redistributing",
            BindingState::Idle => "idle",
        }
    }
}

/// A consumer as seen by the binding
pub struct ConsumerRegistration {
    pub id: ConsumerId,
    pub session_id: u64,
    /// Maximum outstanding (delivered, unacknowledged) messages
    pub window: usize,
    pub tx: mpsc::UnboundedSender<Message>,
    /// Set by the binding once the consumer is detached
    pub detached: Arc<AtomicBool>,
}

struct ConsumerSlot {
    reg: ConsumerRegistration,
    outstanding: usize,
    gone: bool,
}

impl ConsumerSlot {
    fn is_ready(&self) -> bool {
        !self.gone && self.outstanding < self.reg.window
    }
}

struct PendingEntry {
    seq: u64,
    message: Message,
}

struct InFlight {
    consumer: ConsumerId,
    seq: u64,
    message: Message,
}

/// Observable effects of a binding mutation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// New consumer count, when it changed
    pub consumer_count: Option<usize>,
    /// The binding entered the stranded condition
    pub became_stranded: bool,
    /// The binding left the stranded condition
    pub left_stranded: bool,
    /// Messages handed to consumers
    pub delivered: usize,
    /// Of those, messages delivered more than once
    pub redelivered: usize,
}

struct BindingInner {
    pending: VecDeque<PendingEntry>,
    in_flight: AHashMap<MessageId, InFlight>,
    owned: AHashSet<MessageId>,
    consumers: SmallVec<[ConsumerSlot; 4]>,
    distributor: Distributor,
    next_seq: u64,
    task: Option<Arc<TaskControl>>,
    stranded_since: Option<Instant>,
}

impl BindingInner {
    fn is_stranded(&self) -> bool {
        self.consumers.is_empty() && !self.pending.is_empty()
    }

    /// Insert by arrival sequence so a returned message regains its place
    fn insert_pending(&mut self, seq: u64, mut message: Message) {
        message.set_state(DeliveryState::Pending);
        self.owned.insert(message.id());
        let pos = self.pending.partition_point(|e| e.seq < seq);
        self.pending.insert(pos, PendingEntry { seq, message });
    }

    fn try_deliver_next(&mut self, t: &mut Transition) -> Option<(ConsumerId, Message)> {
        loop {
            if self.pending.is_empty() {
                return None;
            }
            let idx = self.distributor.select(&self.consumers, ConsumerSlot::is_ready)?;
            let PendingEntry { seq, mut message } = self.pending.pop_front()?;
            message.mark_delivered();

            let slot = &mut self.consumers[idx];
            if slot.reg.tx.send(message.clone()).is_err() {
                // Receiver dropped without detaching; keep the message here
                slot.gone = true;
                message.set_delivery_count(message.delivery_count().saturating_sub(1));
                self.insert_pending(seq, message);
                continue;
            }

            slot.outstanding += 1;
            let consumer = slot.reg.id;
            t.delivered += 1;
            if message.is_redelivered() {
                t.redelivered += 1;
            }
            self.in_flight.insert(
                message.id(),
                InFlight {
                    consumer,
                    seq,
                    message: message.clone(),
                },
            );
            return Some((consumer, message));
        }
    }

    fn dispatch(&mut self, t: &mut Transition) {
        while self.try_deliver_next(t).is_some() {}
    }
}

/// Delivery state of one queue on this node
pub struct QueueBinding {
    name: Arc<str>,
    inner: Mutex<BindingInner>,
}

impl QueueBinding {
    pub fn new(name: Arc<str>) -> Self {
        Self {
            name,
            inner: Mutex::new(BindingInner {
                pending: VecDeque::new(),
                in_flight: AHashMap::new(),
                owned: AHashSet::new(),
                consumers: SmallVec::new(),
                distributor: Distributor::new(),
                next_seq: 0,
                task: None,
                stranded_since: None,
            }),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Run a mutation and derive its observable transition
    fn mutate<R>(&self, f: impl FnOnce(&mut BindingInner, &mut Transition) -> R) -> (R, Transition) {
        let mut inner = self.inner.lock();
        let count_before = inner.consumers.len();
        let stranded_before = inner.is_stranded();

        let mut t = Transition::default();
        let result = f(&mut *inner, &mut t);

        if inner.consumers.len() != count_before {
            t.consumer_count = Some(inner.consumers.len());
        }
        let stranded_after = inner.is_stranded();
        if stranded_after && !stranded_before {
            t.became_stranded = true;
            inner.stranded_since = Some(Instant::now());
        } else if !stranded_after && stranded_before {
            t.left_stranded = true;
            inner.stranded_since = None;
        }
        (result, t)
    }

    /// Attach a consumer. Aborts the unsent remainder of a running
    /// redistribution task.
    pub fn add_consumer(&self, reg: ConsumerRegistration) -> Transition {
        let ((), t) = self.mutate(|inner, t| {
            if let Some(task) = &inner.task {
                task.abort();
            }
            inner.consumers.push(ConsumerSlot {
                reg,
                outstanding: 0,
                gone: false,
            });
            inner.dispatch(t);
        });
        t
    }

    /// Detach a consumer and return its unacknowledged messages to the
    /// pending set. Returns false if the consumer was not attached.
    pub fn remove_consumer(&self, id: ConsumerId) -> (bool, Transition) {
        self.mutate(|inner, t| {
            let Some(idx) = inner.consumers.iter().position(|c| c.reg.id == id) else {
                return false;
            };
            let slot = inner.consumers.remove(idx);
            slot.reg.detached.store(true, Ordering::Release);
            let remaining = inner.consumers.len();
            inner.distributor.on_removed(idx, remaining);

            let released: Vec<MessageId> = inner
                .in_flight
                .iter()
                .filter(|(_, f)| f.consumer == id)
                .map(|(id, _)| *id)
                .collect();
            for msg_id in released {
                if let Some(flight) = inner.in_flight.remove(&msg_id) {
                    inner.insert_pending(flight.seq, flight.message);
                }
            }

            inner.dispatch(t);
            true
        })
    }

    /// Append a message to the tail of the pending FIFO and dispatch
    pub fn enqueue(&self, mut message: Message) -> Result<Transition, QueueError> {
        let (result, t) = self.mutate(|inner, t| {
            if inner.owned.contains(&message.id()) {
                return Err(QueueError::Duplicate(message.id()));
            }
            message.set_state(DeliveryState::Pending);
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.owned.insert(message.id());
            inner.pending.push_back(PendingEntry { seq, message });
            inner.dispatch(t);
            Ok(())
        });
        result.map(|()| t)
    }

    /// Hand the head of the FIFO to the next ready consumer, if any.
    /// Never blocks.
    pub fn try_deliver_next(&self) -> (Option<(ConsumerId, Message)>, Transition) {
        self.mutate(|inner, t| inner.try_deliver_next(t))
    }

    /// Accept an acknowledgment from the consumer holding the message
    pub fn acknowledge(
        &self,
        consumer: ConsumerId,
        id: MessageId,
    ) -> Result<Transition, QueueError> {
        let (result, t) = self.mutate(|inner, t| {
            match inner.in_flight.get(&id) {
                None => return Err(QueueError::UnknownMessage(id)),
                Some(flight) if flight.consumer != consumer => {
                    return Err(QueueError::NotOwner { id, consumer })
                }
                Some(_) => {}
            }
            inner.in_flight.remove(&id);
            inner.owned.remove(&id);
            if let Some(slot) = inner.consumers.iter_mut().find(|c| c.reg.id == consumer) {
                slot.outstanding = slot.outstanding.saturating_sub(1);
            }
            inner.dispatch(t);
            Ok(())
        });
        result.map(|()| t)
    }

    /// Claim the binding for a redistribution task.
    ///
    /// Succeeds only while the binding is stranded and no other task runs;
    /// returns a snapshot of the pending ids in FIFO order.
    pub fn begin_task(&self, control: Arc<TaskControl>) -> Option<Vec<MessageId>> {
        let mut inner = self.inner.lock();
        if inner.task.is_some() || !inner.is_stranded() {
            return None;
        }
        inner.task = Some(control);
        Some(inner.pending.iter().map(|e| e.message.id()).collect())
    }

    /// Release the task claim
    pub fn finish_task(&self, control: &Arc<TaskControl>) {
        let mut inner = self.inner.lock();
        if inner
            .task
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, control))
        {
            inner.task = None;
        }
    }

    /// Remove a pending message for handoff to the bridge.
    ///
    /// Returns the message with its arrival sequence, or `None` if it is no
    /// longer pending here (delivered or acknowledged since the snapshot).
    pub fn take_for_transfer(&self, id: MessageId) -> (Option<(u64, Message)>, Transition) {
        self.mutate(|inner, _| {
            let pos = inner.pending.iter().position(|e| e.message.id() == id)?;
            let entry = inner.pending.remove(pos)?;
            inner.owned.remove(&id);
            Some((entry.seq, entry.message))
        })
    }

    /// Put back a message whose transfer failed, at its original position
    pub fn restore(&self, seq: u64, message: Message) -> Transition {
        let ((), t) = self.mutate(|inner, t| {
            if inner.owned.contains(&message.id()) {
                return;
            }
            inner.insert_pending(seq, message);
            inner.dispatch(t);
        });
        t
    }

    pub fn state(&self) -> BindingState {
        let inner = self.inner.lock();
        if inner.task.is_some() {
            BindingState::Redistributing
        } else if !inner.consumers.is_empty() {
            BindingState::Active
        } else if !inner.pending.is_empty() {
            BindingState::Stranded
        } else {
            BindingState::Idle
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Pending message ids in delivery order
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.inner
            .lock()
            .pending
            .iter()
            .map(|e| e.message.id())
            .collect()
    }

    /// True if the id is pending or in flight on this binding
    pub fn owns(&self, id: MessageId) -> bool {
        self.inner.lock().owned.contains(&id)
    }

    /// How long the binding has been stranded
    pub fn stranded_for(&self) -> Option<Duration> {
        self.inner.lock().stranded_since.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(id: ConsumerId, window: usize) -> (ConsumerRegistration, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConsumerRegistration {
                id,
                session_id: 1,
                window,
                tx,
                detached: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    fn binding() -> QueueBinding {
        QueueBinding::new(Arc::from("q"))
    }

    #[test]
    fn test_enqueue_without_consumer_strands() {
        let b = binding();
        let t = b.enqueue(Message::new("a")).unwrap();
        assert!(t.became_stranded);
        assert_eq!(b.state(), BindingState::Stranded);

        let t = b.enqueue(Message::new("b")).unwrap();
        assert!(!t.became_stranded);
        assert_eq!(b.pending_count(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let b = binding();
        let msg = Message::new("a");
        b.enqueue(msg.clone()).unwrap();
        assert!(matches!(b.enqueue(msg), Err(QueueError::Duplicate(_))));
        assert_eq!(b.pending_count(), 1);
    }

    #[test]
    fn test_delivery_moves_message_out_of_pending() {
        let b = binding();
        let (reg, mut rx) = registration(1, 10);
        let t = b.add_consumer(reg);
        assert_eq!(t.consumer_count, Some(1));

        let msg = Message::new("a");
        let id = msg.id();
        let t = b.enqueue(msg).unwrap();
        assert_eq!(t.delivered, 1);
        assert_eq!(b.pending_count(), 0);
        assert_eq!(b.in_flight_count(), 1);

        let got = rx.try_recv().unwrap();
        assert_eq!(got.id(), id);
        assert_eq!(got.state(), DeliveryState::DeliveredUnacked);
    }

    #[test]
    fn test_ack_only_from_holder() {
        let b = binding();
        let (r1, mut rx1) = registration(1, 10);
        let (r2, _rx2) = registration(2, 10);
        b.add_consumer(r1);
        b.add_consumer(r2);

        b.enqueue(Message::new("a")).unwrap();
        let got = rx1.try_recv().unwrap();

        assert!(matches!(
            b.acknowledge(2, got.id()),
            Err(QueueError::NotOwner { .. })
        ));
        b.acknowledge(1, got.id()).unwrap();
        assert!(matches!(
            b.acknowledge(1, got.id()),
            Err(QueueError::UnknownMessage(_))
        ));
        assert!(!b.owns(got.id()));
    }

    #[test]
    fn test_window_limits_outstanding() {
        let b = binding();
        let (reg, mut rx) = registration(1, 2);
        b.add_consumer(reg);
        for i in 0..3 {
            b.enqueue(Message::new(format!("m{}", i))).unwrap();
        }
        assert_eq!(b.in_flight_count(), 2);
        assert_eq!(b.pending_count(), 1);

        let first = rx.try_recv().unwrap();
        let t = b.acknowledge(1, first.id()).unwrap();
        assert_eq!(t.delivered, 1);
        assert_eq!(b.pending_count(), 0);
    }

    #[test]
    fn test_remove_consumer_releases_unacked_in_order() {
        let b = binding();
        let (reg, mut rx) = registration(1, 10);
        b.add_consumer(reg);

        let ids: Vec<_> = (0..4)
            .map(|i| {
                let m = Message::new(format!("m{}", i));
                let id = m.id();
                b.enqueue(m).unwrap();
                id
            })
            .collect();

        // Ack the second message only
        let _ = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        b.acknowledge(1, second.id()).unwrap();

        let (removed, t) = b.remove_consumer(1);
        assert!(removed);
        assert_eq!(t.consumer_count, Some(0));
        assert!(t.became_stranded);
        assert_eq!(b.pending_ids(), vec![ids[0], ids[2], ids[3]]);
        assert_eq!(b.state(), BindingState::Stranded);
    }

    #[test]
    fn test_released_messages_are_redelivered() {
        let b = binding();
        let (r1, _rx1) = registration(1, 10);
        b.add_consumer(r1);
        b.enqueue(Message::new("a")).unwrap();
        b.remove_consumer(1);

        let (r2, mut rx2) = registration(2, 10);
        let t = b.add_consumer(r2);
        assert_eq!(t.redelivered, 1);
        let got = rx2.try_recv().unwrap();
        assert!(got.is_redelivered());
    }

    #[test]
    fn test_gone_receiver_keeps_message() {
        let b = binding();
        let (reg, rx) = registration(1, 10);
        b.add_consumer(reg);
        drop(rx);

        b.enqueue(Message::new("a")).unwrap();
        assert_eq!(b.pending_count(), 1);
        assert_eq!(b.in_flight_count(), 0);
    }

    #[test]
    fn test_task_claim_and_transfer() {
        let b = binding();
        let m1 = Message::new("a");
        let m2 = Message::new("b");
        let (id1, id2) = (m1.id(), m2.id());
        b.enqueue(m1).unwrap();
        b.enqueue(m2).unwrap();

        let control = Arc::new(TaskControl::new("peer"));
        let snapshot = b.begin_task(control.clone()).unwrap();
        assert_eq!(snapshot, vec![id1, id2]);
        assert_eq!(b.state(), BindingState::Redistributing);
        assert!(b.begin_task(Arc::new(TaskControl::new("other"))).is_none());

        let (taken, _) = b.take_for_transfer(id1);
        let (seq, msg) = taken.unwrap();
        assert!(!b.owns(id1));
        assert_eq!(b.pending_ids(), vec![id2]);

        // Failed transfer goes back to the head
        b.restore(seq, msg);
        assert_eq!(b.pending_ids(), vec![id1, id2]);

        b.finish_task(&control);
        assert_eq!(b.state(), BindingState::Stranded);
    }

    #[test]
    fn test_consumer_arrival_aborts_task() {
        let b = binding();
        b.enqueue(Message::new("a")).unwrap();
        let control = Arc::new(TaskControl::new("peer"));
        b.begin_task(control.clone()).unwrap();

        let (reg, mut rx) = registration(1, 10);
        b.add_consumer(reg);
        assert!(control.is_aborted());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_begin_task_requires_stranded() {
        let b = binding();
        assert!(b.begin_task(Arc::new(TaskControl::new("p"))).is_none());

        let (reg, _rx) = registration(1, 0);
        b.add_consumer(reg);
        b.enqueue(Message::new("a")).unwrap();
        assert_eq!(b.state(), BindingState::Active);
        assert!(b.begin_task(Arc::new(TaskControl::new("p"))).is_none());
    }
}
