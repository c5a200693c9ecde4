//! In-process transport: a fan-out hub per pub/sub endpoint and a shared
//! bounded queue per push/pull endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::RwLock;

use super::error::TransportResult;
use super::message::Multipart;
use super::options::{enqueue, Enqueue, PublishReport, SendOutcome, SocketOptions};
use super::TransportError;

/// Topic prefixes a subscriber accepts. Shared between the subscriber and
/// whichever delivery slot feeds it.
pub(crate) type Filters = Arc<RwLock<Vec<Bytes>>>;

#[derive(Clone)]
struct Slot {
    id: u64,
    filters: Filters,
    tx: Sender<Multipart>,
}

/// Delivery fan-out for one publishing endpoint.
#[derive(Default)]
pub(crate) struct PubSubHub {
    slots: RwLock<Vec<Slot>>,
    bound: AtomicBool,
    next_id: AtomicU64,
}

impl PubSubHub {
    pub(crate) fn mark_bound(&self) -> bool {
        !self.bound.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_unbound(&self) {
        self.bound.store(false, Ordering::SeqCst);
    }

    pub(crate) fn attach(&self, filters: Filters, tx: Sender<Multipart>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots.write().push(Slot { id, filters, tx });
        id
    }

    pub(crate) fn detach(&self, id: u64) {
        self.slots.write().retain(|slot| slot.id != id);
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Deliver `msg` to every matching slot. Each slot gets the whole
    /// message or nothing.
    pub(crate) fn broadcast(&self, msg: &Multipart, opts: &SocketOptions) -> PublishReport {
        let slots: Vec<Slot> = self.slots.read().clone();
        let mut report = PublishReport::default();
        let mut gone = Vec::new();

        for slot in slots {
            if !msg.matches(&slot.filters.read()) {
                continue;
            }
            match enqueue(&slot.tx, msg.clone(), opts) {
                Ok(Enqueue::Sent(outcome)) => report.record(outcome),
                Ok(Enqueue::Disconnected) => gone.push(slot.id),
                Err(_) => report.record(SendOutcome::Dropped),
            }
        }

        if !gone.is_empty() {
            self.slots.write().retain(|slot| !gone.contains(&slot.id));
        }
        report
    }
}

/// One logical push/pull queue. Every puller shares the receiving end, so
/// each message reaches exactly one of them.
pub(crate) struct WorkQueue {
    tx: Sender<Multipart>,
    rx: Receiver<Multipart>,
    bound: AtomicBool,
}

impl WorkQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            bound: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_bound(&self) -> bool {
        !self.bound.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_unbound(&self) {
        self.bound.store(false, Ordering::SeqCst);
    }

    pub(crate) fn sender(&self) -> Sender<Multipart> {
        self.tx.clone()
    }

    pub(crate) fn receiver(&self) -> Receiver<Multipart> {
        self.rx.clone()
    }
}

/// Push onto a queue, mapping a vanished receiver to `NotRunning`.
pub(crate) fn push_to(
    tx: &Sender<Multipart>,
    msg: Multipart,
    opts: &SocketOptions,
) -> TransportResult<SendOutcome> {
    match enqueue(tx, msg, opts)? {
        Enqueue::Sent(outcome) => Ok(outcome),
        Enqueue::Disconnected => Err(TransportError::NotRunning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeliveryMode;

    #[test]
    fn lossy_broadcast_drops_whole_message_on_full_slot() {
        let hub = PubSubHub::default();
        let (tx, rx) = channel::bounded(1);
        hub.attach(Arc::new(RwLock::new(vec![Bytes::new()])), tx);

        let msg = Multipart::frame("raw", Bytes::from_static(b"m"), Bytes::from_static(b"p"));
        let opts = SocketOptions::default();
        assert_eq!(hub.broadcast(&msg, &opts).delivered, 1);
        assert_eq!(hub.broadcast(&msg, &opts).dropped, 1);

        let got = rx.try_recv().unwrap();
        assert_eq!(got.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnected_slots_are_pruned() {
        let hub = PubSubHub::default();
        let (tx, rx) = channel::bounded(4);
        hub.attach(Arc::new(RwLock::new(vec![Bytes::new()])), tx);
        drop(rx);
        let opts = SocketOptions::default().with_delivery(DeliveryMode::Blocking);
        let report = hub.broadcast(&Multipart::new("t"), &opts);
        assert_eq!(report, PublishReport::default());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn second_bind_is_refused() {
        let queue = WorkQueue::new(2);
        assert!(queue.mark_bound());
        assert!(!queue.mark_bound());
        queue.mark_unbound();
        assert!(queue.mark_bound());
    }
}
