//! Message bus shared by every pipeline stage.
//!
//! This module provides:
//! - multi-part messages (`Multipart`) with `Bytes` parts for zero-copy fan-out
//! - publish/subscribe (`Publisher`, `Subscriber`) and push/pull (`Pusher`, `Puller`)
//! - `inproc://` endpoints inside one `BusContext` on crossbeam channels
//! - `tcp://` endpoints across processes on ZeroMQ sockets
//! - per-socket `DeliveryMode` so a frame's parts always share one guarantee
//!
//! Every receive takes a timeout and returns `Ok(None)` when it expires, which
//! is how stage loops poll their running flag.

mod endpoint;
mod error;
mod inproc;
mod message;
mod options;
mod socket;
mod tcp;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

pub use endpoint::Endpoint;
pub use error::{TransportError, TransportResult};
pub use message::Multipart;
pub use options::{DeliveryMode, PublishReport, SendOutcome, SocketOptions};
pub use socket::{Publisher, Puller, Pusher, Subscriber};

use inproc::{PubSubHub, WorkQueue};

struct ContextInner {
    hubs: Mutex<HashMap<String, Arc<PubSubHub>>>,
    queues: Mutex<HashMap<String, Arc<WorkQueue>>>,
    zmq: zmq::Context,
}

/// Namespace for `inproc://` endpoints, plus the ZeroMQ context behind
/// every `tcp://` socket.
///
/// Cheap to clone; every stage of one pipeline receives a clone of the same
/// context. Sockets created from different contexts never see each other's
/// in-process endpoints.
#[derive(Clone)]
pub struct BusContext {
    inner: Arc<ContextInner>,
}

impl Default for BusContext {
    fn default() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                hubs: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                zmq: zmq::Context::new(),
            }),
        }
    }
}

impl BusContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn zmq(&self) -> &zmq::Context {
        &self.inner.zmq
    }

    pub(crate) fn hub(&self, name: &str) -> Arc<PubSubHub> {
        let mut hubs = self.inner.hubs.lock();
        Arc::clone(hubs.entry(name.to_string()).or_default())
    }

    /// The queue for `name`; capacity applies only when this call creates it.
    pub(crate) fn queue(&self, name: &str, capacity: usize) -> Arc<WorkQueue> {
        let mut queues = self.inner.queues.lock();
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(WorkQueue::new(capacity))),
        )
    }

    /// Forget `name` if it still maps to `queue`. Sockets already holding
    /// the queue keep it; the next lookup creates a fresh one.
    pub(crate) fn release_queue(&self, name: &str, queue: &Arc<WorkQueue>) {
        let mut queues = self.inner.queues.lock();
        if queues.get(name).map_or(false, |q| Arc::ptr_eq(q, queue)) {
            queues.remove(name);
        }
    }
}
