//! The four socket roles.
//!
//! `inproc://` endpoints run on the crossbeam hubs and queues of the
//! `BusContext`; `tcp://` endpoints are ZeroMQ sockets of the matching type.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;

use super::endpoint::Endpoint;
use super::error::{TransportError, TransportResult};
use super::inproc::{push_to, Filters, PubSubHub, WorkQueue};
use super::message::Multipart;
use super::options::{PublishReport, SendOutcome, SocketOptions};
use super::tcp::ZmqLink;
use super::BusContext;

fn recv_with_timeout(
    rx: &Receiver<Multipart>,
    timeout: Duration,
) -> TransportResult<Option<Multipart>> {
    match rx.recv_timeout(timeout) {
        Ok(msg) => Ok(Some(msg)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::NotRunning),
    }
}

// ----------------------------------------------------------------------------
// Publish / subscribe
// ----------------------------------------------------------------------------

enum PublisherBackend {
    Inproc(Arc<PubSubHub>),
    Tcp(ZmqLink),
}

/// Fan-out sender. Late subscribers only see messages published after they
/// connected.
pub struct Publisher {
    endpoint: Endpoint,
    opts: SocketOptions,
    backend: PublisherBackend,
    running: AtomicBool,
}

impl Publisher {
    pub fn bind(ctx: &BusContext, address: &str, opts: SocketOptions) -> TransportResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let backend = match &endpoint {
            Endpoint::Inproc(name) => {
                let hub = ctx.hub(name);
                if !hub.mark_bound() {
                    return Err(TransportError::AddressInUse(endpoint.to_string()));
                }
                PublisherBackend::Inproc(hub)
            }
            Endpoint::Tcp(_) => {
                PublisherBackend::Tcp(ZmqLink::bind(ctx.zmq(), zmq::PUB, &endpoint, &opts)?)
            }
        };
        log::debug!("bus: publisher bound on {}", endpoint);
        Ok(Self {
            endpoint,
            opts,
            backend,
            running: AtomicBool::new(true),
        })
    }

    /// Publish one multi-part message to every matching subscriber.
    ///
    /// In-process, the report counts each subscriber. Over TCP it counts the
    /// single hand-off to the ZeroMQ socket.
    pub fn publish(&self, msg: Multipart) -> TransportResult<PublishReport> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning);
        }
        self.opts.check_size(&msg)?;
        let report = match &self.backend {
            PublisherBackend::Inproc(hub) => hub.broadcast(&msg, &self.opts),
            PublisherBackend::Tcp(link) => {
                let mut report = PublishReport::default();
                report.record(link.send(&msg, &self.opts)?);
                report
            }
        };
        if report.dropped > 0 {
            log::trace!(
                "bus: {} dropped {} of {} deliveries",
                self.endpoint,
                report.dropped,
                report.dropped + report.delivered
            );
        }
        Ok(report)
    }

    /// Publish a `(metadata, payload)` frame message.
    pub fn publish_frame(
        &self,
        topic: impl Into<Bytes>,
        metadata: Bytes,
        payload: Bytes,
    ) -> TransportResult<PublishReport> {
        self.publish(Multipart::frame(topic, metadata, payload))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Bound TCP address (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.backend {
            PublisherBackend::Tcp(link) => link.local_addr(),
            PublisherBackend::Inproc(_) => None,
        }
    }

    /// Attached in-process subscribers. `None` for TCP, where ZeroMQ does
    /// not expose its peers.
    pub fn subscriber_count(&self) -> Option<usize> {
        match &self.backend {
            PublisherBackend::Inproc(hub) => Some(hub.subscriber_count()),
            PublisherBackend::Tcp(_) => None,
        }
    }

    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            PublisherBackend::Inproc(hub) => hub.mark_unbound(),
            PublisherBackend::Tcp(link) => link.close(),
        }
        log::debug!("bus: publisher on {} closed", self.endpoint);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.close();
    }
}

enum SubscriberBackend {
    Inproc {
        hub: Arc<PubSubHub>,
        slot: u64,
        filters: Filters,
        rx: Receiver<Multipart>,
    },
    Tcp(ZmqLink),
}

/// Receives whole multi-part messages whose topic starts with one of the
/// subscribed prefixes. A fresh subscriber accepts nothing until
/// `subscribe` is called; `subscribe("")` accepts everything.
pub struct Subscriber {
    endpoint: Endpoint,
    backend: SubscriberBackend,
    running: AtomicBool,
}

impl Subscriber {
    pub fn connect(ctx: &BusContext, address: &str, opts: SocketOptions) -> TransportResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let backend = match &endpoint {
            Endpoint::Inproc(name) => {
                let hub = ctx.hub(name);
                let filters: Filters = Arc::new(RwLock::new(Vec::new()));
                let (tx, rx) = crossbeam::channel::bounded(opts.recv_hwm.max(1));
                let slot = hub.attach(Arc::clone(&filters), tx);
                SubscriberBackend::Inproc {
                    hub,
                    slot,
                    filters,
                    rx,
                }
            }
            Endpoint::Tcp(_) => {
                SubscriberBackend::Tcp(ZmqLink::connect(ctx.zmq(), zmq::SUB, &endpoint, &opts)?)
            }
        };
        log::debug!("bus: subscriber connected to {}", endpoint);
        Ok(Self {
            endpoint,
            backend,
            running: AtomicBool::new(true),
        })
    }

    pub fn subscribe(&self, prefix: impl Into<Bytes>) {
        let prefix = prefix.into();
        match &self.backend {
            SubscriberBackend::Inproc { filters, .. } => {
                let mut filters = filters.write();
                if !filters.contains(&prefix) {
                    filters.push(prefix);
                }
            }
            SubscriberBackend::Tcp(link) => {
                if let Err(e) = link.set_subscribe(&prefix, true) {
                    log::warn!("bus: subscribe on {} failed: {}", self.endpoint, e);
                }
            }
        }
    }

    pub fn unsubscribe(&self, prefix: &[u8]) {
        match &self.backend {
            SubscriberBackend::Inproc { filters, .. } => {
                filters.write().retain(|f| &f[..] != prefix);
            }
            SubscriberBackend::Tcp(link) => {
                if let Err(e) = link.set_subscribe(prefix, false) {
                    log::warn!("bus: unsubscribe on {} failed: {}", self.endpoint, e);
                }
            }
        }
    }

    /// Wait up to `timeout` for the next message; `Ok(None)` on timeout.
    pub fn receive(&self, timeout: Duration) -> TransportResult<Option<Multipart>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning);
        }
        match &self.backend {
            SubscriberBackend::Inproc { rx, .. } => recv_with_timeout(rx, timeout),
            SubscriberBackend::Tcp(link) => link.receive(timeout),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            SubscriberBackend::Inproc { hub, slot, .. } => hub.detach(*slot),
            SubscriberBackend::Tcp(link) => link.close(),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Push / pull
// ----------------------------------------------------------------------------

/// In-process side of a push/pull socket. The side that bound the name
/// releases it on close, so the next bind starts from an empty queue.
struct InprocQueue {
    ctx: BusContext,
    name: String,
    queue: Arc<WorkQueue>,
    bound: bool,
}

impl InprocQueue {
    fn bind(ctx: &BusContext, name: &str, capacity: usize) -> TransportResult<Self> {
        let queue = ctx.queue(name, capacity);
        if !queue.mark_bound() {
            return Err(TransportError::AddressInUse(format!("inproc://{}", name)));
        }
        Ok(Self {
            ctx: ctx.clone(),
            name: name.to_string(),
            queue,
            bound: true,
        })
    }

    fn connect(ctx: &BusContext, name: &str, capacity: usize) -> Self {
        Self {
            ctx: ctx.clone(),
            name: name.to_string(),
            queue: ctx.queue(name, capacity),
            bound: false,
        }
    }

    fn close(&self) {
        if self.bound {
            self.queue.mark_unbound();
            self.ctx.release_queue(&self.name, &self.queue);
        }
    }
}

enum PushBackend {
    Inproc {
        queue: InprocQueue,
        tx: Sender<Multipart>,
    },
    Tcp(ZmqLink),
}

/// Sending end of a load-balanced queue.
pub struct Pusher {
    endpoint: Endpoint,
    opts: SocketOptions,
    backend: PushBackend,
    running: AtomicBool,
}

impl Pusher {
    pub fn bind(ctx: &BusContext, address: &str, opts: SocketOptions) -> TransportResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let backend = match &endpoint {
            Endpoint::Inproc(name) => {
                let queue = InprocQueue::bind(ctx, name, opts.send_hwm)?;
                let tx = queue.queue.sender();
                PushBackend::Inproc { queue, tx }
            }
            Endpoint::Tcp(_) => {
                PushBackend::Tcp(ZmqLink::bind(ctx.zmq(), zmq::PUSH, &endpoint, &opts)?)
            }
        };
        Ok(Self::assemble(endpoint, opts, backend))
    }

    pub fn connect(ctx: &BusContext, address: &str, opts: SocketOptions) -> TransportResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let backend = match &endpoint {
            Endpoint::Inproc(name) => {
                let queue = InprocQueue::connect(ctx, name, opts.send_hwm);
                let tx = queue.queue.sender();
                PushBackend::Inproc { queue, tx }
            }
            Endpoint::Tcp(_) => {
                PushBackend::Tcp(ZmqLink::connect(ctx.zmq(), zmq::PUSH, &endpoint, &opts)?)
            }
        };
        Ok(Self::assemble(endpoint, opts, backend))
    }

    fn assemble(endpoint: Endpoint, opts: SocketOptions, backend: PushBackend) -> Self {
        Self {
            endpoint,
            opts,
            backend,
            running: AtomicBool::new(true),
        }
    }

    /// Hand one message to exactly one puller.
    pub fn push(&self, msg: Multipart) -> TransportResult<SendOutcome> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning);
        }
        self.opts.check_size(&msg)?;
        match &self.backend {
            PushBackend::Inproc { tx, .. } => push_to(tx, msg, &self.opts),
            PushBackend::Tcp(link) => link.send(&msg, &self.opts),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.backend {
            PushBackend::Tcp(link) => link.local_addr(),
            PushBackend::Inproc { .. } => None,
        }
    }

    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            PushBackend::Inproc { queue, .. } => queue.close(),
            PushBackend::Tcp(link) => link.close(),
        }
    }
}

impl Drop for Pusher {
    fn drop(&mut self) {
        self.close();
    }
}

enum PullBackend {
    Inproc {
        queue: InprocQueue,
        rx: Receiver<Multipart>,
    },
    Tcp(ZmqLink),
}

/// Receiving end of a load-balanced queue. Competing pullers on the same
/// endpoint each get a disjoint share of the messages.
pub struct Puller {
    endpoint: Endpoint,
    backend: PullBackend,
    running: AtomicBool,
}

impl Puller {
    pub fn bind(ctx: &BusContext, address: &str, opts: SocketOptions) -> TransportResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let backend = match &endpoint {
            Endpoint::Inproc(name) => {
                let queue = InprocQueue::bind(ctx, name, opts.recv_hwm)?;
                let rx = queue.queue.receiver();
                PullBackend::Inproc { queue, rx }
            }
            Endpoint::Tcp(_) => {
                PullBackend::Tcp(ZmqLink::bind(ctx.zmq(), zmq::PULL, &endpoint, &opts)?)
            }
        };
        Ok(Self::assemble(endpoint, backend))
    }

    pub fn connect(ctx: &BusContext, address: &str, opts: SocketOptions) -> TransportResult<Self> {
        let endpoint = Endpoint::parse(address)?;
        let backend = match &endpoint {
            Endpoint::Inproc(name) => {
                let queue = InprocQueue::connect(ctx, name, opts.recv_hwm);
                let rx = queue.queue.receiver();
                PullBackend::Inproc { queue, rx }
            }
            Endpoint::Tcp(_) => {
                PullBackend::Tcp(ZmqLink::connect(ctx.zmq(), zmq::PULL, &endpoint, &opts)?)
            }
        };
        Ok(Self::assemble(endpoint, backend))
    }

    fn assemble(endpoint: Endpoint, backend: PullBackend) -> Self {
        Self {
            endpoint,
            backend,
            running: AtomicBool::new(true),
        }
    }

    /// Wait up to `timeout` for the next message; `Ok(None)` on timeout.
    pub fn pull(&self, timeout: Duration) -> TransportResult<Option<Multipart>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotRunning);
        }
        match &self.backend {
            PullBackend::Inproc { rx, .. } => recv_with_timeout(rx, timeout),
            PullBackend::Tcp(link) => link.receive(timeout),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.backend {
            PullBackend::Tcp(link) => link.local_addr(),
            PullBackend::Inproc { .. } => None,
        }
    }

    pub fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        match &self.backend {
            PullBackend::Inproc { queue, .. } => queue.close(),
            PullBackend::Tcp(link) => link.close(),
        }
    }
}

impl Drop for Puller {
    fn drop(&mut self) {
        self.close();
    }
}
