use std::time::Duration;

use crossbeam::channel::{SendTimeoutError, Sender, TrySendError};
use serde::Deserialize;

use super::error::{TransportError, TransportResult};
use super::message::Multipart;

/// How a sending socket behaves when the peer queue is full.
///
/// Both parts of a frame message travel as one unit, so a drop always
/// discards the whole message and never desynchronises the receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Drop the message when the queue is full. The sender never stalls.
    #[default]
    Lossy,
    /// Wait for queue space, bounded by `send_timeout` when set.
    Blocking,
}

impl DeliveryMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "lossy" => Some(Self::Lossy),
            "blocking" | "strict" => Some(Self::Blocking),
            _ => None,
        }
    }
}

/// Per-socket options.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Outbound queue capacity in messages.
    pub send_hwm: usize,
    /// Inbound queue capacity in messages.
    pub recv_hwm: usize,
    pub delivery: DeliveryMode,
    /// Upper bound for a `Blocking` send (`None` waits forever).
    pub send_timeout: Option<Duration>,
    /// Largest accepted message, topic included.
    pub max_message_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_hwm: 1000,
            recv_hwm: 1000,
            delivery: DeliveryMode::Lossy,
            send_timeout: None,
            max_message_size: 256 * 1024 * 1024,
        }
    }
}

impl SocketOptions {
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_hwm(mut self, send_hwm: usize, recv_hwm: usize) -> Self {
        self.send_hwm = send_hwm.max(1);
        self.recv_hwm = recv_hwm.max(1);
        self
    }

    pub(crate) fn check_size(&self, msg: &Multipart) -> TransportResult<()> {
        let size = msg.total_size();
        if size > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size,
                max_size: self.max_message_size,
            });
        }
        Ok(())
    }
}

/// Result of handing one message to a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Dropped,
}

/// Fan-out result of a publish.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

impl PublishReport {
    pub(crate) fn record(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Queued => self.delivered += 1,
            SendOutcome::Dropped => self.dropped += 1,
        }
    }
}

/// Outcome of a single enqueue when the receiving side has gone away.
pub(crate) enum Enqueue {
    Sent(SendOutcome),
    Disconnected,
}

/// Hand a message to a bounded queue according to the delivery mode.
pub(crate) fn enqueue(
    tx: &Sender<Multipart>,
    msg: Multipart,
    opts: &SocketOptions,
) -> TransportResult<Enqueue> {
    match opts.delivery {
        DeliveryMode::Lossy => match tx.try_send(msg) {
            Ok(()) => Ok(Enqueue::Sent(SendOutcome::Queued)),
            Err(TrySendError::Full(_)) => Ok(Enqueue::Sent(SendOutcome::Dropped)),
            Err(TrySendError::Disconnected(_)) => Ok(Enqueue::Disconnected),
        },
        DeliveryMode::Blocking => match opts.send_timeout {
            Some(timeout) => match tx.send_timeout(msg, timeout) {
                Ok(()) => Ok(Enqueue::Sent(SendOutcome::Queued)),
                Err(SendTimeoutError::Timeout(_)) => Err(TransportError::Timeout),
                Err(SendTimeoutError::Disconnected(_)) => Ok(Enqueue::Disconnected),
            },
            None => match tx.send(msg) {
                Ok(()) => Ok(Enqueue::Sent(SendOutcome::Queued)),
                Err(_) => Ok(Enqueue::Disconnected),
            },
        },
    }
}
