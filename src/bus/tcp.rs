//! `tcp://` endpoints, backed by ZeroMQ sockets.
//!
//! ZeroMQ already provides what the in-process transport builds by hand:
//! high-water marks, atomic multi-part delivery, `DONTWAIT` for lossy sends
//! and topic filtering on SUB sockets. Frames travel as
//! `[topic, part0, part1, ...]`.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use super::endpoint::Endpoint;
use super::error::{TransportError, TransportResult};
use super::message::Multipart;
use super::options::{DeliveryMode, SendOutcome, SocketOptions};

fn clamp_i32(value: u128) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn configure(socket: &zmq::Socket, opts: &SocketOptions) -> zmq::Result<()> {
    socket.set_linger(0)?;
    socket.set_sndhwm(clamp_i32(opts.send_hwm as u128))?;
    socket.set_rcvhwm(clamp_i32(opts.recv_hwm as u128))?;
    socket.set_maxmsgsize(i64::try_from(opts.max_message_size).unwrap_or(-1))?;
    let send_timeout = match (opts.delivery, opts.send_timeout) {
        (DeliveryMode::Blocking, Some(timeout)) => clamp_i32(timeout.as_millis()),
        _ => -1,
    };
    socket.set_sndtimeo(send_timeout)
}

/// One ZeroMQ socket. `None` once closed.
///
/// `zmq::Socket` is `Send` but not `Sync`; the lock lets the owning bus
/// socket be shared across threads.
pub(crate) struct ZmqLink {
    endpoint: Endpoint,
    socket: Mutex<Option<zmq::Socket>>,
    local_addr: Option<SocketAddr>,
}

impl ZmqLink {
    pub(crate) fn bind(
        ctx: &zmq::Context,
        kind: zmq::SocketType,
        endpoint: &Endpoint,
        opts: &SocketOptions,
    ) -> TransportResult<Self> {
        let address = endpoint
            .bind_addr()
            .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        let socket = ctx.socket(kind)?;
        configure(&socket, opts)?;
        socket.bind(&address).map_err(|e| match e {
            zmq::Error::EADDRINUSE => TransportError::AddressInUse(endpoint.to_string()),
            other => TransportError::BindFailed {
                endpoint: endpoint.to_string(),
                reason: other.to_string(),
            },
        })?;

        // Resolves `:0` to the port the kernel picked.
        let local_addr = socket
            .get_last_endpoint()
            .ok()
            .and_then(|last| last.ok())
            .and_then(|last| last.strip_prefix("tcp://").and_then(|a| a.parse().ok()));
        log::debug!("bus: zmq {:?} bound on {}", kind, address);

        Ok(Self {
            endpoint: endpoint.clone(),
            socket: Mutex::new(Some(socket)),
            local_addr,
        })
    }

    pub(crate) fn connect(
        ctx: &zmq::Context,
        kind: zmq::SocketType,
        endpoint: &Endpoint,
        opts: &SocketOptions,
    ) -> TransportResult<Self> {
        let address = endpoint
            .connect_addr()
            .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
        let socket = ctx.socket(kind)?;
        configure(&socket, opts)?;
        socket
            .connect(&address)
            .map_err(|e| TransportError::ConnectFailed {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        log::debug!("bus: zmq {:?} connecting to {}", kind, address);

        Ok(Self {
            endpoint: endpoint.clone(),
            socket: Mutex::new(Some(socket)),
            local_addr: None,
        })
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Send the topic and every part as one ZeroMQ message.
    ///
    /// A lossy send never waits; a full queue drops the whole message. A
    /// blocking send waits up to the socket's send timeout. PUB sockets
    /// drop at a subscriber's high-water mark inside ZeroMQ, so for them
    /// `Queued` means the hand-off to ZeroMQ succeeded.
    pub(crate) fn send(&self, msg: &Multipart, opts: &SocketOptions) -> TransportResult<SendOutcome> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(TransportError::NotRunning)?;
        let flags = match opts.delivery {
            DeliveryMode::Lossy => zmq::DONTWAIT,
            DeliveryMode::Blocking => 0,
        };
        let frames = std::iter::once(&msg.topic[..]).chain(msg.parts.iter().map(|p| &p[..]));

        match socket.send_multipart(frames, flags) {
            Ok(()) => Ok(SendOutcome::Queued),
            Err(zmq::Error::EAGAIN) => match opts.delivery {
                DeliveryMode::Lossy => Ok(SendOutcome::Dropped),
                DeliveryMode::Blocking => Err(TransportError::Timeout),
            },
            Err(zmq::Error::ETERM) => Err(TransportError::NotRunning),
            Err(e) => Err(TransportError::SendFailed(format!("{}: {}", self.endpoint, e))),
        }
    }

    /// Wait up to `timeout` for one whole message.
    pub(crate) fn receive(&self, timeout: Duration) -> TransportResult<Option<Multipart>> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(TransportError::NotRunning)?;

        let mut items = [socket.as_poll_item(zmq::POLLIN)];
        let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        match zmq::poll(&mut items, millis) {
            Ok(_) => {}
            Err(zmq::Error::EINTR) => return Ok(None),
            Err(zmq::Error::ETERM) => return Err(TransportError::NotRunning),
            Err(e) => return Err(e.into()),
        }
        if !items[0].is_readable() {
            return Ok(None);
        }

        let frames = match socket.recv_multipart(zmq::DONTWAIT) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        into_multipart(frames).map(Some)
    }

    pub(crate) fn set_subscribe(&self, prefix: &[u8], subscribe: bool) -> TransportResult<()> {
        let guard = self.socket.lock();
        let socket = guard.as_ref().ok_or(TransportError::NotRunning)?;
        if subscribe {
            socket.set_subscribe(prefix)?;
        } else {
            socket.set_unsubscribe(prefix)?;
        }
        Ok(())
    }

    /// Drop the socket. Linger is zero, so unsent messages are discarded.
    pub(crate) fn close(&self) {
        if self.socket.lock().take().is_some() {
            log::debug!("bus: zmq socket on {} closed", self.endpoint);
        }
    }
}

fn into_multipart(frames: Vec<Vec<u8>>) -> TransportResult<Multipart> {
    let mut frames = frames.into_iter();
    let topic = frames
        .next()
        .ok_or_else(|| TransportError::InvalidMessage("empty message".to_string()))?;
    Ok(Multipart {
        topic: Bytes::from(topic),
        parts: frames.map(Bytes::from).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_is_invalid() {
        assert!(matches!(
            into_multipart(Vec::new()),
            Err(TransportError::InvalidMessage(_))
        ));
        let msg = into_multipart(vec![b"raw".to_vec(), b"m".to_vec(), b"px".to_vec()]).unwrap();
        assert_eq!(&msg.topic[..], b"raw");
        assert_eq!(msg.len(), 2);
    }

    #[test]
    fn closed_link_refuses_io() {
        let ctx = zmq::Context::new();
        let endpoint = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        let link = ZmqLink::bind(&ctx, zmq::PUB, &endpoint, &SocketOptions::default()).unwrap();
        assert!(link.local_addr().map_or(false, |a| a.port() != 0));
        link.close();
        assert!(matches!(
            link.send(&Multipart::new("t"), &SocketOptions::default()),
            Err(TransportError::NotRunning)
        ));
    }
}
