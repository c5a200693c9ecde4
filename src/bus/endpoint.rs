use std::fmt;

use super::error::{TransportError, TransportResult};

/// A bus address: `inproc://<name>` or `tcp://<host>:<port>`.
///
/// `tcp://*:<port>` binds on every interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Inproc(String),
    Tcp(String),
}

impl Endpoint {
    pub fn parse(address: &str) -> TransportResult<Self> {
        let address = address.trim();
        if let Some(name) = address.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(TransportError::InvalidEndpoint(address.to_string()));
            }
            return Ok(Self::Inproc(name.to_string()));
        }
        if let Some(host_port) = address.strip_prefix("tcp://") {
            let Some((host, port)) = host_port.rsplit_once(':') else {
                return Err(TransportError::InvalidEndpoint(address.to_string()));
            };
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(TransportError::InvalidEndpoint(address.to_string()));
            }
            return Ok(Self::Tcp(host_port.to_string()));
        }
        Err(TransportError::InvalidEndpoint(address.to_string()))
    }

    /// ZeroMQ address to bind. ZeroMQ reads a `*` host as every interface.
    pub(crate) fn bind_addr(&self) -> Option<String> {
        match self {
            Self::Inproc(_) => None,
            Self::Tcp(host_port) => Some(format!("tcp://{}", host_port)),
        }
    }

    /// ZeroMQ address to connect to; a wildcard host means this machine.
    pub(crate) fn connect_addr(&self) -> Option<String> {
        match self {
            Self::Inproc(_) => None,
            Self::Tcp(host_port) => Some(match host_port.strip_prefix("*:") {
                Some(port) => format!("tcp://127.0.0.1:{}", port),
                None => format!("tcp://{}", host_port),
            }),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inproc(name) => write!(f, "inproc://{}", name),
            Self::Tcp(host_port) => write!(f, "tcp://{}", host_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inproc_and_tcp() {
        assert_eq!(
            Endpoint::parse("inproc://raw").unwrap(),
            Endpoint::Inproc("raw".to_string())
        );
        let tcp = Endpoint::parse("tcp://*:5555").unwrap();
        assert_eq!(tcp.bind_addr().as_deref(), Some("tcp://*:5555"));
        assert_eq!(tcp.connect_addr().as_deref(), Some("tcp://127.0.0.1:5555"));
        assert_eq!(tcp.to_string(), "tcp://*:5555");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for bad in ["", "inproc://", "tcp://localhost", "tcp://host:notaport", "udp://x:1"] {
            assert!(Endpoint::parse(bad).is_err(), "{bad} should be rejected");
        }
    }
}
