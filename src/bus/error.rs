use thiserror::Error;

/// Result type alias for bus operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport-agnostic bus error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("bind failed on {endpoint}: {reason}")]
    BindFailed { endpoint: String, reason: String },

    #[error("endpoint {0} is already bound")]
    AddressInUse(String),

    #[error("connect failed to {endpoint}: {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// Socket was closed, or was never bound/connected.
    #[error("socket is not running")]
    NotRunning,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
}
