/// Errors that can occur in transport backend operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listening address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Failed to connect to a peer address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An OS-level operation on a named resource failed.
    #[error("{op} failed for {name}: {source}")]
    Os {
        op: &'static str,
        name: String,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The message exceeds the backend's datagram limit.
    ///
    /// Backends never split; oversized payloads are the framing layer's job.
    #[error("message too large for backend ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A fixed receive buffer is smaller than the incoming message.
    #[error("receive buffer too small ({capacity} bytes, message needs {needed})")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// The peer closed the channel.
    #[error("transport closed by peer")]
    Closed,

    /// A bounded would-block retry window was exhausted.
    #[error("transport timed out after {attempts} retries")]
    Timeout { attempts: usize },

    /// The address string cannot be understood by this backend.
    #[error("invalid transport address: {0}")]
    InvalidAddress(String),

    /// The backend is not available on this platform.
    #[error("transport unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, TransportError>;
