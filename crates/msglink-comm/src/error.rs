use msglink_frame::FrameError;
use msglink_schema::SchemaError;
use msglink_transport::TransportError;

/// Errors raised by communicators and the RPC layer.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("no address registered for channel {name:?} (looked up {attempted:?})")]
    NoAddress { name: String, attempted: Vec<String> },

    #[error("channel {name:?} is closed")]
    Closed { name: String },

    #[error("send on a receive-only channel {name:?}")]
    WrongDirection { name: String },

    #[error(
        "multipart reassembly mismatch: header promised {expected} bytes, received {actual}"
    )]
    MultipartMismatch { expected: u64, actual: u64 },

    #[error("response for unknown request id {0:?}")]
    UnknownRequest(String),

    #[error("no request is awaiting a response")]
    NoPendingRequest,

    #[error("frame is missing its correlation metadata")]
    MissingCorrelation,

    #[error("sharing a communicator requires threading support (call init with threading enabled)")]
    ThreadingDisabled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type Result<T> = std::result::Result<T, CommError>;
