//! Interchangeable transport backends for msglink.
//!
//! Three backends implement one contract ([`Transport`]): POSIX message
//! queues (bounded local datagrams), TCP sockets with an application-level
//! delivery acknowledgement, and file-backed line-record pseudo-channels.
//! Everything above this layer is backend-agnostic.

pub mod error;
pub mod file;
pub mod socket;
pub mod traits;
pub mod wire;

#[cfg(target_os = "linux")]
pub mod queue;

pub use error::{Result, TransportError};
pub use file::FileTransport;
pub use socket::{connect_reply, send_confirmation, SocketTransport, ACK, CLOSE, PURGE};
pub use traits::{
    default_kind, rpc_kind_override, select_kind, RecvBuf, Role, Transport, TransportKind,
    MAX_RETRIES, RETRY_SLEEP,
};

#[cfg(target_os = "linux")]
pub use queue::{QueueTransport, QUEUE_MSG_MAX};
