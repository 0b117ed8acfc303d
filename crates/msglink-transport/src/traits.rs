use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;

use crate::error::{Result, TransportError};

/// Sleep between retries when a backend reports would-block.
pub const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Bounded retry attempts before a would-block condition becomes a timeout.
pub const MAX_RETRIES: usize = 100;

/// The available backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// POSIX message queue: bounded-size local datagrams.
    Queue,
    /// TCP socket with application-level delivery acknowledgement.
    Socket,
    /// File-backed pseudo-channel, one record per line.
    File,
}

impl TransportKind {
    pub fn name(self) -> &'static str {
        match self {
            TransportKind::Queue => "queue",
            TransportKind::Socket => "socket",
            TransportKind::File => "file",
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queue" | "mq" => Ok(TransportKind::Queue),
            "socket" | "tcp" => Ok(TransportKind::Socket),
            "file" => Ok(TransportKind::File),
            other => Err(TransportError::InvalidAddress(format!(
                "unknown transport kind '{other}'"
            ))),
        }
    }
}

/// The role a channel plays, used for backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Plain one-directional channel.
    Standard,
    /// RPC client endpoint.
    Client,
    /// RPC server endpoint.
    Server,
    /// File-like channel (table/log style streams).
    FileLike,
}

/// Pick the backend kind for a role.
///
/// Pure function of the configured default plus explicit overrides: file-like
/// roles always map to the file backend, client/server roles honor the RPC
/// override when present.
pub fn select_kind(default: TransportKind, rpc_override: Option<TransportKind>, role: Role) -> TransportKind {
    match role {
        Role::FileLike => TransportKind::File,
        Role::Client | Role::Server => rpc_override.unwrap_or(default),
        Role::Standard => default,
    }
}

/// The configured default backend kind for this process.
pub fn default_kind() -> TransportKind {
    kind_from_env("MSGLINK_DEFAULT_TRANSPORT").unwrap_or(platform_default())
}

/// The configured client/server backend override, if any.
pub fn rpc_kind_override() -> Option<TransportKind> {
    kind_from_env("MSGLINK_RPC_TRANSPORT")
}

fn kind_from_env(key: &str) -> Option<TransportKind> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn platform_default() -> TransportKind {
    if cfg!(target_os = "linux") {
        TransportKind::Queue
    } else {
        TransportKind::Socket
    }
}

/// Destination for one received message.
///
/// The growable/fixed choice replaces a runtime "allow realloc" flag: a
/// growable buffer is resized to fit, a fixed slice rejects oversized
/// messages with [`TransportError::BufferTooSmall`].
#[derive(Debug)]
pub enum RecvBuf<'a> {
    Growable(&'a mut BytesMut),
    Fixed(&'a mut [u8]),
}

impl RecvBuf<'_> {
    /// Store one complete message, replacing previous contents.
    pub fn fill(&mut self, message: &[u8]) -> Result<usize> {
        match self {
            RecvBuf::Growable(buf) => {
                buf.clear();
                buf.extend_from_slice(message);
                Ok(message.len())
            }
            RecvBuf::Fixed(slice) => {
                if slice.len() < message.len() {
                    return Err(TransportError::BufferTooSmall {
                        needed: message.len(),
                        capacity: slice.len(),
                    });
                }
                slice[..message.len()].copy_from_slice(message);
                Ok(message.len())
            }
        }
    }
}

/// One transport backend: the uniform contract every communicator drives.
///
/// `send`/`recv` block for bounded retry windows on would-block conditions;
/// transient would-block is never surfaced to callers.
pub trait Transport: Send + std::fmt::Debug {
    /// Backend kind.
    fn kind(&self) -> TransportKind;

    /// The address this endpoint is reachable at (or sends to).
    fn address(&self) -> &str;

    /// Acquire the OS resources for this channel.
    fn open(&mut self) -> Result<()>;

    /// Send one message.
    fn send(&mut self, message: &[u8]) -> Result<()>;

    /// Receive one message into `buf`, returning its length.
    fn recv(&mut self, buf: RecvBuf<'_>) -> Result<usize>;

    /// Messages waiting (receive side) or sent but unconfirmed (send side).
    fn pending(&mut self) -> Result<usize>;

    /// Release OS resources. Safe to call more than once.
    fn close(&mut self) -> Result<()>;

    /// Whether this backend is a file pseudo-channel (suppresses multipart).
    fn is_file(&self) -> bool {
        false
    }

    /// Address a peer can use to confirm delivery back to this endpoint,
    /// for backends that support application-level acknowledgement.
    fn reply_channel(&mut self) -> Result<Option<String>> {
        Ok(None)
    }
}
