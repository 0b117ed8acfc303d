//! Typed channels over interchangeable transport backends.
//!
//! A [`Communicator`] owns one backend endpoint, a serializer, and the frame
//! policy for the channel: when to attach headers, when to split a body into
//! parts, and when to emit the end-of-channel sentinel. Splitting happens on
//! an auxiliary channel of the same backend kind whose address travels in the
//! primary frame's header; the receive side attaches to it transparently.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use msglink_frame::{format, is_eof, parse, probe_fit, Header, DEFAULT_MAX_FRAME, EOF_SENTINEL};
use msglink_schema::{Serializer, TypeDescriptor, Value};
use msglink_transport::{
    default_kind, rpc_kind_override, select_kind, FileTransport, RecvBuf, Role, SocketTransport,
    Transport, TransportError, TransportKind,
};

use crate::address::{self, Direction};
use crate::error::{CommError, Result};
use crate::state::{self, ChannelEntry};

/// Construction options for a communicator.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Backend kind; `None` selects from the environment and role.
    pub kind: Option<TransportKind>,
    /// Role used for backend selection when `kind` is `None`.
    pub role: Role,
    /// Body schema. Without one, bodies pass through as opaque bytes until a
    /// peer's header supplies a descriptor.
    pub datatype: Option<TypeDescriptor>,
    /// Attach a header to every message instead of only the first.
    pub always_send_header: bool,
    /// Accept a sequence of peer connections (socket receive side).
    pub allow_multiple: bool,
    /// Largest single frame before the body splits into parts.
    pub max_frame: usize,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            kind: None,
            role: Role::Standard,
            datatype: None,
            always_send_header: false,
            allow_multiple: false,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

impl CommConfig {
    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_datatype(mut self, datatype: TypeDescriptor) -> Self {
        self.datatype = Some(datatype);
        self
    }

    pub fn with_header_always(mut self) -> Self {
        self.always_send_header = true;
        self
    }

    pub fn with_multiple_connections(mut self) -> Self {
        self.allow_multiple = true;
        self
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

/// Outcome of one receive: either a decoded value list or end-of-channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CommRecv {
    Values(Vec<Value>),
    Eof,
}

/// RPC correlation metadata attached to a frame.
#[derive(Debug, Clone)]
pub struct RpcMeta {
    pub request_id: String,
    pub response_address: Option<String>,
}

/// State shared between sibling handles produced by [`Communicator::share`].
/// The sentinel goes out only once every handle has asked for it.
#[derive(Debug)]
struct CommShared {
    handles: AtomicUsize,
    eof_requests: AtomicUsize,
    eof_sent: AtomicBool,
    used: AtomicBool,
}

/// One endpoint of a typed channel.
///
/// Handles are `Send` but not `Sync`; concurrent use from several threads
/// goes through [`Communicator::share`] instead.
#[derive(Debug)]
pub struct Communicator {
    name: String,
    direction: Direction,
    backend: Box<dyn Transport>,
    serializer: Serializer,
    schema_fixed: bool,
    always_send_header: bool,
    allow_multiple: bool,
    max_frame: usize,
    shared: Arc<CommShared>,
    token: u64,
    local_eof: bool,
    eof_seen: bool,
    closed: bool,
    last_reply: Option<String>,
    reply_peers: Vec<String>,
    scratch: BytesMut,
}

impl Communicator {
    /// Open a channel whose address is registered in the environment.
    pub fn from_env(name: &str, direction: Direction) -> Result<Self> {
        Self::from_env_with(name, direction, CommConfig::default())
    }

    pub fn from_env_with(name: &str, direction: Direction, config: CommConfig) -> Result<Self> {
        let address = address::resolve(name, direction)?;
        Self::open_at(name, direction, &address, config)
    }

    /// Create a channel with a fresh address and publish it for peers.
    pub fn create(name: &str, direction: Direction, config: CommConfig) -> Result<Self> {
        let kind = effective_kind(&config);
        let candidate = address::generate(kind, name)?;
        let comm = Self::open_at(name, direction, &candidate, config)?;
        // Publish the post-open address: a socket receive side may have been
        // given an ephemeral port that only the bind resolved.
        address::publish(name, direction, comm.address());
        Ok(comm)
    }

    /// Open a channel at an explicit address.
    pub fn open_at(
        name: &str,
        direction: Direction,
        address: &str,
        config: CommConfig,
    ) -> Result<Self> {
        let kind = effective_kind(&config);
        let mut backend = make_backend(kind, direction, address, config.allow_multiple)?;
        backend.open()?;

        let (serializer, schema_fixed) = match config.datatype {
            Some(descriptor) => (Serializer::new(descriptor)?, true),
            None => (Serializer::new(TypeDescriptor::Direct)?, false),
        };

        let token = state::register_channel(ChannelEntry {
            name: name.to_string(),
            kind,
            address: backend.address().to_string(),
        });
        debug!(name, ?kind, ?direction, address = %backend.address(), "channel open");

        Ok(Self {
            name: name.to_string(),
            direction,
            max_frame: config.max_frame.min(backend_cap(kind)),
            // Socket delivery confirmation rides in headers, so socket
            // channels attach one to every message.
            always_send_header: config.always_send_header || kind == TransportKind::Socket,
            allow_multiple: config.allow_multiple,
            backend,
            serializer,
            schema_fixed,
            shared: Arc::new(CommShared {
                handles: AtomicUsize::new(1),
                eof_requests: AtomicUsize::new(0),
                eof_sent: AtomicBool::new(false),
                used: AtomicBool::new(false),
            }),
            token,
            local_eof: false,
            eof_seen: false,
            closed: false,
            last_reply: None,
            reply_peers: Vec::new(),
            scratch: BytesMut::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> TransportKind {
        self.backend.kind()
    }

    pub fn address(&self) -> &str {
        self.backend.address()
    }

    /// Current body schema (reflects any adoption or precision widening).
    pub fn datatype(&self) -> &TypeDescriptor {
        self.serializer.descriptor()
    }

    /// Messages waiting to be received, or sent but not yet confirmed.
    pub fn pending(&mut self) -> Result<usize> {
        Ok(self.backend.pending()?)
    }

    /// Encode and send one value list.
    pub fn send(&mut self, values: &[Value]) -> Result<()> {
        self.send_with(values, None)
    }

    pub(crate) fn send_with(&mut self, values: &[Value], rpc: Option<RpcMeta>) -> Result<()> {
        if self.direction != Direction::Send {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
            });
        }
        if self.closed || self.shared.eof_sent.load(Ordering::SeqCst) {
            return Err(CommError::Closed {
                name: self.name.clone(),
            });
        }

        let body = self.serializer.encode(values)?;
        let first = !self.shared.used.load(Ordering::SeqCst);
        let needs_header =
            first || self.always_send_header || body.len() > self.max_frame || rpc.is_some();

        if !needs_header {
            self.backend.send(&body)?;
            trace!(name = %self.name, bytes = body.len(), "sent bare body");
            return Ok(());
        }

        let mut header = Header::for_body(body.len());
        header.id = Some(state::next_message_id());
        if first {
            header.datatype = Some(self.serializer.descriptor().clone());
        }
        if let Some(meta) = rpc {
            header.request_id = Some(meta.request_id);
            header.response_address = meta.response_address;
        }
        header.reply_to = self.backend.reply_channel()?;

        // File channels take bodies of any length in one record.
        let limit = if self.backend.is_file() {
            usize::MAX
        } else {
            self.max_frame
        };

        let fit = probe_fit(&header, body.len(), limit)?;
        if fit >= body.len() {
            let (frame, _) = format(&header, &body, limit)?;
            self.backend.send(&frame)?;
            self.shared.used.store(true, Ordering::SeqCst);
            trace!(name = %self.name, bytes = body.len(), "sent framed body");
            return Ok(());
        }

        // The body does not fit beside its header: announce a continuation
        // channel, send what fits, then stream the rest through it. The
        // continuation endpoint connects only after the primary frame is out
        // so the peer has had a chance to learn its address.
        let kind = self.backend.kind();
        let aux_name = format!("{}_part", self.name);
        let aux_address = address::generate(kind, &aux_name)?;
        header.multipart = true;
        header.address = Some(aux_address.clone());

        let (frame, sent) = format(&header, &body, limit)?;
        self.backend.send(&frame)?;

        let mut aux = make_aux_backend(kind, Direction::Send, &aux_address)?;
        aux.open()?;
        let chunk = backend_cap(kind).min(self.max_frame);
        let mut offset = sent;
        while offset < body.len() {
            let end = (offset + chunk).min(body.len());
            aux.send(&body[offset..end])?;
            offset = end;
        }
        aux.close()?;
        self.shared.used.store(true, Ordering::SeqCst);
        debug!(
            name = %self.name,
            bytes = body.len(),
            inline = sent,
            aux = %aux_address,
            "sent multipart body"
        );
        Ok(())
    }

    /// Send the end-of-channel sentinel. Repeated calls on one handle are
    /// no-ops; across shared handles the sentinel waits for all of them.
    pub fn send_eof(&mut self) -> Result<()> {
        if self.direction != Direction::Send {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
            });
        }
        if self.local_eof {
            return Ok(());
        }
        self.local_eof = true;

        let requested = self.shared.eof_requests.fetch_add(1, Ordering::SeqCst) + 1;
        if requested < self.shared.handles.load(Ordering::SeqCst) {
            trace!(name = %self.name, requested, "end-of-channel deferred to siblings");
            return Ok(());
        }
        if self.shared.eof_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.send(EOF_SENTINEL)?;
        debug!(name = %self.name, "end-of-channel sent");
        Ok(())
    }

    /// Receive and decode one message.
    pub fn recv(&mut self) -> Result<CommRecv> {
        self.recv_with_meta().map(|(recv, _)| recv)
    }

    pub(crate) fn recv_with_meta(&mut self) -> Result<(CommRecv, Option<RpcMeta>)> {
        if self.direction != Direction::Recv {
            return Err(CommError::WrongDirection {
                name: self.name.clone(),
            });
        }
        if self.closed {
            return Err(CommError::Closed {
                name: self.name.clone(),
            });
        }
        if self.eof_seen {
            return Ok((CommRecv::Eof, None));
        }

        self.backend.recv(RecvBuf::Growable(&mut self.scratch))?;

        if is_eof(&self.scratch) {
            self.eof_seen = true;
            // The sender may be blocked on confirmation of the sentinel.
            if let Some(reply) = self.last_reply.clone() {
                state::confirm_delivery(&reply)?;
            }
            debug!(name = %self.name, "end-of-channel received");
            return Ok((CommRecv::Eof, None));
        }

        let (header, span) = parse(&self.scratch)?;

        // Confirm delivery of the frame itself before any reassembly; the
        // sender is blocked until this byte arrives.
        if let Some(reply) = header.reply_to.clone() {
            state::confirm_delivery(&reply)?;
            if !self.reply_peers.contains(&reply) {
                self.reply_peers.push(reply.clone());
            }
            self.last_reply = Some(reply);
        } else if let Some(reply) = self.last_reply.clone() {
            state::confirm_delivery(&reply)?;
        }

        let mut body = BytesMut::from(&self.scratch[span]);

        if header.multipart {
            let aux_address = header.address.clone().ok_or_else(|| {
                msglink_frame::FrameError::MalformedHeader(
                    "multipart frame without continuation address".to_string(),
                )
            })?;
            let mut aux =
                make_aux_backend(self.backend.kind(), Direction::Recv, &aux_address)?;
            aux.open()?;
            let mut chunk = BytesMut::new();
            while (body.len() as u64) < header.size {
                aux.recv(RecvBuf::Growable(&mut chunk))?;
                body.extend_from_slice(&chunk);
            }
            aux.close()?;
            trace!(name = %self.name, aux = %aux_address, bytes = body.len(), "multipart reassembled");
        }

        if body.len() as u64 != header.size {
            return Err(CommError::MultipartMismatch {
                expected: header.size,
                actual: body.len() as u64,
            });
        }

        let descriptor = if header.datatype_in_data {
            Some(take_inline_descriptor(&mut body)?)
        } else {
            header.datatype.clone()
        };
        if let Some(descriptor) = descriptor {
            if !self.schema_fixed {
                self.serializer = Serializer::new(descriptor)?;
                self.schema_fixed = true;
                debug!(name = %self.name, "adopted peer schema");
            }
        }

        let values = self.serializer.decode(&body)?;
        let meta = header.request_id.clone().map(|request_id| RpcMeta {
            request_id,
            response_address: header.response_address.clone(),
        });
        Ok((CommRecv::Values(values), meta))
    }

    /// A sibling handle over the same channel for use from another thread.
    pub fn share(&self) -> Result<Communicator> {
        if !state::threading_enabled() {
            return Err(CommError::ThreadingDisabled);
        }
        let kind = self.backend.kind();
        if kind == TransportKind::Socket && self.direction == Direction::Recv {
            // A listening socket cannot be bound twice.
            return Err(
                TransportError::InvalidAddress(format!(
                    "{} is already bound by this process",
                    self.backend.address()
                ))
                .into(),
            );
        }
        let mut backend =
            make_backend(kind, self.direction, self.backend.address(), self.allow_multiple)?;
        backend.open()?;
        let token = state::register_channel(ChannelEntry {
            name: self.name.clone(),
            kind,
            address: backend.address().to_string(),
        });
        self.shared.handles.fetch_add(1, Ordering::SeqCst);
        Ok(Communicator {
            name: self.name.clone(),
            direction: self.direction,
            backend,
            serializer: self.serializer.clone(),
            schema_fixed: self.schema_fixed,
            always_send_header: self.always_send_header,
            allow_multiple: self.allow_multiple,
            max_frame: self.max_frame,
            shared: Arc::clone(&self.shared),
            token,
            local_eof: false,
            eof_seen: false,
            closed: false,
            last_reply: None,
            reply_peers: Vec::new(),
            scratch: BytesMut::new(),
        })
    }

    /// Close this handle. Send sides emit the end-of-channel sentinel first;
    /// receive sides notify confirmed peers. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        match self.direction {
            Direction::Send => {
                self.send_eof()?;
            }
            Direction::Recv => {
                for peer in std::mem::take(&mut self.reply_peers) {
                    if let Err(err) = state::notify_close(&peer) {
                        debug!(name = %self.name, peer = %peer, error = %err, "peer already gone");
                    }
                }
            }
        }
        self.backend.close()?;
        state::deregister_channel(self.token);
        self.closed = true;
        debug!(name = %self.name, "channel closed");
        Ok(())
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn effective_kind(config: &CommConfig) -> TransportKind {
    config
        .kind
        .unwrap_or_else(|| select_kind(default_kind(), rpc_kind_override(), config.role))
}

/// Largest message one backend datagram can carry.
fn backend_cap(kind: TransportKind) -> usize {
    match kind {
        #[cfg(target_os = "linux")]
        TransportKind::Queue => msglink_transport::QUEUE_MSG_MAX,
        _ => usize::MAX,
    }
}

fn make_backend(
    kind: TransportKind,
    direction: Direction,
    address: &str,
    allow_multiple: bool,
) -> Result<Box<dyn Transport>> {
    let backend: Box<dyn Transport> = match kind {
        #[cfg(target_os = "linux")]
        TransportKind::Queue => Box::new(msglink_transport::QueueTransport::new(address)),
        #[cfg(not(target_os = "linux"))]
        TransportKind::Queue => {
            return Err(TransportError::Unsupported("posix message queues").into())
        }
        TransportKind::Socket => match direction {
            Direction::Send => Box::new(SocketTransport::sender(address)),
            Direction::Recv => {
                let receiver = SocketTransport::receiver(address);
                Box::new(if allow_multiple {
                    receiver.with_multiple_connections()
                } else {
                    receiver
                })
            }
        },
        TransportKind::File => match direction {
            Direction::Send => Box::new(FileTransport::writer(address)),
            Direction::Recv => Box::new(FileTransport::reader(address)),
        },
    };
    Ok(backend)
}

/// Continuation endpoints manage queue names differently from primary
/// channels: the writer may finish and close before the reader has even
/// parsed the primary frame, so the writer must leave the name linked and
/// the reader removes it once reassembly is done.
fn make_aux_backend(
    kind: TransportKind,
    direction: Direction,
    address: &str,
) -> Result<Box<dyn Transport>> {
    #[cfg(target_os = "linux")]
    if kind == TransportKind::Queue {
        let queue = msglink_transport::QueueTransport::new(address);
        return Ok(Box::new(match direction {
            Direction::Send => queue.leave_linked(),
            Direction::Recv => queue.unlink_when_done(),
        }));
    }
    make_backend(kind, direction, address, false)
}

/// Pull a length-prefixed descriptor off the front of a body that carries
/// its schema inline instead of in the header.
fn take_inline_descriptor(body: &mut BytesMut) -> Result<TypeDescriptor> {
    if body.len() < 8 {
        return Err(msglink_frame::FrameError::MalformedHeader(
            "inline descriptor length missing".to_string(),
        )
        .into());
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&body[..8]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if body.len() < 8 + len {
        return Err(msglink_frame::FrameError::MalformedHeader(
            "inline descriptor truncated".to_string(),
        )
        .into());
    }
    let json = std::str::from_utf8(&body[8..8 + len]).map_err(|_| {
        msglink_frame::FrameError::MalformedHeader("inline descriptor is not UTF-8".to_string())
    })?;
    let descriptor = TypeDescriptor::from_json(json)?;
    body.advance(8 + len);
    Ok(descriptor)
}
