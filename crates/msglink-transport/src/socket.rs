use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::traits::{RecvBuf, Transport, TransportKind, MAX_RETRIES, RETRY_SLEEP};
use crate::wire::{decode_datagram, encode_datagram, DATAGRAM_HEADER, MAGIC};

/// Acknowledgement byte: one datagram confirmed delivered.
pub const ACK: u8 = 0x06;
/// Control byte: discard outstanding-acknowledgement accounting.
pub const PURGE: u8 = 0x15;
/// Control byte: peer is closing; no further confirmations will arrive.
pub const CLOSE: u8 = 0x04;

const READ_CHUNK: usize = 8 * 1024;

/// TCP socket transport with application-level delivery acknowledgement.
///
/// A sender connects to the receiver's address and, once a reply channel has
/// been advertised (via [`SocketTransport::reply_address`]), blocks after
/// every send until the peer confirms receipt on that dedicated connection.
/// This turns a fire-and-forget stream into an at-least-delivered,
/// flow-controlled channel. Receivers confirm through
/// [`connect_reply`]/[`send_confirmation`], one cached connection per
/// distinct reply address.
pub struct SocketTransport {
    address: String,
    allow_multiple: bool,
    inner: Inner,
}

enum Inner {
    Unopened { listen: bool },
    Sender(SenderState),
    Receiver(ReceiverState),
    Closed,
}

struct SenderState {
    stream: TcpStream,
    outbuf: BytesMut,
    ack_listener: Option<TcpListener>,
    ack_conn: Option<TcpStream>,
    sent: u64,
    acked: u64,
    peer_closed: bool,
}

struct ReceiverState {
    listener: TcpListener,
    conn: Option<TcpStream>,
    inbuf: BytesMut,
}

impl SocketTransport {
    /// Transport that connects to `address` and sends.
    pub fn sender(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            allow_multiple: false,
            inner: Inner::Unopened { listen: false },
        }
    }

    /// Transport that binds `address` (may be `host:0`) and receives.
    pub fn receiver(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            allow_multiple: false,
            inner: Inner::Unopened { listen: true },
        }
    }

    /// Accept a new connection whenever the current one closes.
    pub fn with_multiple_connections(mut self) -> Self {
        self.allow_multiple = true;
        self
    }

    /// The reply address delivery confirmations should be sent to.
    ///
    /// Lazily binds the acknowledgement listener on first use; from then on
    /// every send blocks until its confirmation arrives.
    pub fn reply_address(&mut self) -> Result<String> {
        let state = match &mut self.inner {
            Inner::Sender(state) => state,
            _ => {
                return Err(TransportError::InvalidAddress(
                    "reply address is only available on an open send socket".to_string(),
                ))
            }
        };

        if state.ack_listener.is_none() {
            let listener = TcpListener::bind("127.0.0.1:0").map_err(|source| {
                TransportError::Bind {
                    address: "127.0.0.1:0".to_string(),
                    source,
                }
            })?;
            listener.set_nonblocking(true)?;
            debug!(address = %listener.local_addr()?, "ack listener bound");
            state.ack_listener = Some(listener);
        }

        let listener = state.ack_listener.as_ref().unwrap();
        Ok(listener.local_addr()?.to_string())
    }

    /// Sent-but-unconfirmed datagram count (send side only).
    pub fn unconfirmed(&self) -> u64 {
        match &self.inner {
            Inner::Sender(state) => state.sent - state.acked,
            _ => 0,
        }
    }
}

impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn open(&mut self) -> Result<()> {
        match self.inner {
            Inner::Unopened { listen: false } => {
                let stream = connect_with_retry(&self.address)?;
                stream.set_nodelay(true)?;
                debug!(address = %self.address, "socket sender connected");
                self.inner = Inner::Sender(SenderState {
                    stream,
                    outbuf: BytesMut::with_capacity(READ_CHUNK),
                    ack_listener: None,
                    ack_conn: None,
                    sent: 0,
                    acked: 0,
                    peer_closed: false,
                });
                Ok(())
            }
            Inner::Unopened { listen: true } => {
                let listener =
                    TcpListener::bind(&self.address).map_err(|source| TransportError::Bind {
                        address: self.address.clone(),
                        source,
                    })?;
                // Rebind to the actual port when an ephemeral one was requested.
                self.address = listener.local_addr()?.to_string();
                debug!(address = %self.address, "socket receiver listening");
                self.inner = Inner::Receiver(ReceiverState {
                    listener,
                    conn: None,
                    inbuf: BytesMut::with_capacity(READ_CHUNK),
                });
                Ok(())
            }
            Inner::Sender(_) | Inner::Receiver(_) => Ok(()),
            Inner::Closed => Err(TransportError::Closed),
        }
    }

    fn send(&mut self, message: &[u8]) -> Result<()> {
        let Inner::Sender(state) = &mut self.inner else {
            return Err(TransportError::Closed);
        };
        if state.peer_closed {
            return Err(TransportError::Closed);
        }

        state.outbuf.clear();
        encode_datagram(message, &mut state.outbuf)?;
        write_all_retrying(&mut state.stream, &state.outbuf)?;
        state.sent += 1;
        trace!(address = %self.address, bytes = message.len(), "socket send");

        // Block until the peer confirms, once a reply channel exists.
        if state.ack_listener.is_some() {
            wait_for_confirmation(state)?;
        }
        Ok(())
    }

    fn recv(&mut self, mut buf: RecvBuf<'_>) -> Result<usize> {
        let allow_multiple = self.allow_multiple;
        let Inner::Receiver(state) = &mut self.inner else {
            return Err(TransportError::Closed);
        };

        loop {
            if let Some(message) = decode_datagram(&mut state.inbuf)? {
                trace!(address = %self.address, bytes = message.len(), "socket recv");
                return buf.fill(&message);
            }

            let conn = match &mut state.conn {
                Some(conn) => conn,
                None => {
                    let (conn, peer) = accept_with_retry(&state.listener)?;
                    debug!(address = %self.address, peer = %peer, "socket connection accepted");
                    state.conn = Some(conn);
                    state.conn.as_mut().unwrap()
                }
            };

            let mut chunk = [0u8; READ_CHUNK];
            let read = match conn.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    std::thread::sleep(RETRY_SLEEP);
                    continue;
                }
                Err(err) => return Err(TransportError::Io(err)),
            };

            if read == 0 {
                state.conn = None;
                if allow_multiple {
                    continue;
                }
                return Err(TransportError::Closed);
            }
            state.inbuf.extend_from_slice(&chunk[..read]);
        }
    }

    fn pending(&mut self) -> Result<usize> {
        match &mut self.inner {
            Inner::Sender(state) => Ok((state.sent - state.acked) as usize),
            Inner::Receiver(state) => {
                poll_into_buffer(state)?;
                Ok(count_buffered_datagrams(&state.inbuf))
            }
            _ => Ok(0),
        }
    }

    fn reply_channel(&mut self) -> Result<Option<String>> {
        if matches!(self.inner, Inner::Sender(_)) {
            self.reply_address().map(Some)
        } else {
            Ok(None)
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Inner::Sender(state) = &mut self.inner {
            if !state.peer_closed && state.sent > state.acked {
                warn!(
                    address = %self.address,
                    unconfirmed = state.sent - state.acked,
                    "closing socket with unconfirmed sends"
                );
            }
        }
        self.inner = Inner::Closed;
        Ok(())
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let side = match &self.inner {
            Inner::Unopened { listen } => {
                if *listen {
                    "unopened-receiver"
                } else {
                    "unopened-sender"
                }
            }
            Inner::Sender(_) => "sender",
            Inner::Receiver(_) => "receiver",
            Inner::Closed => "closed",
        };
        f.debug_struct("SocketTransport")
            .field("address", &self.address)
            .field("side", &side)
            .finish()
    }
}

/// Connect a confirmation channel to a sender's reply address.
pub fn connect_reply(address: &str) -> Result<TcpStream> {
    let stream = connect_with_retry(address)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Send one confirmation byte on an established reply connection.
pub fn send_confirmation(conn: &mut TcpStream, byte: u8) -> Result<()> {
    loop {
        match conn.write(&[byte]) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
}

fn connect_with_retry(address: &str) -> Result<TcpStream> {
    for _ in 0..MAX_RETRIES {
        match TcpStream::connect(address) {
            Ok(stream) => return Ok(stream),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable
                ) =>
            {
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(source) => {
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    source,
                })
            }
        }
    }
    Err(TransportError::Timeout {
        attempts: MAX_RETRIES,
    })
}

fn accept_with_retry(listener: &TcpListener) -> Result<(TcpStream, std::net::SocketAddr)> {
    listener.set_nonblocking(true)?;
    for _ in 0..MAX_RETRIES {
        match listener.accept() {
            Ok((conn, peer)) => {
                conn.set_nonblocking(false)?;
                conn.set_nodelay(true)?;
                return Ok((conn, peer));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Accept(err)),
        }
    }
    Err(TransportError::Timeout {
        attempts: MAX_RETRIES,
    })
}

fn write_all_retrying(stream: &mut TcpStream, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(TransportError::Closed),
            Ok(n) => bytes = &bytes[n..],
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(RETRY_SLEEP);
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    loop {
        match stream.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
}

fn wait_for_confirmation(state: &mut SenderState) -> Result<()> {
    if state.ack_conn.is_none() {
        let listener = state.ack_listener.as_ref().unwrap();
        let (conn, _peer) = accept_with_retry(listener)?;
        conn.set_read_timeout(Some(RETRY_SLEEP))?;
        state.ack_conn = Some(conn);
    }

    let conn = state.ack_conn.as_mut().unwrap();
    let mut byte = [0u8; 1];
    for _ in 0..MAX_RETRIES {
        match conn.read(&mut byte) {
            Ok(0) => {
                // Reply channel gone: nothing further will be confirmed.
                state.ack_conn = None;
                state.peer_closed = true;
                state.acked = state.sent;
                return Ok(());
            }
            Ok(_) => {
                match byte[0] {
                    ACK => state.acked += 1,
                    PURGE => state.acked = state.sent,
                    CLOSE => {
                        state.peer_closed = true;
                        state.acked = state.sent;
                    }
                    other => {
                        warn!(byte = other, "unknown confirmation byte ignored");
                        continue;
                    }
                }
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Err(TransportError::Timeout {
        attempts: MAX_RETRIES,
    })
}

fn poll_into_buffer(state: &mut ReceiverState) -> Result<()> {
    if state.conn.is_none() {
        state.listener.set_nonblocking(true)?;
        match state.listener.accept() {
            Ok((conn, _peer)) => {
                conn.set_nodelay(true)?;
                state.conn = Some(conn);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(TransportError::Accept(err)),
        }
    }

    let conn = state.conn.as_mut().unwrap();
    conn.set_nonblocking(true)?;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match conn.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => state.inbuf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                conn.set_nonblocking(false)?;
                return Err(TransportError::Io(err));
            }
        }
    }
    conn.set_nonblocking(false)?;
    Ok(())
}

fn count_buffered_datagrams(buf: &BytesMut) -> usize {
    let mut count = 0usize;
    let mut pos = 0usize;
    while buf.len() - pos >= DATAGRAM_HEADER && buf[pos..pos + 2] == MAGIC {
        let len = u32::from_le_bytes(buf[pos + 2..pos + 6].try_into().unwrap()) as usize;
        if buf.len() - pos < DATAGRAM_HEADER + len {
            break;
        }
        count += 1;
        pos += DATAGRAM_HEADER + len;
    }
    count
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn open_receiver() -> SocketTransport {
        let mut receiver = SocketTransport::receiver("127.0.0.1:0");
        receiver.open().unwrap();
        receiver
    }

    #[test]
    fn send_recv_roundtrip_without_acks() {
        let mut receiver = open_receiver();
        let address = receiver.address().to_string();

        let sender = thread::spawn(move || {
            let mut sender = SocketTransport::sender(address);
            sender.open().unwrap();
            sender.send(b"over tcp").unwrap();
            sender
        });

        let mut buf = BytesMut::new();
        let n = receiver.recv(RecvBuf::Growable(&mut buf)).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf.as_ref(), b"over tcp");
        sender.join().unwrap();
    }

    #[test]
    fn ack_handshake_blocks_until_confirmed() {
        let mut receiver = open_receiver();
        let address = receiver.address().to_string();
        let (reply_tx, reply_rx) = std::sync::mpsc::channel::<String>();

        let sender = thread::spawn(move || {
            let mut sender = SocketTransport::sender(address);
            sender.open().unwrap();
            // In the protocol the reply address travels in the frame header.
            reply_tx.send(sender.reply_address().unwrap()).unwrap();
            sender.send(b"needs ack").unwrap();
            assert_eq!(sender.unconfirmed(), 0);
            sender
        });

        let mut buf = BytesMut::new();
        receiver.recv(RecvBuf::Growable(&mut buf)).unwrap();
        assert_eq!(buf.as_ref(), b"needs ack");

        let reply_to = reply_rx.recv().unwrap();
        let mut reply = connect_reply(&reply_to).unwrap();
        send_confirmation(&mut reply, ACK).unwrap();

        sender.join().unwrap();
    }

    #[test]
    fn purge_resets_outstanding_counters() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let reply_to = listener.local_addr().unwrap().to_string();

        let mut state = SenderState {
            stream: {
                let target = TcpListener::bind("127.0.0.1:0").unwrap();
                TcpStream::connect(target.local_addr().unwrap()).unwrap()
            },
            outbuf: BytesMut::new(),
            ack_listener: Some(listener),
            ack_conn: None,
            sent: 3,
            acked: 1,
            peer_closed: false,
        };

        let confirm = thread::spawn(move || {
            let mut reply = connect_reply(&reply_to).unwrap();
            send_confirmation(&mut reply, PURGE).unwrap();
            reply
        });

        wait_for_confirmation(&mut state).unwrap();
        assert_eq!(state.acked, state.sent);
        drop(confirm.join().unwrap());
    }

    #[test]
    fn close_byte_marks_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let reply_to = listener.local_addr().unwrap().to_string();

        let mut state = SenderState {
            stream: {
                let target = TcpListener::bind("127.0.0.1:0").unwrap();
                TcpStream::connect(target.local_addr().unwrap()).unwrap()
            },
            outbuf: BytesMut::new(),
            ack_listener: Some(listener),
            ack_conn: None,
            sent: 2,
            acked: 0,
            peer_closed: false,
        };

        let confirm = thread::spawn(move || {
            let mut reply = connect_reply(&reply_to).unwrap();
            send_confirmation(&mut reply, CLOSE).unwrap();
            reply
        });

        wait_for_confirmation(&mut state).unwrap();
        assert!(state.peer_closed);
        assert_eq!(state.acked, state.sent);
        drop(confirm.join().unwrap());
    }

    #[test]
    fn receiver_pending_counts_complete_datagrams() {
        let mut receiver = open_receiver();
        let address = receiver.address().to_string();

        let sender = thread::spawn(move || {
            let mut sender = SocketTransport::sender(address);
            sender.open().unwrap();
            sender.send(b"a").unwrap();
            sender.send(b"bb").unwrap();
            sender
        });
        let sender = sender.join().unwrap();

        // Poll until both datagrams are visible.
        let mut seen = 0;
        for _ in 0..200 {
            seen = receiver.pending().unwrap();
            if seen == 2 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(seen, 2);

        let mut buf = BytesMut::new();
        receiver.recv(RecvBuf::Growable(&mut buf)).unwrap();
        assert_eq!(buf.as_ref(), b"a");
        receiver.recv(RecvBuf::Growable(&mut buf)).unwrap();
        assert_eq!(buf.as_ref(), b"bb");
        drop(sender);
    }

    #[test]
    fn recv_after_peer_close_reports_closed() {
        let mut receiver = open_receiver();
        let address = receiver.address().to_string();

        let sender = thread::spawn(move || {
            let mut sender = SocketTransport::sender(address);
            sender.open().unwrap();
            sender.send(b"last").unwrap();
            // Dropping closes the connection.
        });

        let mut buf = BytesMut::new();
        receiver.recv(RecvBuf::Growable(&mut buf)).unwrap();
        assert_eq!(buf.as_ref(), b"last");
        sender.join().unwrap();

        let err = receiver.recv(RecvBuf::Growable(&mut buf)).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn count_datagrams_ignores_partial_tail() {
        let mut buf = BytesMut::new();
        encode_datagram(b"whole", &mut buf).unwrap();
        encode_datagram(b"also whole", &mut buf).unwrap();
        let mut partial = BytesMut::new();
        encode_datagram(b"cut off", &mut partial).unwrap();
        buf.extend_from_slice(&partial[..DATAGRAM_HEADER + 2]);

        assert_eq!(count_buffered_datagrams(&buf), 2);
    }
}
