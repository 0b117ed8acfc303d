use std::ffi::CString;

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{RecvBuf, Transport, TransportKind, MAX_RETRIES, RETRY_SLEEP};

/// Hard per-datagram limit for the queue backend.
///
/// Queues cannot split; oversized messages must be split by the framing
/// layer before they reach this backend.
pub const QUEUE_MSG_MAX: usize = 2048;

/// Messages a queue holds before senders block.
const QUEUE_DEPTH: libc::c_long = 10;

const QUEUE_MODE: libc::mode_t = 0o600;

/// When the queue name is unlinked on close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cleanup {
    IfCreator,
    Never,
    Always,
}

/// POSIX message queue transport.
///
/// Addresses are queue names (`/msglink-...`). By default the endpoint that
/// creates the queue unlinks the name on close, mirroring stale-resource
/// cleanup on bind: a leftover name from a crashed process is reused rather
/// than failing. Continuation endpoints override this with [`leave_linked`]
/// and [`unlink_when_done`], since their reader may attach only after the
/// writer has already finished.
///
/// [`leave_linked`]: QueueTransport::leave_linked
/// [`unlink_when_done`]: QueueTransport::unlink_when_done
pub struct QueueTransport {
    name: String,
    mqd: libc::mqd_t,
    owner: bool,
    cleanup: Cleanup,
}

// mqd_t is an fd-like handle; moving it between threads is fine.
unsafe impl Send for QueueTransport {}

impl QueueTransport {
    /// Create a transport for an existing or to-be-created queue name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mqd: -1,
            owner: false,
            cleanup: Cleanup::IfCreator,
        }
    }

    /// Keep the name linked on close even if this endpoint created the queue.
    /// Queued messages must stay addressable for a reader that attaches late.
    pub fn leave_linked(mut self) -> Self {
        self.cleanup = Cleanup::Never;
        self
    }

    /// Unlink the name on close even if this endpoint only attached to it.
    pub fn unlink_when_done(mut self) -> Self {
        self.cleanup = Cleanup::Always;
        self
    }

    /// Generate a fresh process-unique queue name.
    pub fn generate_name(tag: &str) -> String {
        format!(
            "/msglink-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        )
    }

    fn is_open(&self) -> bool {
        self.mqd != -1
    }

    fn os_err(&self, op: &'static str) -> TransportError {
        TransportError::Os {
            op,
            name: self.name.clone(),
            source: std::io::Error::last_os_error(),
        }
    }
}

impl Transport for QueueTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Queue
    }

    fn address(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let cname = CString::new(self.name.as_bytes())
            .map_err(|_| TransportError::InvalidAddress(self.name.clone()))?;

        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = QUEUE_DEPTH;
        attr.mq_msgsize = QUEUE_MSG_MAX as libc::c_long;

        // Try to create first so we know who owns cleanup of the name.
        let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_NONBLOCK;
        // SAFETY: cname is a valid NUL-terminated string and attr is a fully
        // initialized mq_attr that outlives the call.
        let mqd = unsafe { libc::mq_open(cname.as_ptr(), flags, QUEUE_MODE, &mut attr) };
        if mqd != -1 {
            self.mqd = mqd;
            self.owner = true;
            debug!(name = %self.name, "created message queue");
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(TransportError::Os {
                op: "mq_open",
                name: self.name.clone(),
                source: err,
            });
        }

        // SAFETY: as above; opening an existing queue ignores attr.
        let mqd = unsafe {
            libc::mq_open(cname.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK)
        };
        if mqd == -1 {
            return Err(self.os_err("mq_open"));
        }
        self.mqd = mqd;
        self.owner = false;
        debug!(name = %self.name, "attached to existing message queue");
        Ok(())
    }

    fn send(&mut self, message: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if message.len() > QUEUE_MSG_MAX {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max: QUEUE_MSG_MAX,
            });
        }

        for _ in 0..MAX_RETRIES {
            // SAFETY: mqd is an open descriptor and the pointer/length pair
            // refers to the caller's live slice.
            let rc = unsafe {
                libc::mq_send(
                    self.mqd,
                    message.as_ptr().cast::<libc::c_char>(),
                    message.len(),
                    0,
                )
            };
            if rc == 0 {
                trace!(name = %self.name, bytes = message.len(), "queue send");
                return Ok(());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => std::thread::sleep(RETRY_SLEEP),
                Some(libc::EINTR) => continue,
                _ => return Err(self.os_err("mq_send")),
            }
        }
        Err(TransportError::Timeout {
            attempts: MAX_RETRIES,
        })
    }

    fn recv(&mut self, mut buf: RecvBuf<'_>) -> Result<usize> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }

        let mut scratch = [0u8; QUEUE_MSG_MAX];
        for _ in 0..MAX_RETRIES {
            // SAFETY: scratch is at least mq_msgsize bytes, as mq_receive requires.
            let n = unsafe {
                libc::mq_receive(
                    self.mqd,
                    scratch.as_mut_ptr().cast::<libc::c_char>(),
                    QUEUE_MSG_MAX,
                    std::ptr::null_mut(),
                )
            };
            if n >= 0 {
                trace!(name = %self.name, bytes = n, "queue recv");
                return buf.fill(&scratch[..n as usize]);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => std::thread::sleep(RETRY_SLEEP),
                Some(libc::EINTR) => continue,
                _ => return Err(self.os_err("mq_receive")),
            }
        }
        Err(TransportError::Timeout {
            attempts: MAX_RETRIES,
        })
    }

    fn pending(&mut self) -> Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        // SAFETY: mqd is open and attr is a valid out-pointer.
        let rc = unsafe { libc::mq_getattr(self.mqd, &mut attr) };
        if rc != 0 {
            return Err(self.os_err("mq_getattr"));
        }
        Ok(attr.mq_curmsgs as usize)
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        // SAFETY: mqd is open; it is invalidated immediately after.
        unsafe { libc::mq_close(self.mqd) };
        self.mqd = -1;

        let unlink = match self.cleanup {
            Cleanup::IfCreator => self.owner,
            Cleanup::Never => false,
            Cleanup::Always => true,
        };
        if unlink {
            if let Ok(cname) = CString::new(self.name.as_bytes()) {
                // SAFETY: valid NUL-terminated queue name.
                unsafe { libc::mq_unlink(cname.as_ptr()) };
            }
            debug!(name = %self.name, "unlinked message queue");
        }
        Ok(())
    }
}

impl Drop for QueueTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for QueueTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTransport")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .field("owner", &self.owner)
            .finish()
    }
}
