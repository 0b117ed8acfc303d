//! Process-wide runtime state.
//!
//! Three independent lock domains live here so unrelated operations never
//! contend: the open-channel registry, the cached reply connections used for
//! socket delivery confirmation, and the port allocator. Each is guarded by
//! its own mutex and accessed only through the functions below.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, warn};

use msglink_transport::{connect_reply, send_confirmation, TransportKind, ACK, CLOSE, PURGE};

use crate::error::Result;

/// One entry in the open-channel registry, kept for diagnostics and so that
/// shutdown can report channels that were never closed.
#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub name: String,
    pub kind: TransportKind,
    pub address: String,
}

struct PortAllocator {
    base: Option<u16>,
    next_offset: u16,
}

impl PortAllocator {
    fn allocate(&mut self) -> Result<String> {
        match self.base {
            Some(base) => {
                let port = base + self.next_offset;
                self.next_offset += 1;
                Ok(format!("127.0.0.1:{port}"))
            }
            None => {
                // No configured range: ask the OS for a free port and release
                // it again so the eventual receiver can bind it.
                let probe = TcpListener::bind("127.0.0.1:0")
                    .map_err(msglink_transport::TransportError::Io)?;
                let port = probe
                    .local_addr()
                    .map_err(msglink_transport::TransportError::Io)?
                    .port();
                Ok(format!("127.0.0.1:{port}"))
            }
        }
    }
}

struct ProcessState {
    channels: Mutex<HashMap<u64, ChannelEntry>>,
    replies: Mutex<HashMap<String, TcpStream>>,
    ports: Mutex<PortAllocator>,
    threading: AtomicBool,
    shut_down: AtomicBool,
    next_id: AtomicU64,
    next_token: AtomicU64,
}

static STATE: OnceLock<ProcessState> = OnceLock::new();

fn state() -> &'static ProcessState {
    STATE.get_or_init(|| {
        let base = std::env::var("MSGLINK_PORT_BASE")
            .ok()
            .and_then(|v| v.parse().ok());
        ProcessState {
            channels: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            ports: Mutex::new(PortAllocator {
                base,
                next_offset: 0,
            }),
            threading: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        }
    })
}

/// Initialise the runtime. Idempotent; a later call may enable threading.
pub fn init(threading: bool) {
    let st = state();
    st.shut_down.store(false, Ordering::SeqCst);
    if threading {
        st.threading.store(true, Ordering::SeqCst);
    }
    debug!(threading, "runtime initialised");
}

/// Whether sharing channels across threads has been enabled.
pub fn threading_enabled() -> bool {
    state().threading.load(Ordering::SeqCst)
}

/// Tear down process-wide resources. Safe to call more than once; only the
/// first call after init does any work.
pub fn shutdown() {
    let st = state();
    if st.shut_down.swap(true, Ordering::SeqCst) {
        return;
    }

    let mut replies = st.replies.lock().unwrap();
    for (address, mut conn) in replies.drain() {
        if let Err(err) = send_confirmation(&mut conn, CLOSE) {
            debug!(address = %address, error = %err, "reply channel already gone");
        }
    }
    drop(replies);

    let channels = st.channels.lock().unwrap();
    for entry in channels.values() {
        warn!(
            name = %entry.name,
            kind = ?entry.kind,
            address = %entry.address,
            "channel still open at shutdown"
        );
    }
    debug!(open = channels.len(), "runtime shut down");
}

/// Record an open channel; the returned token deregisters it exactly once.
pub fn register_channel(entry: ChannelEntry) -> u64 {
    let st = state();
    let token = st.next_token.fetch_add(1, Ordering::Relaxed);
    st.channels.lock().unwrap().insert(token, entry);
    token
}

pub fn deregister_channel(token: u64) {
    state().channels.lock().unwrap().remove(&token);
}

/// Number of channels currently registered.
pub fn open_channels() -> usize {
    state().channels.lock().unwrap().len()
}

/// Monotonic message id, unique within the process.
pub fn next_message_id() -> String {
    format!("m{}", state().next_id.fetch_add(1, Ordering::Relaxed))
}

/// Monotonic request id for RPC correlation.
pub fn next_request_id() -> String {
    format!("r{}", state().next_id.fetch_add(1, Ordering::Relaxed))
}

/// Allocate a loopback address for a new socket channel.
pub fn allocate_port() -> Result<String> {
    state().ports.lock().unwrap().allocate()
}

fn with_reply<F>(address: &str, byte: u8, f: F) -> Result<()>
where
    F: FnOnce(&mut HashMap<String, TcpStream>),
{
    let st = state();
    let mut replies = st.replies.lock().unwrap();
    if !replies.contains_key(address) {
        let conn = connect_reply(address)?;
        replies.insert(address.to_string(), conn);
    }
    let conn = replies.get_mut(address).unwrap();
    send_confirmation(conn, byte)?;
    f(&mut replies);
    Ok(())
}

/// Confirm delivery of one message back to its sender.
pub fn confirm_delivery(address: &str) -> Result<()> {
    with_reply(address, ACK, |_| {})
}

/// Tell a sender to discard its outstanding-confirmation accounting.
pub fn purge_sender(address: &str) -> Result<()> {
    with_reply(address, PURGE, |_| {})
}

/// Tell a sender this receiver is going away, then drop the connection.
pub fn notify_close(address: &str) -> Result<()> {
    with_reply(address, CLOSE, |replies| {
        replies.remove(address);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = next_message_id();
        let b = next_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with('m'));
        assert!(next_request_id().starts_with('r'));
    }

    #[test]
    fn registry_tokens_deregister_once() {
        let before = open_channels();
        let token = register_channel(ChannelEntry {
            name: "probe".to_string(),
            kind: TransportKind::File,
            address: "/tmp/probe".to_string(),
        });
        assert_eq!(open_channels(), before + 1);
        deregister_channel(token);
        deregister_channel(token);
        assert_eq!(open_channels(), before);
    }

    #[test]
    fn allocator_hands_out_loopback_addresses() {
        let addr = allocate_port().unwrap();
        assert!(addr.starts_with("127.0.0.1:"));
    }

    // Serializes the tests that touch the process-wide reply cache.
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn reply_cache_reuses_one_connection_for_control_bytes() {
        use std::io::Read;

        let _guard = TEST_GUARD.lock().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let reader = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        confirm_delivery(&address).unwrap();
        purge_sender(&address).unwrap();
        notify_close(&address).unwrap();
        assert_eq!(reader.join().unwrap(), [ACK, PURGE, CLOSE]);
    }

    #[test]
    fn init_latches_threading_on() {
        let _guard = TEST_GUARD.lock().unwrap();
        init(true);
        assert!(threading_enabled());
        init(false);
        assert!(threading_enabled());
    }
}
