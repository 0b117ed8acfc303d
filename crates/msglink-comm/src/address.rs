//! Channel address resolution through the process environment.
//!
//! A channel named `n` publishes its address as `n_OUT` on the producing side
//! and `n_IN` on the consuming side. When a model name is configured via
//! `MSGLINK_MODEL_NAME`, model-qualified keys are consulted as a fallback,
//! both verbatim (`model:n_IN`) and with the colon escaped for environments
//! that cannot set such keys (`model_COLON_n_IN`).

use tracing::debug;

use msglink_transport::TransportKind;

use crate::error::{CommError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    pub fn suffix(self) -> &'static str {
        match self {
            Direction::Send => "_OUT",
            Direction::Recv => "_IN",
        }
    }
}

fn candidate_keys(name: &str, direction: Direction) -> Vec<String> {
    let plain = format!("{name}{}", direction.suffix());
    let mut keys = vec![plain.clone()];
    if let Ok(model) = std::env::var("MSGLINK_MODEL_NAME") {
        let qualified = format!("{model}:{plain}");
        keys.push(qualified.replace(':', "_COLON_"));
        keys.push(qualified);
    }
    keys
}

/// Look up the address registered for a channel, trying each candidate key.
pub fn resolve(name: &str, direction: Direction) -> Result<String> {
    let attempted = candidate_keys(name, direction);
    for key in &attempted {
        if let Ok(address) = std::env::var(key) {
            debug!(name, key = %key, address = %address, "address resolved");
            return Ok(address);
        }
    }
    Err(CommError::NoAddress {
        name: name.to_string(),
        attempted,
    })
}

/// Publish a freshly created channel's address for peers in child processes.
pub fn publish(name: &str, direction: Direction, address: &str) {
    let key = format!("{name}{}", direction.suffix());
    debug!(name, key = %key, address = %address, "address published");
    std::env::set_var(key, address);
}

/// Produce a new backend-appropriate address for a channel being created.
pub fn generate(kind: TransportKind, name: &str) -> Result<String> {
    match kind {
        #[cfg(target_os = "linux")]
        TransportKind::Queue => Ok(msglink_transport::QueueTransport::generate_name(name)),
        #[cfg(not(target_os = "linux"))]
        TransportKind::Queue => {
            Err(msglink_transport::TransportError::Unsupported("posix message queues").into())
        }
        TransportKind::Socket => crate::state::allocate_port(),
        TransportKind::File => {
            let stamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            let path = std::env::temp_dir().join(format!(
                "msglink-{name}-{}-{stamp}.log",
                std::process::id()
            ));
            Ok(path.to_string_lossy().into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_plain_key() {
        std::env::set_var("addrtest_plain_IN", "127.0.0.1:9999");
        assert_eq!(
            resolve("addrtest_plain", Direction::Recv).unwrap(),
            "127.0.0.1:9999"
        );
    }

    #[test]
    fn resolves_colon_escaped_key() {
        std::env::set_var("MSGLINK_MODEL_NAME", "modelA");
        std::env::set_var("modelA_COLON_addrtest_esc_OUT", "/queue-x");
        assert_eq!(
            resolve("addrtest_esc", Direction::Send).unwrap(),
            "/queue-x"
        );
    }

    #[test]
    fn missing_address_lists_keys_tried() {
        let err = resolve("addrtest_absent", Direction::Recv).unwrap_err();
        match err {
            CommError::NoAddress { name, attempted } => {
                assert_eq!(name, "addrtest_absent");
                assert!(attempted.contains(&"addrtest_absent_IN".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn publish_then_resolve_round_trips() {
        publish("addrtest_pub", Direction::Send, "/tmp/out.log");
        assert_eq!(
            resolve("addrtest_pub", Direction::Send).unwrap(),
            "/tmp/out.log"
        );
    }

    #[test]
    fn generated_file_addresses_are_unique() {
        let a = generate(TransportKind::File, "gen").unwrap();
        let b = generate(TransportKind::File, "gen").unwrap();
        assert_ne!(a, b);
    }
}
