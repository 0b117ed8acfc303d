//! Typed inter-process messaging over queues, sockets, and files.
//!
//! msglink moves schema-described value lists between processes over
//! interchangeable transport backends, with self-delimited framing, large
//! messages split over auxiliary channels, and request/response correlation.
//!
//! # Crate Structure
//!
//! - [`transport`] — Backend endpoints (POSIX queues, TCP sockets, files)
//! - [`frame`] — Tag-delimited header framing and the end-of-channel sentinel
//! - [`schema`] — Type descriptors, value slots, and body serialization
//! - [`comm`] — Communicators, RPC correlation, and process-wide state

/// Re-export transport types.
pub mod transport {
    pub use msglink_transport::*;
}

/// Re-export framing types.
pub mod frame {
    pub use msglink_frame::*;
}

/// Re-export schema types.
pub mod schema {
    pub use msglink_schema::*;
}

/// Re-export communicator and RPC types.
pub mod comm {
    pub use msglink_comm::*;
}
