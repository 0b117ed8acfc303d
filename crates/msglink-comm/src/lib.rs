//! Typed channels and RPC correlation for msglink.
//!
//! The [`Communicator`] pairs one transport endpoint with a serializer and
//! the framing policy of the channel; [`RpcClient`] and [`RpcServer`] layer
//! request/response correlation on top. Process-wide concerns — the open
//! channel registry, cached delivery-confirmation connections, and port
//! allocation — live in [`state`] behind an explicit init/shutdown pair.

pub mod address;
pub mod comm;
pub mod error;
pub mod rpc;
pub mod state;

pub use address::Direction;
pub use comm::{CommConfig, CommRecv, Communicator};
pub use error::{CommError, Result};
pub use rpc::{RpcClient, RpcServer};
pub use state::{init, shutdown};
