//! Self-delimited header framing for msglink.
//!
//! Every framed message is `<TAG><json metadata><TAG><body bytes...>` where
//! `TAG` is a fixed literal token that must not occur in the metadata. A blob
//! with no recognizable tags is treated as a headerless raw body. A header
//! whose declared `size` exceeds the body bytes physically present marks a
//! multipart message; the remainder is fetched from the continuation address
//! the header carries.

pub mod codec;
pub mod error;
pub mod header;

pub use codec::{
    encode_header, format, is_eof, parse, probe_fit, DEFAULT_MAX_FRAME, EOF_SENTINEL, HEADER_TAG,
};
pub use error::{FrameError, Result};
pub use header::Header;
