use msglink_schema::TypeDescriptor;
use serde::{Deserialize, Serialize};

/// Frame metadata carried between the delimiting tags.
///
/// `size` is always the full logical body length across all parts; the bytes
/// physically present with one header never exceed it. When fewer bytes are
/// present, `multipart` is set and `address` names the channel carrying the
/// remainder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Header {
    /// Total logical body length across all parts.
    pub size: u64,
    /// Opaque message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Remaining parts follow on an auxiliary channel.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub multipart: bool,
    /// Continuation channel address (required when `multipart`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// RPC request correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Channel address the RPC response should be sent to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_address: Option<String>,
    /// Transport-specific delivery acknowledgement channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Inline type descriptor for the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datatype: Option<TypeDescriptor>,
    /// The descriptor travels with the first data chunk instead of inline.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub datatype_in_data: bool,
}

impl Header {
    /// Header for a single-frame body of the given length.
    pub fn for_body(size: usize) -> Self {
        Self {
            size: size as u64,
            ..Self::default()
        }
    }

    /// Header synthesized for a headerless raw body.
    pub(crate) fn raw_body(size: usize) -> Self {
        Self::for_body(size)
    }
}
