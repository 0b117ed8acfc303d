/// Errors that can occur during frame encoding/parsing.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A start tag was found without a matching end tag.
    #[error("missing end tag (truncated header)")]
    MissingEndTag,

    /// The metadata between the tags could not be decoded.
    #[error("malformed header metadata: {0}")]
    MalformedHeader(String),

    /// The encoded metadata itself contains the delimiting tag literal.
    #[error("header metadata contains the frame tag literal")]
    TagInMetadata,

    /// The encoded header alone overflows the frame limit.
    ///
    /// Retryable by the caller with a pre-split body; never truncated here.
    #[error("frame too large: {header_len}-byte header exceeds {max}-byte frame limit")]
    FrameTooLarge { header_len: usize, max: usize },

    /// A split was requested without multipart marking.
    #[error("body does not fit the frame but header is not marked multipart with an address")]
    NotMultipart,

    /// Header JSON serialization failed.
    #[error("header json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
