/// Errors that can occur while validating descriptors or encoding/decoding values.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The number of supplied values does not match the descriptor arity.
    #[error("arity mismatch: descriptor consumes {expected} values, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// An array value has a different element count than the descriptor declares.
    #[error("array length mismatch: descriptor declares {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A value slot holds a different variant than the descriptor expects.
    #[error("value mismatch at slot {slot}: expected {expected}")]
    ValueMismatch { slot: usize, expected: &'static str },

    /// The descriptor declares a precision invalid for its scalar kind.
    #[error("invalid precision {precision} bits for {kind} scalar")]
    BadPrecision { kind: &'static str, precision: u32 },

    /// An integer value does not fit the declared precision.
    #[error("value {value} out of range for {precision}-bit {kind}")]
    OutOfRange {
        value: i128,
        kind: &'static str,
        precision: u32,
    },

    /// An n-dimensional shape's element count overflows `usize`.
    #[error("array shape {shape:?} overflows the addressable element count")]
    ShapeOverflow { shape: Vec<usize> },

    /// A `Direct` descriptor appeared inside a composite.
    #[error("direct (opaque bytes) descriptor is only valid at the top level")]
    DirectNotTopLevel,

    /// The body ended before all declared slots were decoded.
    #[error("body truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    /// Bytes remained after the last declared slot was decoded.
    #[error("{remaining} trailing bytes after final value slot")]
    TrailingBytes { remaining: usize },

    /// A utf8 slot decoded to invalid UTF-8.
    #[error("invalid utf-8 in text slot: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Descriptor JSON interchange failed.
    #[error("descriptor json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
