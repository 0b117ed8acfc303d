//! Type descriptors and schema-driven value serialization for msglink.
//!
//! A [`TypeDescriptor`] declares how an ordered list of [`Value`] slots maps
//! to and from an encoded message body. The [`Serializer`] owns a descriptor
//! and performs the walk in both directions. Descriptors travel between
//! processes as JSON inside frame headers, so a receiver can adopt the
//! sender's schema on first contact.

pub mod descriptor;
pub mod error;
pub mod serializer;
pub mod value;

pub use descriptor::{ScalarKind, TypeDescriptor};
pub use error::{Result, SchemaError};
pub use serializer::Serializer;
pub use value::Value;
