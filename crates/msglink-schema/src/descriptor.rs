use serde::{Deserialize, Serialize};

use crate::error::{Result, SchemaError};

/// Scalar element kinds understood by the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    /// Signed integer, precision 8/16/32/64 bits.
    Int,
    /// Unsigned integer, precision 8/16/32/64 bits.
    Uint,
    /// IEEE 754 float, precision 32/64 bits.
    Float,
    /// Raw byte string; precision 0 means variable length.
    Bytes,
    /// UTF-8 text; precision 0 means variable length.
    Utf8,
}

impl ScalarKind {
    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Int => "int",
            ScalarKind::Uint => "uint",
            ScalarKind::Float => "float",
            ScalarKind::Bytes => "bytes",
            ScalarKind::Utf8 => "utf8",
        }
    }
}

/// Declares how an ordered list of values maps to an encoded body.
///
/// Descriptors are a closed sum type: every variant knows how many positional
/// value slots it consumes ([`TypeDescriptor::arity`]) and the serializer
/// walks the variants recursively. Descriptors serialize to JSON for header
/// interchange, e.g. `{"type":"scalar","kind":"float","precision":64}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypeDescriptor {
    /// Opaque bytes passed through untouched. Only valid at the top level.
    Direct,
    /// A single scalar value.
    Scalar {
        kind: ScalarKind,
        /// Precision in bits. `0` = variable length (bytes/utf8 only).
        precision: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        units: Option<String>,
    },
    /// Fixed-length one-dimensional array of numeric scalars.
    Array1d {
        kind: ScalarKind,
        precision: u32,
        len: usize,
    },
    /// Fixed-shape n-dimensional array stored as contiguous elements.
    ArrayNd {
        kind: ScalarKind,
        precision: u32,
        shape: Vec<usize>,
    },
    /// Named members encoded in declaration order.
    Object { fields: Vec<(String, TypeDescriptor)> },
    /// Positional members encoded in order.
    Tuple { items: Vec<TypeDescriptor> },
}

impl TypeDescriptor {
    /// Number of positional value slots this descriptor consumes or produces.
    pub fn arity(&self) -> usize {
        match self {
            TypeDescriptor::Direct
            | TypeDescriptor::Scalar { .. }
            | TypeDescriptor::Array1d { .. }
            | TypeDescriptor::ArrayNd { .. } => 1,
            TypeDescriptor::Object { fields } => fields.iter().map(|(_, d)| d.arity()).sum(),
            TypeDescriptor::Tuple { items } => items.iter().map(TypeDescriptor::arity).sum(),
        }
    }

    /// Validate precisions and structural constraints.
    ///
    /// Called once at [`crate::Serializer::new`], not per encode.
    pub fn validate(&self) -> Result<()> {
        self.validate_at(true)
    }

    fn validate_at(&self, top_level: bool) -> Result<()> {
        match self {
            TypeDescriptor::Direct => {
                if !top_level {
                    return Err(SchemaError::DirectNotTopLevel);
                }
                Ok(())
            }
            TypeDescriptor::Scalar {
                kind, precision, ..
            } => validate_precision(*kind, *precision, true),
            TypeDescriptor::Array1d {
                kind, precision, ..
            }
            | TypeDescriptor::ArrayNd {
                kind, precision, ..
            } => {
                if matches!(kind, ScalarKind::Bytes | ScalarKind::Utf8) {
                    return Err(SchemaError::BadPrecision {
                        kind: kind.name(),
                        precision: *precision,
                    });
                }
                validate_precision(*kind, *precision, false)
            }
            TypeDescriptor::Object { fields } => {
                for (_, field) in fields {
                    field.validate_at(false)?;
                }
                Ok(())
            }
            TypeDescriptor::Tuple { items } => {
                for item in items {
                    item.validate_at(false)?;
                }
                Ok(())
            }
        }
    }

    /// Total element count of an n-dimensional shape. Shapes arrive from
    /// peers, so the product is checked rather than trusted.
    pub(crate) fn shape_len(shape: &[usize]) -> Result<usize> {
        shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(|| SchemaError::ShapeOverflow {
                shape: shape.to_vec(),
            })
    }

    /// Parse a descriptor from its JSON interchange form.
    pub fn from_json(json: &str) -> Result<Self> {
        let descriptor: TypeDescriptor = serde_json::from_str(json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Encode a descriptor to its JSON interchange form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn validate_precision(kind: ScalarKind, precision: u32, allow_variable: bool) -> Result<()> {
    let ok = match kind {
        ScalarKind::Int | ScalarKind::Uint => matches!(precision, 8 | 16 | 32 | 64),
        ScalarKind::Float => matches!(precision, 32 | 64),
        ScalarKind::Bytes | ScalarKind::Utf8 => {
            allow_variable && (precision == 0 || precision % 8 == 0)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(SchemaError::BadPrecision {
            kind: kind.name(),
            precision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(kind: ScalarKind, precision: u32) -> TypeDescriptor {
        TypeDescriptor::Scalar {
            kind,
            precision,
            units: None,
        }
    }

    #[test]
    fn leaf_arity_is_one() {
        assert_eq!(TypeDescriptor::Direct.arity(), 1);
        assert_eq!(scalar(ScalarKind::Int, 32).arity(), 1);
        assert_eq!(
            TypeDescriptor::Array1d {
                kind: ScalarKind::Float,
                precision: 64,
                len: 3
            }
            .arity(),
            1
        );
    }

    #[test]
    fn composite_arity_sums_members() {
        let desc = TypeDescriptor::Object {
            fields: vec![
                ("a".to_string(), scalar(ScalarKind::Int, 32)),
                (
                    "b".to_string(),
                    TypeDescriptor::Tuple {
                        items: vec![scalar(ScalarKind::Float, 64), scalar(ScalarKind::Utf8, 0)],
                    },
                ),
            ],
        };
        assert_eq!(desc.arity(), 3);
    }

    #[test]
    fn rejects_bad_precisions() {
        assert!(scalar(ScalarKind::Int, 12).validate().is_err());
        assert!(scalar(ScalarKind::Float, 16).validate().is_err());
        assert!(scalar(ScalarKind::Int, 0).validate().is_err());
        assert!(scalar(ScalarKind::Bytes, 0).validate().is_ok());
        assert!(scalar(ScalarKind::Utf8, 48).validate().is_ok());
    }

    #[test]
    fn rejects_nested_direct() {
        let desc = TypeDescriptor::Tuple {
            items: vec![TypeDescriptor::Direct],
        };
        assert!(matches!(
            desc.validate(),
            Err(SchemaError::DirectNotTopLevel)
        ));
    }

    #[test]
    fn rejects_byte_arrays() {
        let desc = TypeDescriptor::Array1d {
            kind: ScalarKind::Bytes,
            precision: 0,
            len: 4,
        };
        assert!(matches!(
            desc.validate(),
            Err(SchemaError::BadPrecision { .. })
        ));
    }

    #[test]
    fn json_interchange_roundtrip() {
        let desc = TypeDescriptor::Object {
            fields: vec![
                (
                    "temperature".to_string(),
                    TypeDescriptor::Scalar {
                        kind: ScalarKind::Float,
                        precision: 64,
                        units: Some("K".to_string()),
                    },
                ),
                (
                    "samples".to_string(),
                    TypeDescriptor::Array1d {
                        kind: ScalarKind::Int,
                        precision: 32,
                        len: 8,
                    },
                ),
            ],
        };

        let json = desc.to_json().unwrap();
        let parsed = TypeDescriptor::from_json(&json).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn scalar_json_shape_is_stable() {
        let json = scalar(ScalarKind::Float, 64).to_json().unwrap();
        assert_eq!(json, r#"{"type":"scalar","kind":"float","precision":64}"#);
    }

    #[test]
    fn from_json_validates() {
        let err = TypeDescriptor::from_json(r#"{"type":"scalar","kind":"int","precision":13}"#);
        assert!(matches!(err, Err(SchemaError::BadPrecision { .. })));
    }
}
