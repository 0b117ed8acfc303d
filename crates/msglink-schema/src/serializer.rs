use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::descriptor::{ScalarKind, TypeDescriptor};
use crate::error::{Result, SchemaError};
use crate::value::Value;

/// Encodes and decodes ordered value lists according to an owned descriptor.
///
/// The serializer owns its descriptor because encoding can adjust it:
/// variable-precision bytes/text slots widen the recorded precision the first
/// time a larger-than-declared value is encoded, so later encodes from the
/// same instance reflect the widened size.
#[derive(Debug, Clone)]
pub struct Serializer {
    descriptor: TypeDescriptor,
}

impl Serializer {
    /// Create a serializer, validating the descriptor once up front.
    pub fn new(descriptor: TypeDescriptor) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self { descriptor })
    }

    /// The current descriptor (reflects any precision widening).
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    /// Number of value slots this serializer consumes and produces.
    pub fn arity(&self) -> usize {
        self.descriptor.arity()
    }

    /// Encode a value list into a body.
    ///
    /// Arity is checked before any byte is written; a mismatch never leaves a
    /// partial body behind.
    pub fn encode(&mut self, values: &[Value]) -> Result<Bytes> {
        let expected = self.descriptor.arity();
        if values.len() != expected {
            return Err(SchemaError::ArityMismatch {
                expected,
                actual: values.len(),
            });
        }

        let mut out = BytesMut::new();
        let mut slot = 0usize;
        encode_node(&mut self.descriptor, values, &mut slot, &mut out)?;
        trace!(slots = values.len(), bytes = out.len(), "encoded body");
        Ok(out.freeze())
    }

    /// Decode a body into a value list.
    ///
    /// The body must be consumed exactly: short bodies and trailing bytes are
    /// both hard errors, never partial results.
    pub fn decode(&self, body: &[u8]) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(self.descriptor.arity());
        let mut pos = 0usize;
        decode_node(&self.descriptor, body, &mut pos, &mut out)?;
        if pos != body.len() {
            return Err(SchemaError::TrailingBytes {
                remaining: body.len() - pos,
            });
        }
        Ok(out)
    }
}

fn encode_node(
    desc: &mut TypeDescriptor,
    values: &[Value],
    slot: &mut usize,
    out: &mut BytesMut,
) -> Result<()> {
    match desc {
        TypeDescriptor::Direct => {
            let Value::Bytes(raw) = take(values, slot)? else {
                return Err(mismatch(*slot - 1, "bytes"));
            };
            out.put_slice(raw);
            Ok(())
        }
        TypeDescriptor::Scalar {
            kind, precision, ..
        } => encode_scalar(*kind, precision, take(values, slot)?, *slot - 1, out),
        TypeDescriptor::Array1d {
            kind,
            precision,
            len,
        } => encode_array(*kind, *precision, *len, take(values, slot)?, *slot - 1, out),
        TypeDescriptor::ArrayNd {
            kind,
            precision,
            shape,
        } => {
            let len = TypeDescriptor::shape_len(shape)?;
            encode_array(*kind, *precision, len, take(values, slot)?, *slot - 1, out)
        }
        TypeDescriptor::Object { fields } => {
            for (_, field) in fields {
                encode_node(field, values, slot, out)?;
            }
            Ok(())
        }
        TypeDescriptor::Tuple { items } => {
            for item in items {
                encode_node(item, values, slot, out)?;
            }
            Ok(())
        }
    }
}

fn encode_scalar(
    kind: ScalarKind,
    precision: &mut u32,
    value: &Value,
    slot: usize,
    out: &mut BytesMut,
) -> Result<()> {
    match kind {
        ScalarKind::Int => {
            let Value::Int(v) = value else {
                return Err(mismatch(slot, "int"));
            };
            put_int(*v, *precision, out)
        }
        ScalarKind::Uint => {
            let Value::Uint(v) = value else {
                return Err(mismatch(slot, "uint"));
            };
            put_uint(*v, *precision, out)
        }
        ScalarKind::Float => {
            let Value::Float(v) = value else {
                return Err(mismatch(slot, "float"));
            };
            put_float(*v, *precision, out);
            Ok(())
        }
        ScalarKind::Bytes => {
            let Value::Bytes(raw) = value else {
                return Err(mismatch(slot, "bytes"));
            };
            widen(precision, raw.len());
            put_var(raw, out);
            Ok(())
        }
        ScalarKind::Utf8 => {
            let Value::Text(text) = value else {
                return Err(mismatch(slot, "text"));
            };
            widen(precision, text.len());
            put_var(text.as_bytes(), out);
            Ok(())
        }
    }
}

fn encode_array(
    kind: ScalarKind,
    precision: u32,
    expected_len: usize,
    value: &Value,
    slot: usize,
    out: &mut BytesMut,
) -> Result<()> {
    match (kind, value) {
        (ScalarKind::Int, Value::IntArray(items)) => {
            check_len(expected_len, items.len())?;
            for v in items {
                put_int(*v, precision, out)?;
            }
            Ok(())
        }
        (ScalarKind::Uint, Value::UintArray(items)) => {
            check_len(expected_len, items.len())?;
            for v in items {
                put_uint(*v, precision, out)?;
            }
            Ok(())
        }
        (ScalarKind::Float, Value::FloatArray(items)) => {
            check_len(expected_len, items.len())?;
            for v in items {
                put_float(*v, precision, out);
            }
            Ok(())
        }
        (ScalarKind::Int, _) => Err(mismatch(slot, "int array")),
        (ScalarKind::Uint, _) => Err(mismatch(slot, "uint array")),
        (ScalarKind::Float, _) => Err(mismatch(slot, "float array")),
        // validate() rejects bytes/utf8 array kinds before encode is reachable
        (ScalarKind::Bytes | ScalarKind::Utf8, _) => Err(SchemaError::BadPrecision {
            kind: kind.name(),
            precision,
        }),
    }
}

fn decode_node(
    desc: &TypeDescriptor,
    body: &[u8],
    pos: &mut usize,
    out: &mut Vec<Value>,
) -> Result<()> {
    match desc {
        TypeDescriptor::Direct => {
            out.push(Value::Bytes(body[*pos..].to_vec()));
            *pos = body.len();
            Ok(())
        }
        TypeDescriptor::Scalar {
            kind, precision, ..
        } => {
            let value = decode_scalar(*kind, *precision, body, pos)?;
            out.push(value);
            Ok(())
        }
        TypeDescriptor::Array1d {
            kind,
            precision,
            len,
        } => {
            out.push(decode_array(*kind, *precision, *len, body, pos)?);
            Ok(())
        }
        TypeDescriptor::ArrayNd {
            kind,
            precision,
            shape,
        } => {
            let len = TypeDescriptor::shape_len(shape)?;
            out.push(decode_array(*kind, *precision, len, body, pos)?);
            Ok(())
        }
        TypeDescriptor::Object { fields } => {
            for (_, field) in fields {
                decode_node(field, body, pos, out)?;
            }
            Ok(())
        }
        TypeDescriptor::Tuple { items } => {
            for item in items {
                decode_node(item, body, pos, out)?;
            }
            Ok(())
        }
    }
}

fn decode_scalar(kind: ScalarKind, precision: u32, body: &[u8], pos: &mut usize) -> Result<Value> {
    match kind {
        ScalarKind::Int => Ok(Value::Int(get_int(precision, body, pos)?)),
        ScalarKind::Uint => Ok(Value::Uint(get_uint(precision, body, pos)?)),
        ScalarKind::Float => Ok(Value::Float(get_float(precision, body, pos)?)),
        ScalarKind::Bytes => Ok(Value::Bytes(get_var(body, pos)?)),
        ScalarKind::Utf8 => Ok(Value::Text(String::from_utf8(get_var(body, pos)?)?)),
    }
}

fn decode_array(
    kind: ScalarKind,
    precision: u32,
    len: usize,
    body: &[u8],
    pos: &mut usize,
) -> Result<Value> {
    // Adopted peer descriptors may declare any length; bound the allocation
    // by what the body can actually hold before reserving anything.
    let elem = (precision / 8) as usize;
    let remaining = body.len() - *pos;
    if len.saturating_mul(elem) > remaining {
        return Err(SchemaError::Truncated {
            offset: *pos,
            needed: len.saturating_mul(elem) - remaining,
        });
    }
    match kind {
        ScalarKind::Int => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(get_int(precision, body, pos)?);
            }
            Ok(Value::IntArray(items))
        }
        ScalarKind::Uint => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(get_uint(precision, body, pos)?);
            }
            Ok(Value::UintArray(items))
        }
        ScalarKind::Float => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(get_float(precision, body, pos)?);
            }
            Ok(Value::FloatArray(items))
        }
        ScalarKind::Bytes | ScalarKind::Utf8 => Err(SchemaError::BadPrecision {
            kind: kind.name(),
            precision,
        }),
    }
}

fn widen(precision: &mut u32, byte_len: usize) {
    let bits = (byte_len as u32).saturating_mul(8);
    if bits > *precision {
        *precision = bits;
    }
}

fn put_int(v: i64, precision: u32, out: &mut BytesMut) -> Result<()> {
    match precision {
        8 => {
            let v = int_in_range::<i8>(v, precision)?;
            out.put_i8(v as i8);
        }
        16 => {
            int_in_range::<i16>(v, precision)?;
            out.put_i16_le(v as i16);
        }
        32 => {
            int_in_range::<i32>(v, precision)?;
            out.put_i32_le(v as i32);
        }
        _ => out.put_i64_le(v),
    }
    Ok(())
}

fn int_in_range<T>(v: i64, precision: u32) -> Result<i64>
where
    T: TryFrom<i64>,
{
    if T::try_from(v).is_err() {
        return Err(SchemaError::OutOfRange {
            value: v as i128,
            kind: "int",
            precision,
        });
    }
    Ok(v)
}

fn put_uint(v: u64, precision: u32, out: &mut BytesMut) -> Result<()> {
    let max = match precision {
        8 => u8::MAX as u64,
        16 => u16::MAX as u64,
        32 => u32::MAX as u64,
        _ => u64::MAX,
    };
    if v > max {
        return Err(SchemaError::OutOfRange {
            value: v as i128,
            kind: "uint",
            precision,
        });
    }
    match precision {
        8 => out.put_u8(v as u8),
        16 => out.put_u16_le(v as u16),
        32 => out.put_u32_le(v as u32),
        _ => out.put_u64_le(v),
    }
    Ok(())
}

fn put_float(v: f64, precision: u32, out: &mut BytesMut) {
    if precision == 32 {
        out.put_f32_le(v as f32);
    } else {
        out.put_f64_le(v);
    }
}

fn put_var(raw: &[u8], out: &mut BytesMut) {
    out.put_u64_le(raw.len() as u64);
    out.put_slice(raw);
}

fn get_bytes<'a>(body: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if body.len() - *pos < n {
        return Err(SchemaError::Truncated {
            offset: *pos,
            needed: n - (body.len() - *pos),
        });
    }
    let slice = &body[*pos..*pos + n];
    *pos += n;
    Ok(slice)
}

fn get_int(precision: u32, body: &[u8], pos: &mut usize) -> Result<i64> {
    Ok(match precision {
        8 => get_bytes(body, pos, 1)?[0] as i8 as i64,
        16 => i16::from_le_bytes(get_bytes(body, pos, 2)?.try_into().unwrap()) as i64,
        32 => i32::from_le_bytes(get_bytes(body, pos, 4)?.try_into().unwrap()) as i64,
        _ => i64::from_le_bytes(get_bytes(body, pos, 8)?.try_into().unwrap()),
    })
}

fn get_uint(precision: u32, body: &[u8], pos: &mut usize) -> Result<u64> {
    Ok(match precision {
        8 => get_bytes(body, pos, 1)?[0] as u64,
        16 => u16::from_le_bytes(get_bytes(body, pos, 2)?.try_into().unwrap()) as u64,
        32 => u32::from_le_bytes(get_bytes(body, pos, 4)?.try_into().unwrap()) as u64,
        _ => u64::from_le_bytes(get_bytes(body, pos, 8)?.try_into().unwrap()),
    })
}

fn get_float(precision: u32, body: &[u8], pos: &mut usize) -> Result<f64> {
    Ok(if precision == 32 {
        f32::from_le_bytes(get_bytes(body, pos, 4)?.try_into().unwrap()) as f64
    } else {
        f64::from_le_bytes(get_bytes(body, pos, 8)?.try_into().unwrap())
    })
}

fn get_var(body: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = u64::from_le_bytes(get_bytes(body, pos, 8)?.try_into().unwrap()) as usize;
    Ok(get_bytes(body, pos, len)?.to_vec())
}

fn take<'a>(values: &'a [Value], slot: &mut usize) -> Result<&'a Value> {
    // Arity is validated before the walk starts; a missing slot here would be
    // an internal inconsistency, reported as an arity error all the same.
    let value = values.get(*slot).ok_or(SchemaError::ArityMismatch {
        expected: *slot + 1,
        actual: values.len(),
    })?;
    *slot += 1;
    Ok(value)
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(SchemaError::LengthMismatch { expected, actual });
    }
    Ok(())
}

fn mismatch(slot: usize, expected: &'static str) -> SchemaError {
    SchemaError::ValueMismatch { slot, expected }
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

    fn roundtrip(desc: TypeDescriptor, values: Vec<Value>) {
        let mut serializer = Serializer::new(desc).unwrap();
        let body = serializer.encode(&values).unwrap();
        let decoded = serializer.decode(&body).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn scalar_int32_roundtrip() {
        roundtrip(scalar(ScalarKind::Int, 32), vec![Value::Int(42)]);
    }

    #[test]
    fn scalar_variants_roundtrip() {
        roundtrip(scalar(ScalarKind::Int, 8), vec![Value::Int(-5)]);
        roundtrip(scalar(ScalarKind::Uint, 16), vec![Value::Uint(65535)]);
        roundtrip(scalar(ScalarKind::Float, 64), vec![Value::Float(2.75)]);
        roundtrip(scalar(ScalarKind::Float, 32), vec![Value::Float(1.5)]);
        roundtrip(
            scalar(ScalarKind::Bytes, 0),
            vec![Value::Bytes(vec![0, 1, 255])],
        );
        roundtrip(scalar(ScalarKind::Utf8, 0), vec![Value::Text("héllo".into())]);
    }

    #[test]
    fn array1d_float64_roundtrip() {
        roundtrip(
            TypeDescriptor::Array1d {
                kind: ScalarKind::Float,
                precision: 64,
                len: 3,
            },
            vec![Value::FloatArray(vec![1.0, 2.0, 3.0])],
        );
    }

    #[test]
    fn array_nd_roundtrip() {
        roundtrip(
            TypeDescriptor::ArrayNd {
                kind: ScalarKind::Int,
                precision: 16,
                shape: vec![2, 3],
            },
            vec![Value::IntArray(vec![1, 2, 3, 4, 5, 6])],
        );
    }

    #[test]
    fn object_preserves_declaration_order() {
        let desc = TypeDescriptor::Object {
            fields: vec![
                ("name".to_string(), scalar(ScalarKind::Utf8, 0)),
                ("count".to_string(), scalar(ScalarKind::Uint, 32)),
                ("mean".to_string(), scalar(ScalarKind::Float, 64)),
            ],
        };
        roundtrip(
            desc,
            vec![
                Value::Text("left".to_string()),
                Value::Uint(12),
                Value::Float(0.5),
            ],
        );
    }

    #[test]
    fn tuple_roundtrip() {
        let desc = TypeDescriptor::Tuple {
            items: vec![
                scalar(ScalarKind::Int, 64),
                TypeDescriptor::Array1d {
                    kind: ScalarKind::Uint,
                    precision: 8,
                    len: 4,
                },
            ],
        };
        roundtrip(
            desc,
            vec![Value::Int(-9), Value::UintArray(vec![1, 2, 3, 4])],
        );
    }

    #[test]
    fn direct_passes_bytes_through() {
        let mut serializer = Serializer::new(TypeDescriptor::Direct).unwrap();
        let body = serializer
            .encode(&[Value::Bytes(b"opaque payload".to_vec())])
            .unwrap();
        assert_eq!(body.as_ref(), b"opaque payload");
        let decoded = serializer.decode(&body).unwrap();
        assert_eq!(decoded, vec![Value::Bytes(b"opaque payload".to_vec())]);
    }

    #[test]
    fn arity_mismatch_is_hard_error() {
        let mut serializer = Serializer::new(scalar(ScalarKind::Int, 32)).unwrap();
        let err = serializer
            .encode(&[Value::Int(1), Value::Int(2)])
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::ArityMismatch {
                expected: 1,
                actual: 2
            }
        ));

        let err = serializer.encode(&[]).unwrap_err();
        assert!(matches!(err, SchemaError::ArityMismatch { .. }));
    }

    #[test]
    fn arity_checked_for_composites() {
        let desc = TypeDescriptor::Tuple {
            items: vec![scalar(ScalarKind::Int, 32), scalar(ScalarKind::Float, 64)],
        };
        let mut serializer = Serializer::new(desc).unwrap();
        assert!(serializer
            .encode(&[Value::Int(1), Value::Float(2.0)])
            .is_ok());
        assert!(matches!(
            serializer.encode(&[Value::Int(1)]).unwrap_err(),
            SchemaError::ArityMismatch { .. }
        ));
    }

    #[test]
    fn value_kind_mismatch_rejected() {
        let mut serializer = Serializer::new(scalar(ScalarKind::Int, 32)).unwrap();
        let err = serializer.encode(&[Value::Float(1.0)]).unwrap_err();
        assert!(matches!(err, SchemaError::ValueMismatch { slot: 0, .. }));
    }

    #[test]
    fn out_of_range_int_rejected() {
        let mut serializer = Serializer::new(scalar(ScalarKind::Int, 8)).unwrap();
        let err = serializer.encode(&[Value::Int(300)]).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfRange { .. }));

        let mut serializer = Serializer::new(scalar(ScalarKind::Uint, 16)).unwrap();
        let err = serializer.encode(&[Value::Uint(70_000)]).unwrap_err();
        assert!(matches!(err, SchemaError::OutOfRange { .. }));
    }

    #[test]
    fn array_length_mismatch_rejected() {
        let desc = TypeDescriptor::Array1d {
            kind: ScalarKind::Float,
            precision: 64,
            len: 3,
        };
        let mut serializer = Serializer::new(desc).unwrap();
        let err = serializer
            .encode(&[Value::FloatArray(vec![1.0, 2.0])])
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaError::LengthMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn variable_precision_widens_on_larger_value() {
        let mut serializer = Serializer::new(scalar(ScalarKind::Bytes, 32)).unwrap();

        serializer.encode(&[Value::Bytes(vec![0; 16])]).unwrap();
        match serializer.descriptor() {
            TypeDescriptor::Scalar { precision, .. } => assert_eq!(*precision, 128),
            other => panic!("unexpected descriptor {other:?}"),
        }

        // Smaller values leave the widened precision alone.
        serializer.encode(&[Value::Bytes(vec![0; 2])]).unwrap();
        match serializer.descriptor() {
            TypeDescriptor::Scalar { precision, .. } => assert_eq!(*precision, 128),
            other => panic!("unexpected descriptor {other:?}"),
        }
    }

    #[test]
    fn truncated_body_rejected() {
        let mut serializer = Serializer::new(scalar(ScalarKind::Int, 64)).unwrap();
        let body = serializer.encode(&[Value::Int(7)]).unwrap();
        let err = serializer.decode(&body[..4]).unwrap_err();
        assert!(matches!(err, SchemaError::Truncated { .. }));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut serializer = Serializer::new(scalar(ScalarKind::Int, 32)).unwrap();
        let body = serializer.encode(&[Value::Int(7)]).unwrap();
        let mut extended = body.to_vec();
        extended.push(0xFF);
        let err = serializer.decode(&extended).unwrap_err();
        assert!(matches!(err, SchemaError::TrailingBytes { remaining: 1 }));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let serializer = Serializer::new(scalar(ScalarKind::Utf8, 0)).unwrap();
        let mut body = BytesMut::new();
        put_var(&[0xFF, 0xFE], &mut body);
        let err = serializer.decode(&body).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidUtf8(_)));
    }

    #[test]
    fn overflowing_shape_rejected() {
        let serializer = Serializer::new(TypeDescriptor::ArrayNd {
            kind: ScalarKind::Float,
            precision: 64,
            shape: vec![usize::MAX, usize::MAX],
        })
        .unwrap();
        let err = serializer.decode(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, SchemaError::ShapeOverflow { .. }));
    }

    #[test]
    fn absurd_declared_length_fails_before_allocating() {
        let serializer = Serializer::new(TypeDescriptor::ArrayNd {
            kind: ScalarKind::Uint,
            precision: 64,
            shape: vec![1usize << 40, 1usize << 20],
        })
        .unwrap();
        let err = serializer.decode(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, SchemaError::Truncated { .. }));
    }
}
