//! Datagram boundaries over byte streams.
//!
//! TCP is a byte stream; the socket backend needs message boundaries before
//! the framing layer ever sees the bytes. Each datagram is:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────┐
//! │ Magic (2B)   │ Length    │ Payload           │
//! │ 0x4D 0x4C    │ (4B LE)   │ (Length bytes)    │
//! │ "ML"         │           │                   │
//! └──────────────┴───────────┴──────────────────┘
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Datagram header: magic (2) + length (4) = 6 bytes.
pub const DATAGRAM_HEADER: usize = 6;

/// Magic bytes: "ML" (0x4D 0x4C).
pub const MAGIC: [u8; 2] = [0x4D, 0x4C];

/// Encode one datagram into the wire buffer.
pub fn encode_datagram(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(TransportError::MessageTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(DATAGRAM_HEADER + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode one datagram from the stream buffer.
///
/// Returns `Ok(None)` until a complete datagram is buffered. On success,
/// consumes the datagram bytes from the buffer.
pub fn decode_datagram(src: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if src.len() < DATAGRAM_HEADER {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(TransportError::InvalidAddress(
            "stream desynchronized: bad datagram magic".to_string(),
        ));
    }

    let payload_len = u32::from_le_bytes(src[2..6].try_into().unwrap()) as usize;
    let total = DATAGRAM_HEADER + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(DATAGRAM_HEADER);
    let payload = src.split_to(payload_len).to_vec();
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut buf = BytesMut::new();
        encode_datagram(b"hello", &mut buf).unwrap();
        assert_eq!(buf.len(), DATAGRAM_HEADER + 5);

        let payload = decode_datagram(&mut buf).unwrap().unwrap();
        assert_eq!(payload, b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_header_needs_more() {
        let mut buf = BytesMut::from(&MAGIC[..]);
        assert!(decode_datagram(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_payload_needs_more() {
        let mut buf = BytesMut::new();
        encode_datagram(b"hello", &mut buf).unwrap();
        buf.truncate(DATAGRAM_HEADER + 2);
        assert!(decode_datagram(&mut buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic_is_error() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0, 0, 0, 0][..]);
        assert!(decode_datagram(&mut buf).is_err());
    }

    #[test]
    fn multiple_datagrams_in_sequence() {
        let mut buf = BytesMut::new();
        encode_datagram(b"first", &mut buf).unwrap();
        encode_datagram(b"", &mut buf).unwrap();
        encode_datagram(b"third", &mut buf).unwrap();

        assert_eq!(decode_datagram(&mut buf).unwrap().unwrap(), b"first");
        assert_eq!(decode_datagram(&mut buf).unwrap().unwrap(), b"");
        assert_eq!(decode_datagram(&mut buf).unwrap().unwrap(), b"third");
        assert!(buf.is_empty());
    }
}
