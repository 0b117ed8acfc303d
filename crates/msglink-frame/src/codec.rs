use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{FrameError, Result};
use crate::header::Header;

/// Delimiting tag literal. Starts and ends the metadata section.
///
/// The protocol's delimiting invariant: this token must not occur inside the
/// encoded metadata. Application bodies are unrestricted because the body is
/// located by offset, never by scanning.
pub const HEADER_TAG: &[u8] = b":MSGLINK_HEAD:";

/// Fixed sentinel body signaling channel close.
pub const EOF_SENTINEL: &[u8] = b"MSGLINK_EOF";

/// Default maximum single-frame size: 1 MiB.
pub const DEFAULT_MAX_FRAME: usize = 1_048_576;

/// Encode a header to its tag-delimited byte prefix.
pub fn encode_header(header: &Header) -> Result<Bytes> {
    let metadata = serde_json::to_vec(header)?;
    if find_tag(&metadata).is_some() {
        return Err(FrameError::TagInMetadata);
    }

    let mut out = BytesMut::with_capacity(2 * HEADER_TAG.len() + metadata.len());
    out.put_slice(HEADER_TAG);
    out.put_slice(&metadata);
    out.put_slice(HEADER_TAG);
    Ok(out.freeze())
}

/// How many body bytes fit alongside this header within `max_frame`.
///
/// Used as the first encoding pass when deciding whether a message must be
/// split: if the result is less than the body length, the caller creates a
/// continuation channel, marks the header multipart, and formats again.
pub fn probe_fit(header: &Header, body_len: usize, max_frame: usize) -> Result<usize> {
    let prefix = encode_header(header)?;
    if prefix.len() > max_frame {
        return Err(FrameError::FrameTooLarge {
            header_len: prefix.len(),
            max: max_frame,
        });
    }
    Ok(body_len.min(max_frame - prefix.len()))
}

/// Format a header plus as much of the body as fits into one frame.
///
/// Returns the frame and the count of body bytes it carries. If the body does
/// not fully fit, the header must already be marked multipart with a
/// continuation address; violating that is an error, never a silent truncation.
pub fn format(header: &Header, body: &[u8], max_frame: usize) -> Result<(Bytes, usize)> {
    let prefix = encode_header(header)?;
    if prefix.len() > max_frame {
        return Err(FrameError::FrameTooLarge {
            header_len: prefix.len(),
            max: max_frame,
        });
    }

    let included = body.len().min(max_frame - prefix.len());
    if included < body.len() && !(header.multipart && header.address.is_some()) {
        return Err(FrameError::NotMultipart);
    }

    let mut out = BytesMut::with_capacity(prefix.len() + included);
    out.put_slice(&prefix);
    out.put_slice(&body[..included]);
    trace!(
        header_len = prefix.len(),
        body_here = included,
        total = body.len(),
        multipart = header.multipart,
        "formatted frame"
    );
    Ok((out.freeze(), included))
}

/// Parse a received blob into its header and the span of body bytes present.
///
/// A blob with no recognizable tags is a headerless raw body: the synthesized
/// header covers the whole input and is not multipart. A start tag without an
/// end tag, or undecodable metadata between valid tags, is a hard error —
/// never a partial result.
pub fn parse(blob: &[u8]) -> Result<(Header, Range<usize>)> {
    if !blob.starts_with(HEADER_TAG) {
        return Ok((Header::raw_body(blob.len()), 0..blob.len()));
    }

    let metadata_start = HEADER_TAG.len();
    let metadata_len =
        find_tag(&blob[metadata_start..]).ok_or(FrameError::MissingEndTag)?;
    let metadata = &blob[metadata_start..metadata_start + metadata_len];

    let header: Header = serde_json::from_slice(metadata)
        .map_err(|err| FrameError::MalformedHeader(err.to_string()))?;

    let body_start = metadata_start + metadata_len + HEADER_TAG.len();
    let body_here = blob.len() - body_start;
    if (body_here as u64) > header.size {
        return Err(FrameError::MalformedHeader(format!(
            "{body_here} body bytes present but header declares size {}",
            header.size
        )));
    }

    Ok((header, body_start..blob.len()))
}

/// Whether a received blob is exactly the EOF sentinel.
pub fn is_eof(blob: &[u8]) -> bool {
    blob == EOF_SENTINEL
}

fn find_tag(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TAG.len())
        .position(|window| window == HEADER_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_roundtrip() {
        let body = b"hello, channel";
        let mut header = Header::for_body(body.len());
        header.id = Some("m-1".to_string());

        let (frame, included) = format(&header, body, DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(included, body.len());

        let (parsed, span) = parse(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&frame[span], body);
    }

    #[test]
    fn zero_length_body_is_valid() {
        let header = Header::for_body(0);
        let (frame, included) = format(&header, b"", DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(included, 0);

        let (parsed, span) = parse(&frame).unwrap();
        assert_eq!(parsed.size, 0);
        assert!(!parsed.multipart);
        assert!(span.is_empty());
    }

    #[test]
    fn untagged_blob_is_raw_body() {
        let blob = b"no tags here at all";
        let (header, span) = parse(blob).unwrap();
        assert_eq!(header.size, blob.len() as u64);
        assert!(!header.multipart);
        assert_eq!(&blob[span], blob.as_ref());
    }

    #[test]
    fn multipart_roundtrip_keeps_declared_size() {
        let body = vec![0x5A; 4096];
        let mut header = Header::for_body(body.len());
        header.multipart = true;
        header.address = Some("/msglink-aux".to_string());

        let (frame, included) = format(&header, &body, 512).unwrap();
        assert!(included < body.len());

        let (parsed, span) = parse(&frame).unwrap();
        assert_eq!(parsed.size, body.len() as u64);
        assert!(parsed.multipart);
        assert_eq!(parsed.address.as_deref(), Some("/msglink-aux"));
        assert_eq!(&frame[span], &body[..included]);
    }

    #[test]
    fn split_without_multipart_marking_rejected() {
        let body = vec![1u8; 4096];
        let header = Header::for_body(body.len());
        let err = format(&header, &body, 256).unwrap_err();
        assert!(matches!(err, FrameError::NotMultipart));
    }

    #[test]
    fn probe_fit_matches_format() {
        let body = vec![7u8; 1000];
        let header = Header::for_body(body.len());
        let fit = probe_fit(&header, body.len(), DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(fit, body.len());

        let tight = probe_fit(&header, body.len(), 128).unwrap();
        assert!(tight < body.len());
        let prefix = encode_header(&header).unwrap();
        assert_eq!(tight, 128 - prefix.len());
    }

    #[test]
    fn header_alone_overflowing_limit_is_error() {
        let header = Header::for_body(10);
        let err = format(&header, b"0123456789", 8).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[test]
    fn missing_end_tag_is_error() {
        let mut blob = Vec::new();
        blob.extend_from_slice(HEADER_TAG);
        blob.extend_from_slice(br#"{"size":4}"#);
        let err = parse(&blob).unwrap_err();
        assert!(matches!(err, FrameError::MissingEndTag));
    }

    #[test]
    fn malformed_metadata_is_error() {
        let mut blob = Vec::new();
        blob.extend_from_slice(HEADER_TAG);
        blob.extend_from_slice(b"{not-json");
        blob.extend_from_slice(HEADER_TAG);
        let err = parse(&blob).unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn oversized_present_body_is_error() {
        let header = Header::for_body(2);
        let prefix = encode_header(&header).unwrap();
        let mut blob = prefix.to_vec();
        blob.extend_from_slice(b"12345");
        let err = parse(&blob).unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
    }

    #[test]
    fn tag_in_metadata_rejected() {
        let mut header = Header::for_body(0);
        header.id = Some(String::from_utf8(HEADER_TAG.to_vec()).unwrap());
        let err = encode_header(&header).unwrap_err();
        assert!(matches!(err, FrameError::TagInMetadata));
    }

    #[test]
    fn eof_sentinel_detection_is_exact() {
        assert!(is_eof(EOF_SENTINEL));
        assert!(!is_eof(b"MSGLINK_EOF "));
        assert!(!is_eof(b""));
    }
}
