use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, Result};

/// Length header: a 4-byte big-endian total length (header included).
pub const HEADER_SIZE: usize = 4;

/// Largest accepted package, header included: 10 MiB.
pub const MAX_PACKAGE_SIZE: usize = 10 * 1024 * 1024;

/// Reserve the length header in `dst` and return its offset.
///
/// Write the envelope after it, then call [`finish_frame`].
pub fn begin_frame(dst: &mut BytesMut) -> usize {
    let start = dst.len();
    dst.put_u32(0);
    start
}

/// Backpatch the length header reserved at `start`.
pub fn finish_frame(dst: &mut BytesMut, start: usize, max_package_size: usize) -> Result<()> {
    let total = dst.len() - start;
    if total <= HEADER_SIZE || total > max_package_size {
        return Err(CodecError::InvalidLength {
            length: total as i64,
            min: HEADER_SIZE + 1,
            max: max_package_size,
        });
    }
    dst[start..start + HEADER_SIZE].copy_from_slice(&(total as u32).to_be_bytes());
    Ok(())
}

/// Frame an already-encoded envelope body.
///
/// Wire format:
/// ```text
/// ┌────────────────────┬──────────────────────────────┐
/// │ Length (4B BE)     │ Envelope (Length - 4 bytes)  │
/// │ header + envelope  │ tagged fields, version first │
/// └────────────────────┴──────────────────────────────┘
/// ```
pub fn encode_frame(body: &[u8], dst: &mut BytesMut, max_package_size: usize) -> Result<()> {
    dst.reserve(HEADER_SIZE + body.len());
    let start = begin_frame(dst);
    dst.put_slice(body);
    if let Err(err) = finish_frame(dst, start, max_package_size) {
        dst.truncate(start);
        return Err(err);
    }
    Ok(())
}

/// Decode one frame from a buffer, returning the envelope bytes.
///
/// Returns `Ok(None)` while fewer than 4 bytes, or fewer than the declared
/// length, are buffered; the buffer is left untouched in that case. A length
/// outside `(HEADER_SIZE, max_package_size]` is an error, not a wait.
pub fn decode_frame(src: &mut BytesMut, max_package_size: usize) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    let length = i32::from_be_bytes(header) as i64;

    if length <= HEADER_SIZE as i64 || length > max_package_size as i64 {
        return Err(CodecError::InvalidLength {
            length,
            min: HEADER_SIZE + 1,
            max: max_package_size,
        });
    }

    let total = length as usize;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(total - HEADER_SIZE).freeze()))
}

/// Configuration for framed streams.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum package size in bytes, header included. Default: 10 MiB.
    pub max_package_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_package_size: MAX_PACKAGE_SIZE,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(b"\x10\x01envelope", &mut buf, MAX_PACKAGE_SIZE).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 14]);

        let body = decode_frame(&mut buf, MAX_PACKAGE_SIZE).unwrap().unwrap();
        assert_eq!(body.as_ref(), b"\x10\x01envelope");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_backpatch_after_reserved_header() {
        let mut buf = BytesMut::from(&b"prefix"[..]);
        let start = begin_frame(&mut buf);
        buf.put_slice(b"abc");
        finish_frame(&mut buf, start, MAX_PACKAGE_SIZE).unwrap();
        assert_eq!(&buf[6..10], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x00][..]);
        assert!(decode_frame(&mut buf, MAX_PACKAGE_SIZE).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_body_then_complete() {
        let mut wire = BytesMut::new();
        encode_frame(b"hello", &mut wire, MAX_PACKAGE_SIZE).unwrap();
        let rest = wire.split_off(6);

        let mut buf = wire;
        assert!(decode_frame(&mut buf, MAX_PACKAGE_SIZE).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&rest);
        let body = decode_frame(&mut buf, MAX_PACKAGE_SIZE).unwrap().unwrap();
        assert_eq!(body.as_ref(), b"hello");
    }

    #[test]
    fn test_decode_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(11 * 1024 * 1024);
        let result = decode_frame(&mut buf, MAX_PACKAGE_SIZE);
        assert!(matches!(result, Err(CodecError::InvalidLength { .. })));
    }

    #[test]
    fn test_decode_zero_and_negative_length() {
        let mut buf = BytesMut::from(&[0, 0, 0, 0][..]);
        assert!(decode_frame(&mut buf, MAX_PACKAGE_SIZE).is_err());

        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xF0][..]);
        assert!(decode_frame(&mut buf, MAX_PACKAGE_SIZE).is_err());
    }

    #[test]
    fn test_encode_rejects_oversized_body() {
        let mut buf = BytesMut::new();
        let result = encode_frame(&[0u8; 64], &mut buf, 32);
        assert!(matches!(result, Err(CodecError::InvalidLength { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf, MAX_PACKAGE_SIZE).unwrap();
        encode_frame(b"second", &mut buf, MAX_PACKAGE_SIZE).unwrap();

        let f1 = decode_frame(&mut buf, MAX_PACKAGE_SIZE).unwrap().unwrap();
        let f2 = decode_frame(&mut buf, MAX_PACKAGE_SIZE).unwrap().unwrap();
        assert_eq!(f1.as_ref(), b"first");
        assert_eq!(f2.as_ref(), b"second");
        assert!(buf.is_empty());
    }
}
