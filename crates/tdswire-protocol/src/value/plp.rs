//! Partially length-prefixed (PLP) streams.
//!
//! ```text
//! total: u64 LE      0xFFFF_FFFF_FFFF_FFFF = NULL
//!                    0xFFFF_FFFF_FFFF_FFFE = length not known up front
//! chunk*: u32 LE length, bytes
//! terminator: u32 0
//! ```

use bytes::BufMut;

use crate::cursor::Cursor;
use crate::error::{DecodeResult, ProtocolError};

/// Total-length marker for a NULL value.
pub const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Total-length marker for a stream whose size is not known in advance.
pub const PLP_UNKNOWN_LENGTH: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Chunk size used when writing a buffered value.
pub const DEFAULT_CHUNK_SIZE: usize = 8000;

/// Largest length a double-precision consumer can count exactly.
const SAFE_INTEGER_MAX: u64 = (1 << 53) - 1;

/// Read a PLP value. `None` is SQL NULL.
///
/// Chunks are concatenated in order. A declared total must equal the sum of
/// the chunk lengths. Nothing is copied until the terminator is buffered.
pub fn read_plp(cur: &mut Cursor<'_>) -> DecodeResult<Option<Vec<u8>>> {
    let total = cur.read_u64_le()?;
    if total == PLP_NULL {
        return Ok(None);
    }
    let known = (total != PLP_UNKNOWN_LENGTH).then_some(total);
    if let Some(total) = known {
        if total > SAFE_INTEGER_MAX {
            tracing::warn!(total, "PLP length exceeds 53 significant bits");
        }
    }

    let actual = chunked_len(*cur)?;
    if let Some(expected) = known {
        if actual as u64 != expected {
            return Err(ProtocolError::PlpLengthMismatch {
                expected,
                actual: actual as u64,
            }
            .into());
        }
    }

    let mut data = Vec::with_capacity(actual);
    loop {
        let chunk_len = cur.read_u32_le()? as usize;
        if chunk_len == 0 {
            break;
        }
        data.extend_from_slice(cur.read_bytes(chunk_len)?);
    }
    Ok(Some(data))
}

/// Sum of the chunk lengths up to the terminator, read from the length
/// prefixes alone.
fn chunked_len(mut scan: Cursor<'_>) -> DecodeResult<usize> {
    let mut len = 0;
    loop {
        let chunk_len = scan.read_u32_le()? as usize;
        if chunk_len == 0 {
            return Ok(len);
        }
        scan.skip(chunk_len)?;
        len += chunk_len;
    }
}

/// Write a buffered value as a known-length PLP stream in `chunk_size`
/// pieces.
pub fn write_plp(dst: &mut impl BufMut, data: &[u8], chunk_size: usize) {
    dst.put_u64_le(data.len() as u64);
    for chunk in data.chunks(chunk_size.max(1)) {
        write_plp_chunk(dst, chunk);
    }
    write_plp_terminator(dst);
}

/// Write the NULL marker.
pub fn write_plp_null(dst: &mut impl BufMut) {
    dst.put_u64_le(PLP_NULL);
}

/// Start an unknown-length stream; follow with chunks and a terminator.
pub fn write_plp_unknown_header(dst: &mut impl BufMut) {
    dst.put_u64_le(PLP_UNKNOWN_LENGTH);
}

/// Write one chunk. Empty input writes nothing, since a zero-length chunk
/// ends the stream.
pub fn write_plp_chunk(dst: &mut impl BufMut, chunk: &[u8]) {
    if chunk.is_empty() {
        return;
    }
    dst.put_u32_le(chunk.len() as u32);
    dst.put_slice(chunk);
}

/// End a stream.
pub fn write_plp_terminator(dst: &mut impl BufMut) {
    dst.put_u32_le(0);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use bytes::BytesMut;

    #[test]
    fn test_unknown_length_chunks_concatenate() {
        let mut buf = BytesMut::new();
        write_plp_unknown_header(&mut buf);
        write_plp_chunk(&mut buf, b"hello");
        write_plp_chunk(&mut buf, b"abc");
        write_plp_terminator(&mut buf);
        let data = read_plp(&mut Cursor::new(&buf)).unwrap().unwrap();
        assert_eq!(data, b"helloabc");
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn test_known_length_roundtrip() {
        let payload: Vec<u8> = (0..=255).cycle().take(20_000).collect();
        let mut buf = BytesMut::new();
        write_plp(&mut buf, &payload, DEFAULT_CHUNK_SIZE);
        let mut cur = Cursor::new(&buf);
        assert_eq!(read_plp(&mut cur).unwrap().unwrap(), payload);
        assert!(cur.is_empty());
    }

    #[test]
    fn test_known_length_mismatch() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(10);
        write_plp_chunk(&mut buf, b"short");
        write_plp_terminator(&mut buf);
        let err = read_plp(&mut Cursor::new(&buf)).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Protocol(ProtocolError::PlpLengthMismatch {
                expected: 10,
                actual: 5
            })
        );
    }

    #[test]
    fn test_null_marker() {
        let mut buf = BytesMut::new();
        write_plp_null(&mut buf);
        assert!(read_plp(&mut Cursor::new(&buf)).unwrap().is_none());
    }

    #[test]
    fn test_empty_value_is_not_null() {
        let mut buf = BytesMut::new();
        write_plp(&mut buf, &[], DEFAULT_CHUNK_SIZE);
        assert_eq!(read_plp(&mut Cursor::new(&buf)).unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_chunked_len_stops_at_missing_chunk() {
        let mut buf = BytesMut::new();
        write_plp_chunk(&mut buf, &[1u8; 300]);
        buf.put_u32_le(5000);
        buf.put_slice(&[2u8; 10]);
        let err = chunked_len(Cursor::new(&buf)).unwrap_err();
        assert_eq!(err, DecodeError::NeedMoreData { required: 4 + 300 + 4 + 5000 });

        buf.put_slice(&[2u8; 4990]);
        write_plp_terminator(&mut buf);
        assert_eq!(chunked_len(Cursor::new(&buf)).unwrap(), 5300);
    }

    #[test]
    fn test_incomplete_stream_needs_more() {
        let mut buf = BytesMut::new();
        write_plp_unknown_header(&mut buf);
        write_plp_chunk(&mut buf, b"hello");
        let err = read_plp(&mut Cursor::new(&buf)).unwrap_err();
        assert_eq!(err, DecodeError::NeedMoreData { required: buf.len() + 4 });
    }
}
