//! Low-level string writers shared by the payload encoders.
//!
//! Readers live on [`Cursor`](crate::cursor::Cursor) so they can report
//! incomplete input; writers only need a `BufMut`.

use bytes::BufMut;

use crate::error::ProtocolError;

/// Write a UTF-16LE string with a 1-byte character count.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = utf16_len(s);
    let len = u8::try_from(len).map_err(|_| ProtocolError::TooLong {
        field: "B_VARCHAR",
        length: len,
        max: u8::MAX as usize,
    })?;
    dst.put_u8(len);
    write_utf16(dst, s);
    Ok(())
}

/// Write a UTF-16LE string with a 2-byte character count.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = utf16_len(s);
    let len = u16::try_from(len).map_err(|_| ProtocolError::TooLong {
        field: "US_VARCHAR",
        length: len,
        max: u16::MAX as usize,
    })?;
    dst.put_u16_le(len);
    write_utf16(dst, s);
    Ok(())
}

/// Write a UTF-16LE string without a length prefix.
pub fn write_utf16(dst: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

/// Number of UTF-16 code units in `s`.
#[must_use]
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_roundtrip() {
        let original = "Hello, 世界!";
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, original).unwrap();
        assert_eq!(Cursor::new(&buf).read_b_varchar().unwrap(), original);
    }

    #[test]
    fn test_us_varchar_roundtrip() {
        let original = "Unicode: αβγ";
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, original).unwrap();
        assert_eq!(Cursor::new(&buf).read_us_varchar().unwrap(), original);
    }

    #[test]
    fn test_b_varchar_too_long() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_b_varchar(&mut buf, &long),
            Err(ProtocolError::TooLong { length: 256, .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_utf16_len_counts_surrogates() {
        assert_eq!(utf16_len("abc"), 3);
        assert_eq!(utf16_len("😀"), 2);
    }
}
