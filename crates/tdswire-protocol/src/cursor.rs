//! Resumable read cursor over a borrowed byte slice.
//!
//! Decoders take a `&mut Cursor` and advance it as they read. When the
//! slice ends early they return [`DecodeError::NeedMoreData`] with the
//! buffer length that would let the read succeed. The caller keeps its
//! original offset, appends bytes, and builds a fresh cursor to retry; no
//! decoder holds state between attempts.

use crate::error::{DecodeError, DecodeResult, ProtocolError};

/// Read position over a byte slice.
#[derive(Debug, Clone, Copy)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_le {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> DecodeResult<$ty> {
                let bytes = self.read_array::<{ size_of::<$ty>() }>()?;
                Ok(<$ty>::from_le_bytes(bytes))
            }
        )*
    };
}

impl<'a> Cursor<'a> {
    /// Create a cursor at the start of `buf`.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether every byte has been consumed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, n: usize) -> DecodeResult<()> {
        if self.remaining() < n {
            return Err(DecodeError::NeedMoreData {
                required: self.pos + n,
            });
        }
        Ok(())
    }

    /// Borrow the next `n` bytes and advance past them.
    pub fn read_bytes(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read exactly `N` bytes into an array.
    pub fn read_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Advance `n` bytes without reading them.
    pub fn skip(&mut self, n: usize) -> DecodeResult<()> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        self.need(1)?;
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    read_le! {
        read_i8 => i8,
        read_u16_le => u16,
        read_i16_le => i16,
        read_u32_le => u32,
        read_i32_le => i32,
        read_u64_le => u64,
        read_i64_le => i64,
        read_f32_le => f32,
        read_f64_le => f64,
    }

    /// Read a big-endian `u16`.
    pub fn read_u16_be(&mut self) -> DecodeResult<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32_be(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Read an unsigned little-endian integer `width` bytes wide (at most 8).
    pub fn read_uint_le(&mut self, width: usize) -> DecodeResult<u64> {
        debug_assert!(width <= 8);
        let bytes = self.read_bytes(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Read `chars` UTF-16LE code units as a string.
    pub fn read_utf16(&mut self, chars: usize) -> DecodeResult<String> {
        let bytes = self.read_bytes(chars * 2)?;
        decode_utf16(bytes)
    }

    /// Read a string with a 1-byte character count.
    pub fn read_b_varchar(&mut self) -> DecodeResult<String> {
        let chars = self.read_u8()? as usize;
        self.read_utf16(chars)
    }

    /// Read a string with a 2-byte character count.
    pub fn read_us_varchar(&mut self) -> DecodeResult<String> {
        let chars = self.read_u16_le()? as usize;
        self.read_utf16(chars)
    }

    /// Read a byte string with a 1-byte length.
    pub fn read_b_varbyte(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Read a byte string with a 2-byte length.
    pub fn read_us_varbyte(&mut self) -> DecodeResult<&'a [u8]> {
        let len = self.read_u16_le()? as usize;
        self.read_bytes(len)
    }

    /// Split off a sub-cursor over the next `n` bytes.
    ///
    /// Used for length-prefixed tokens: the sub-cursor can never read past
    /// the declared length, and any shortfall inside it is a malformed
    /// token rather than a request for more input.
    pub fn sub(&mut self, n: usize) -> DecodeResult<Cursor<'a>> {
        Ok(Cursor::new(self.read_bytes(n)?))
    }
}

/// Decode UTF-16LE bytes into a `String`.
pub fn decode_utf16(bytes: &[u8]) -> DecodeResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::InvalidUtf16.into());
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|_| ProtocolError::InvalidUtf16.into())
}

/// Turn an underrun inside a length-delimited sub-cursor into a protocol
/// error. The enclosing length was already satisfied, so asking for more
/// input would never help.
pub(crate) fn bounded<T>(field: &'static str, result: DecodeResult<T>) -> DecodeResult<T> {
    result.map_err(|e| match e {
        DecodeError::NeedMoreData { .. } => ProtocolError::InvalidField {
            field,
            reason: "declared length too short".into(),
        }
        .into(),
        other => other,
    })
}
