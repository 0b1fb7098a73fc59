//! FEDAUTH_TOKEN message payload (packet type 0x08).
//!
//! Sent after FEDAUTHINFO when the driver acquires the token itself:
//!
//! ```text
//! u32 data length   (everything after this field)
//! u32 token length
//! token             UTF-16LE
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_len, write_utf16};

/// Encode a FEDAUTH_TOKEN payload.
#[must_use]
pub fn encode_fedauth_token(token: &str) -> Bytes {
    let token_len = utf16_len(token) * 2;
    let mut buf = BytesMut::with_capacity(8 + token_len);
    buf.put_u32_le((4 + token_len) as u32);
    buf.put_u32_le(token_len as u32);
    write_utf16(&mut buf, token);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_layout() {
        let payload = encode_fedauth_token("ab");
        assert_eq!(payload.as_ref(), &[8, 0, 0, 0, 4, 0, 0, 0, b'a', 0, b'b', 0]);
    }
}
