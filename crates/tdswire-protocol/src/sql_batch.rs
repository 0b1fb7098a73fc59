//! SQL batch payloads (packet type 0x01) and the ALL_HEADERS prefix shared
//! with RPC requests.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16;

/// Size of ALL_HEADERS carrying only the transaction descriptor header.
pub const ALL_HEADERS_LEN: usize = 22;

const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;

/// Write ALL_HEADERS with a transaction descriptor header.
///
/// `transaction_descriptor` is the value from the last begin-transaction
/// ENVCHANGE, or 0 in auto-commit mode. The outstanding request count is
/// always 1 without MARS.
pub fn write_all_headers(dst: &mut impl BufMut, transaction_descriptor: u64) {
    dst.put_u32_le(ALL_HEADERS_LEN as u32);
    dst.put_u32_le(18);
    dst.put_u16_le(TRANSACTION_DESCRIPTOR_HEADER);
    dst.put_u64_le(transaction_descriptor);
    dst.put_u32_le(1);
}

/// Encode a SQL batch: ALL_HEADERS then the UTF-16LE text.
#[must_use]
pub fn encode_sql_batch(sql: &str, transaction_descriptor: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + sql.len() * 2);
    write_all_headers(&mut buf, transaction_descriptor);
    write_utf16(&mut buf, sql);
    buf.freeze()
}
