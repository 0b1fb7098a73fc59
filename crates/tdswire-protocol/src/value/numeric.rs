//! DECIMAL/NUMERIC and money wire formats.
//!
//! A decimal value is a sign byte (1 = positive, 0 = negative) followed by
//! an unsigned little-endian magnitude of 4, 8, 12 or 16 bytes chosen by the
//! declared precision. Money is a scaled integer in ten-thousandths; the
//! 8-byte form stores the high 32 bits first.

use bytes::BufMut;
use tdswire_types::Numeric;

use crate::error::{DecodeResult, ProtocolError};

/// Total wire length (sign byte included) for a decimal of `precision`.
#[must_use]
pub const fn numeric_wire_len(precision: u8) -> usize {
    match precision {
        0..=9 => 5,
        10..=19 => 9,
        20..=28 => 13,
        _ => 17,
    }
}

/// Decode a decimal body (sign byte plus magnitude).
pub fn decode_numeric(bytes: &[u8], scale: u8) -> DecodeResult<Numeric> {
    if !matches!(bytes.len(), 5 | 9 | 13 | 17) {
        return Err(ProtocolError::InvalidValueLength {
            type_name: "decimal",
            length: bytes.len(),
        }
        .into());
    }
    let positive = bytes[0] == 1;
    let magnitude = bytes[1..]
        .iter()
        .rev()
        .fold(0u128, |acc, &b| (acc << 8) | u128::from(b));
    let magnitude = i128::try_from(magnitude).map_err(|_| ProtocolError::InvalidField {
        field: "decimal",
        reason: "magnitude exceeds 38 digits".into(),
    })?;
    let value = if positive { magnitude } else { -magnitude };
    Ok(Numeric::new(value, scale)?)
}

/// Encode a decimal body for a column declared with `precision`.
///
/// The value must already be at the declared scale.
pub fn encode_numeric(dst: &mut impl BufMut, value: Numeric, precision: u8) {
    let len = numeric_wire_len(precision);
    dst.put_u8(u8::from(!value.is_negative()));
    let magnitude = value.value().unsigned_abs().to_le_bytes();
    dst.put_slice(&magnitude[..len - 1]);
}

/// Decode an 8-byte MONEY value.
#[must_use]
pub fn decode_money(bytes: [u8; 8]) -> Numeric {
    let high = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let low = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Numeric::from_money((i64::from(high) << 32) | i64::from(low))
}

/// Encode an 8-byte MONEY value from ten-thousandths.
pub fn encode_money(dst: &mut impl BufMut, ten_thousandths: i64) {
    dst.put_i32_le((ten_thousandths >> 32) as i32);
    dst.put_u32_le(ten_thousandths as u32);
}
