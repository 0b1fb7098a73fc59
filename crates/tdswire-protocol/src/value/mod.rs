//! Value codec: column and parameter data to and from [`SqlValue`].
//!
//! Decoding picks a rule from the [`TypeInfo`] length class:
//!
//! | Class | Prefix | NULL |
//! |-------|--------|------|
//! | fixed | none | n/a |
//! | byte length | `u8` | `0` |
//! | ushort length | `u16` | `0xFFFF` |
//! | long length | `u32` (TEXT family: text pointer first) | pointer length `0` |
//! | PLP | `u64` total then chunks | all-ones total |
//!
//! The payload itself is converted by [`value_from_bytes`], so the same
//! conversion serves rows, output parameters and `sql_variant` bodies.
//!
//! Every decode reads through a [`Cursor`] and may return
//! [`DecodeError::NeedMoreData`](crate::error::DecodeError::NeedMoreData);
//! nothing is consumed from the caller's buffer until a decode succeeds.

pub mod datetime;
pub mod encode;
pub mod numeric;
pub mod plp;
pub mod variant;

use bytes::{BufMut, Bytes, BytesMut};
use tdswire_types::{Numeric, SqlValue, TypeError};
use uuid::Uuid;

use crate::codec::write_utf16;
use crate::cursor::{Cursor, decode_utf16};
use crate::error::{DecodeResult, ProtocolError};
use crate::metadata::TypeInfo;
use crate::types::{LengthClass, TypeId};

pub use encode::{SqlType, TypeLength};

const USHORT_NULL: u16 = 0xFFFF;
const LONG_NULL: u32 = 0xFFFF_FFFF;

/// Decode one value described by `ti`.
pub fn decode_value(cur: &mut Cursor<'_>, ti: &TypeInfo) -> DecodeResult<SqlValue> {
    if matches!(ti.type_id, TypeId::Text | TypeId::NText | TypeId::Image) {
        return decode_text_pointer(cur, ti);
    }
    match ti.length_class() {
        LengthClass::Zero => Ok(SqlValue::Null),
        LengthClass::Fixed(n) => value_from_bytes(ti, cur.read_bytes(n)?),
        LengthClass::ByteLen => match cur.read_u8()? {
            0 => Ok(SqlValue::Null),
            len => value_from_bytes(ti, cur.read_bytes(len as usize)?),
        },
        LengthClass::UShortLen => match cur.read_u16_le()? {
            USHORT_NULL => Ok(SqlValue::Null),
            len => value_from_bytes(ti, cur.read_bytes(len as usize)?),
        },
        LengthClass::LongLen => match cur.read_u32_le()? {
            LONG_NULL => Ok(SqlValue::Null),
            0 if ti.type_id == TypeId::Variant => Ok(SqlValue::Null),
            len => value_from_bytes(ti, cur.read_bytes(len as usize)?),
        },
        LengthClass::Plp => match plp::read_plp(cur)? {
            None => Ok(SqlValue::Null),
            Some(data) => value_from_bytes(ti, &data),
        },
    }
}

/// TEXT/NTEXT/IMAGE row data: text pointer, timestamp, then a `u32`
/// length and the data.
fn decode_text_pointer(cur: &mut Cursor<'_>, ti: &TypeInfo) -> DecodeResult<SqlValue> {
    let ptr_len = cur.read_u8()?;
    if ptr_len == 0 {
        return Ok(SqlValue::Null);
    }
    cur.skip(ptr_len as usize + 8)?;
    let len = cur.read_u32_le()?;
    value_from_bytes(ti, cur.read_bytes(len as usize)?)
}

fn exact<const N: usize>(ti: &TypeInfo, bytes: &[u8]) -> DecodeResult<[u8; N]> {
    bytes.try_into().map_err(|_| {
        ProtocolError::InvalidValueLength {
            type_name: ti.type_id.name(),
            length: bytes.len(),
        }
        .into()
    })
}

fn bad_length(ti: &TypeInfo, len: usize) -> crate::error::DecodeError {
    ProtocolError::InvalidValueLength {
        type_name: ti.type_id.name(),
        length: len,
    }
    .into()
}

/// Convert a value's payload (prefix already stripped) into a [`SqlValue`].
pub fn value_from_bytes(ti: &TypeInfo, bytes: &[u8]) -> DecodeResult<SqlValue> {
    Ok(match ti.type_id {
        TypeId::Null => SqlValue::Null,
        TypeId::Bit | TypeId::BitN => SqlValue::Bool(exact::<1>(ti, bytes)?[0] != 0),
        TypeId::Int1 => SqlValue::TinyInt(exact::<1>(ti, bytes)?[0]),
        TypeId::Int2 => SqlValue::SmallInt(i16::from_le_bytes(exact(ti, bytes)?)),
        TypeId::Int4 => SqlValue::Int(i32::from_le_bytes(exact(ti, bytes)?)),
        TypeId::Int8 => SqlValue::BigInt(i64::from_le_bytes(exact(ti, bytes)?)),
        TypeId::IntN => match bytes.len() {
            1 => SqlValue::TinyInt(bytes[0]),
            2 => SqlValue::SmallInt(i16::from_le_bytes(exact(ti, bytes)?)),
            4 => SqlValue::Int(i32::from_le_bytes(exact(ti, bytes)?)),
            8 => SqlValue::BigInt(i64::from_le_bytes(exact(ti, bytes)?)),
            n => return Err(bad_length(ti, n)),
        },
        TypeId::Float4 | TypeId::Float8 | TypeId::FloatN => match bytes.len() {
            4 => SqlValue::Float(f32::from_le_bytes(exact(ti, bytes)?)),
            8 => SqlValue::Double(f64::from_le_bytes(exact(ti, bytes)?)),
            n => return Err(bad_length(ti, n)),
        },
        TypeId::Money | TypeId::Money4 | TypeId::MoneyN => match bytes.len() {
            4 => SqlValue::Numeric(Numeric::from_money(i64::from(i32::from_le_bytes(
                exact(ti, bytes)?,
            )))),
            8 => SqlValue::Numeric(numeric::decode_money(exact(ti, bytes)?)),
            n => return Err(bad_length(ti, n)),
        },
        TypeId::DateTime | TypeId::DateTime4 | TypeId::DateTimeN => match bytes.len() {
            4 => SqlValue::DateTime(datetime::decode_smalldatetime(exact(ti, bytes)?)?),
            8 => SqlValue::DateTime(datetime::decode_datetime(exact(ti, bytes)?)?),
            n => return Err(bad_length(ti, n)),
        },
        TypeId::Guid => SqlValue::Uuid(Uuid::from_bytes_le(exact(ti, bytes)?)),
        TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
            SqlValue::Numeric(numeric::decode_numeric(bytes, ti.scale)?)
        }
        TypeId::Date => SqlValue::Date(datetime::decode_date(bytes)?),
        TypeId::Time => SqlValue::Time(datetime::decode_time(bytes, ti.scale)?),
        TypeId::DateTime2 => SqlValue::DateTime(datetime::decode_datetime2(bytes, ti.scale)?),
        TypeId::DateTimeOffset => {
            SqlValue::DateTimeOffset(datetime::decode_datetimeoffset(bytes, ti.scale)?)
        }
        TypeId::NChar | TypeId::NVarChar | TypeId::NText => {
            SqlValue::String(decode_utf16(bytes)?)
        }
        TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar | TypeId::Text => {
            SqlValue::String(decode_narrow(ti, bytes))
        }
        TypeId::Binary
        | TypeId::VarBinary
        | TypeId::BigBinary
        | TypeId::BigVarBinary
        | TypeId::Image
        | TypeId::Udt => SqlValue::Binary(Bytes::copy_from_slice(bytes)),
        TypeId::Xml => {
            let body = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
            SqlValue::Xml(decode_utf16(body)?)
        }
        TypeId::Variant => variant::decode_variant(bytes)?,
    })
}

fn decode_narrow(ti: &TypeInfo, bytes: &[u8]) -> String {
    let encoding = ti.collation.unwrap_or_default().encoding();
    let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
    if had_errors {
        tracing::trace!(encoding = encoding.name(), "replaced undecodable characters");
    }
    text.into_owned()
}

/// Encode `value` as data for a column or parameter described by `ti`,
/// including the length prefix.
///
/// The value is expected to have been coerced with [`SqlType::coerce`];
/// anything that still does not fit is reported rather than truncated.
pub fn encode_value(
    dst: &mut impl BufMut,
    ti: &TypeInfo,
    value: &SqlValue,
) -> Result<(), ProtocolError> {
    let class = ti.length_class();
    if value.is_null() {
        match class {
            LengthClass::Zero => {}
            LengthClass::Fixed(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "value",
                    reason: format!("{} cannot be NULL", ti.type_id.name()),
                });
            }
            LengthClass::ByteLen => dst.put_u8(0),
            LengthClass::UShortLen => dst.put_u16_le(USHORT_NULL),
            LengthClass::LongLen => dst.put_u32_le(LONG_NULL),
            LengthClass::Plp => plp::write_plp_null(dst),
        }
        return Ok(());
    }

    let mut payload = BytesMut::new();
    write_payload(&mut payload, ti, value)?;
    let len = payload.len();
    match class {
        LengthClass::Zero => {}
        LengthClass::Fixed(n) if n == len => dst.put_slice(&payload),
        LengthClass::Fixed(_) => return Err(bad_width(ti, len)),
        LengthClass::ByteLen => {
            let len = u8::try_from(len).map_err(|_| too_long(ti, len, 0xFF))?;
            dst.put_u8(len);
            dst.put_slice(&payload);
        }
        LengthClass::UShortLen => {
            if len >= usize::from(USHORT_NULL) {
                return Err(too_long(ti, len, 0xFFFE));
            }
            dst.put_u16_le(len as u16);
            dst.put_slice(&payload);
        }
        LengthClass::LongLen => {
            let len = u32::try_from(len)
                .ok()
                .filter(|&l| l != LONG_NULL)
                .ok_or_else(|| too_long(ti, len, LONG_NULL as usize - 1))?;
            dst.put_u32_le(len);
            dst.put_slice(&payload);
        }
        LengthClass::Plp => plp::write_plp(dst, &payload, plp::DEFAULT_CHUNK_SIZE),
    }
    Ok(())
}

fn too_long(ti: &TypeInfo, length: usize, max: usize) -> ProtocolError {
    ProtocolError::TooLong {
        field: ti.type_id.name(),
        length,
        max,
    }
}

fn mismatch(ti: &TypeInfo, value: &SqlValue) -> ProtocolError {
    ProtocolError::Type(TypeError::TypeMismatch {
        expected: ti.type_id.name(),
        actual: value.type_name(),
    })
}

fn out_of_range(ti: &TypeInfo) -> ProtocolError {
    ProtocolError::Type(TypeError::OutOfRange {
        target_type: ti.type_id.name(),
    })
}

/// Write the payload of a non-NULL value, without a length prefix.
fn write_payload(
    dst: &mut BytesMut,
    ti: &TypeInfo,
    value: &SqlValue,
) -> Result<(), ProtocolError> {
    match (ti.type_id, value) {
        (TypeId::Bit | TypeId::BitN, SqlValue::Bool(b)) => dst.put_u8(u8::from(*b)),
        (
            TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::IntN,
            SqlValue::TinyInt(_) | SqlValue::SmallInt(_) | SqlValue::Int(_) | SqlValue::BigInt(_),
        ) => {
            let v = value.as_i64().ok_or_else(|| mismatch(ti, value))?;
            match fixed_or_declared(ti) {
                1 => dst.put_u8(u8::try_from(v).map_err(|_| out_of_range(ti))?),
                2 => dst.put_i16_le(i16::try_from(v).map_err(|_| out_of_range(ti))?),
                4 => dst.put_i32_le(i32::try_from(v).map_err(|_| out_of_range(ti))?),
                8 => dst.put_i64_le(v),
                n => return Err(bad_width(ti, n)),
            }
        }
        (TypeId::Float4 | TypeId::Float8 | TypeId::FloatN, SqlValue::Float(_) | SqlValue::Double(_)) => {
            let v = match value {
                SqlValue::Float(f) => f64::from(*f),
                SqlValue::Double(d) => *d,
                _ => return Err(mismatch(ti, value)),
            };
            match fixed_or_declared(ti) {
                4 => dst.put_f32_le(v as f32),
                8 => dst.put_f64_le(v),
                n => return Err(bad_width(ti, n)),
            }
        }
        (TypeId::Money | TypeId::Money4 | TypeId::MoneyN, SqlValue::Numeric(n)) => {
            let units = n.rescale(tdswire_types::numeric::MONEY_SCALE)?.value();
            match fixed_or_declared(ti) {
                4 => dst.put_i32_le(i32::try_from(units).map_err(|_| out_of_range(ti))?),
                8 => numeric::encode_money(dst, i64::try_from(units).map_err(|_| out_of_range(ti))?),
                n => return Err(bad_width(ti, n)),
            }
        }
        (
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN,
            SqlValue::Numeric(n),
        ) => {
            let n = n.rescale(ti.scale)?;
            if n.precision() > ti.precision {
                return Err(out_of_range(ti));
            }
            numeric::encode_numeric(dst, n, ti.precision);
        }
        (TypeId::Guid, SqlValue::Uuid(u)) => dst.put_slice(&u.to_bytes_le()),
        (TypeId::Date, SqlValue::Date(d)) => datetime::encode_date(dst, *d)?,
        (TypeId::Time, SqlValue::Time(t)) => datetime::encode_time(dst, *t, ti.scale),
        (TypeId::DateTime2, SqlValue::DateTime(dt)) => {
            datetime::encode_datetime2(dst, *dt, ti.scale)?;
        }
        (TypeId::DateTimeOffset, SqlValue::DateTimeOffset(dt)) => {
            datetime::encode_datetimeoffset(dst, *dt, ti.scale)?;
        }
        (TypeId::DateTime | TypeId::DateTime4 | TypeId::DateTimeN, SqlValue::DateTime(dt)) => {
            match fixed_or_declared(ti) {
                4 => datetime::encode_smalldatetime(dst, *dt)?,
                8 => datetime::encode_datetime(dst, *dt)?,
                n => return Err(bad_width(ti, n)),
            }
        }
        (TypeId::NChar | TypeId::NVarChar | TypeId::NText, SqlValue::String(s)) => {
            write_utf16(dst, s);
        }
        (TypeId::Xml, SqlValue::Xml(s) | SqlValue::String(s)) => write_utf16(dst, s),
        (
            TypeId::Char | TypeId::VarChar | TypeId::BigChar | TypeId::BigVarChar | TypeId::Text,
            SqlValue::String(s),
        ) => {
            let collation = ti.collation.unwrap_or_default();
            let (bytes, _, had_errors) = collation.encoding().encode(s);
            if had_errors {
                return Err(ProtocolError::InvalidField {
                    field: "varchar",
                    reason: format!("not representable in code page {}", collation.codepage()),
                });
            }
            dst.put_slice(&bytes);
        }
        (
            TypeId::Binary
            | TypeId::VarBinary
            | TypeId::BigBinary
            | TypeId::BigVarBinary
            | TypeId::Image
            | TypeId::Udt,
            SqlValue::Binary(b),
        ) => dst.put_slice(b),
        _ => return Err(mismatch(ti, value)),
    }
    Ok(())
}

fn fixed_or_declared(ti: &TypeInfo) -> usize {
    match ti.type_id.length_class() {
        LengthClass::Fixed(n) => n,
        _ => ti.length as usize,
    }
}

fn bad_width(ti: &TypeInfo, width: usize) -> ProtocolError {
    ProtocolError::InvalidValueLength {
        type_name: ti.type_id.name(),
        length: width,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::collation::{Collation, CollationFlags};
    use crate::error::DecodeError;
    use crate::metadata::MAX_LENGTH_MARKER;
    use chrono::NaiveDate;

    fn roundtrip(ti: &TypeInfo, value: &SqlValue) -> SqlValue {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, ti, value).unwrap();
        let mut cur = Cursor::new(&buf);
        let decoded = decode_value(&mut cur, ti).unwrap();
        assert!(cur.is_empty(), "trailing bytes for {ti:?}");
        decoded
    }

    #[test]
    fn test_intn_widths() {
        for (len, v) in [
            (1, SqlValue::TinyInt(255)),
            (2, SqlValue::SmallInt(i16::MIN)),
            (4, SqlValue::Int(i32::MAX)),
            (8, SqlValue::BigInt(i64::MIN)),
        ] {
            let ti = TypeInfo::new(TypeId::IntN, len);
            assert_eq!(roundtrip(&ti, &v), v);
        }
    }

    #[test]
    fn test_intn_null_and_bad_length() {
        let ti = TypeInfo::new(TypeId::IntN, 4);
        assert_eq!(decode_value(&mut Cursor::new(&[0]), &ti).unwrap(), SqlValue::Null);
        let err = decode_value(&mut Cursor::new(&[3, 1, 2, 3]), &ti).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Protocol(ProtocolError::InvalidValueLength { length: 3, .. })
        ));
    }

    #[test]
    fn test_bigint_keeps_all_bits() {
        let ti = TypeInfo::new(TypeId::Int8, 8);
        let v = SqlValue::BigInt(9_007_199_254_740_993);
        assert_eq!(roundtrip(&ti, &v), v);
    }

    #[test]
    fn test_fixed_type_rejects_null() {
        let ti = TypeInfo::new(TypeId::Int4, 4);
        let mut buf = BytesMut::new();
        assert!(encode_value(&mut buf, &ti, &SqlValue::Null).is_err());
    }

    #[test]
    fn test_money_scale() {
        let ti = TypeInfo::new(TypeId::MoneyN, 8);
        let v = SqlValue::Numeric(Numeric::new(-12_345_678, 4).unwrap());
        assert_eq!(roundtrip(&ti, &v), v);

        let small = TypeInfo::new(TypeId::MoneyN, 4);
        let rounded = roundtrip(&small, &SqlValue::Numeric(Numeric::new(123_456, 5).unwrap()));
        assert_eq!(rounded, SqlValue::Numeric(Numeric::new(12_346, 4).unwrap()));
    }

    #[test]
    fn test_guid_mixed_endian() {
        let u = Uuid::parse_str("01020304-0506-0708-090a-0b0c0d0e0f10").unwrap();
        let ti = TypeInfo::new(TypeId::Guid, 16);
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &ti, &SqlValue::Uuid(u)).unwrap();
        assert_eq!(&buf[1..9], &[4, 3, 2, 1, 6, 5, 8, 7]);
        assert_eq!(roundtrip(&ti, &SqlValue::Uuid(u)), SqlValue::Uuid(u));
    }

    #[test]
    fn test_nvarchar_null_marker() {
        let ti = TypeInfo::character(TypeId::NVarChar, 100, Collation::default());
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &ti, &SqlValue::Null).unwrap();
        assert_eq!(&buf[..], &[0xFF, 0xFF]);
        assert_eq!(decode_value(&mut Cursor::new(&buf), &ti).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_nvarchar_max_uses_plp() {
        let ti = TypeInfo::character(TypeId::NVarChar, MAX_LENGTH_MARKER, Collation::default());
        let text: String = "ab".repeat(6000);
        let v = SqlValue::String(text);
        let mut buf = BytesMut::new();
        encode_value(&mut buf, &ti, &v).unwrap();
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 24_000);
        assert_eq!(roundtrip(&ti, &v), v);
    }

    #[test]
    fn test_varchar_uses_collation_code_page() {
        let cyrillic = Collation::new(0x0419, CollationFlags::IGNORE_CASE, 0, 0);
        let ti = TypeInfo::character(TypeId::BigVarChar, 50, cyrillic);
        let decoded = decode_value(&mut Cursor::new(&[2, 0, 0xCF, 0xF0]), &ti).unwrap();
        assert_eq!(decoded, SqlValue::String("Пр".into()));
        assert_eq!(roundtrip(&ti, &decoded), decoded);
    }

    #[test]
    fn test_varchar_unrepresentable() {
        let ti = TypeInfo::character(TypeId::BigVarChar, 50, Collation::default());
        let mut buf = BytesMut::new();
        assert!(encode_value(&mut buf, &ti, &SqlValue::String("漢字".into())).is_err());
    }

    #[test]
    fn test_text_pointer_layout() {
        let ti = TypeInfo::character(TypeId::Text, 0x7FFF_FFFF, Collation::default());
        let mut buf = BytesMut::new();
        buf.put_u8(16);
        buf.put_slice(&[0xAA; 16]);
        buf.put_slice(&[0xBB; 8]);
        buf.put_u32_le(3);
        buf.put_slice(b"abc");
        let mut cur = Cursor::new(&buf);
        assert_eq!(decode_value(&mut cur, &ti).unwrap(), SqlValue::String("abc".into()));
        assert!(cur.is_empty());
        assert_eq!(decode_value(&mut Cursor::new(&[0]), &ti).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_xml_strips_bom() {
        let ti = TypeInfo::new(TypeId::Xml, MAX_LENGTH_MARKER);
        let mut buf = BytesMut::new();
        let mut body = vec![0xFF, 0xFE];
        body.extend_from_slice(&[b'<', 0, b'a', 0, b'/', 0, b'>', 0]);
        plp::write_plp(&mut buf, &body, 8000);
        assert_eq!(
            decode_value(&mut Cursor::new(&buf), &ti).unwrap(),
            SqlValue::Xml("<a/>".into())
        );
    }

    #[test]
    fn test_datetime2_and_date() {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(13, 14, 15, 123_456)
            .unwrap();
        let ti = TypeInfo::scaled(TypeId::DateTime2, 6);
        assert_eq!(roundtrip(&ti, &SqlValue::DateTime(dt)), SqlValue::DateTime(dt));
        let ti = TypeInfo::new(TypeId::Date, 3);
        let v = SqlValue::Date(dt.date());
        assert_eq!(roundtrip(&ti, &v), v);
    }

    #[test]
    fn test_partial_value_needs_more() {
        let ti = TypeInfo::character(TypeId::NVarChar, 100, Collation::default());
        let err = decode_value(&mut Cursor::new(&[6, 0, b'a', 0]), &ti).unwrap_err();
        assert_eq!(err, DecodeError::NeedMoreData { required: 8 });
    }
}
