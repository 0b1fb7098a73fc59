//! Value codec round-trips through the parameter path.
//!
//! Each case declares a type, coerces the value the way a request would,
//! encodes it against the declared TYPE_INFO and decodes it back.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::BytesMut;
use chrono::{NaiveDate, NaiveTime, TimeZone, FixedOffset};
use proptest::prelude::*;
use tdswire_protocol::collation::Collation;
use tdswire_protocol::cursor::Cursor;
use tdswire_protocol::metadata::TypeInfo;
use tdswire_protocol::value::{SqlType, TypeLength, decode_value, encode_value};
use tdswire_types::{Numeric, SqlValue};

fn roundtrip(sql_type: SqlType, value: SqlValue) -> SqlValue {
    let collation = Collation::default();
    let coerced = sql_type.coerce(&value, collation).unwrap();
    let ti = sql_type.type_info(collation);

    // TYPE_INFO itself survives the trip.
    let mut buf = BytesMut::new();
    ti.encode(&mut buf).unwrap();
    let decoded_ti = TypeInfo::decode(&mut Cursor::new(&buf)).unwrap();
    assert_eq!(decoded_ti, ti);

    let mut buf = BytesMut::new();
    encode_value(&mut buf, &ti, &coerced).unwrap();
    let mut cur = Cursor::new(&buf);
    let out = decode_value(&mut cur, &ti).unwrap();
    assert!(cur.is_empty(), "trailing bytes after {}", sql_type.name());
    out
}

// ============================================================================
// Integer widths
// ============================================================================

#[test]
fn test_integer_boundaries() {
    for v in [0u8, u8::MAX] {
        assert_eq!(roundtrip(SqlType::TinyInt, SqlValue::TinyInt(v)), SqlValue::TinyInt(v));
    }
    for v in [i16::MIN, -1, i16::MAX] {
        assert_eq!(roundtrip(SqlType::SmallInt, SqlValue::SmallInt(v)), SqlValue::SmallInt(v));
    }
    for v in [i32::MIN, 0, i32::MAX] {
        assert_eq!(roundtrip(SqlType::Int, SqlValue::Int(v)), SqlValue::Int(v));
    }
    for v in [i64::MIN, i64::MAX] {
        assert_eq!(roundtrip(SqlType::BigInt, SqlValue::BigInt(v)), SqlValue::BigInt(v));
    }
}

#[test]
fn test_null_for_every_nullable_type() {
    let types = [
        SqlType::Bit,
        SqlType::Int,
        SqlType::Float,
        SqlType::Decimal { precision: 18, scale: 2 },
        SqlType::Money,
        SqlType::NVarChar(TypeLength::Limited(10)),
        SqlType::NVarChar(TypeLength::Max),
        SqlType::VarBinary(TypeLength::Max),
        SqlType::UniqueIdentifier,
        SqlType::Date,
        SqlType::DateTime2(7),
        SqlType::DateTimeOffset(3),
        SqlType::Xml,
    ];
    for t in types {
        assert_eq!(roundtrip(t, SqlValue::Null), SqlValue::Null, "{}", t.name());
    }
}

// ============================================================================
// Decimal precision boundaries
// ============================================================================

#[test]
fn test_decimal_precision_boundaries() {
    let cases: [(u8, &str); 8] = [
        (9, "999999999"),
        (9, "-9999.99999"),
        (19, "9999999999999999999"),
        (19, "-0.000000000000000001"),
        (28, "9999999999999999999999999999"),
        (28, "12345678901234.56789012345678"),
        (38, "99999999999999999999999999999999999999"),
        (38, "-9999999999999999999.9999999999999999999"),
    ];
    for (precision, text) in cases {
        let n: Numeric = text.parse().unwrap();
        let t = SqlType::Decimal {
            precision,
            scale: n.scale(),
        };
        assert_eq!(roundtrip(t, SqlValue::Numeric(n)), SqlValue::Numeric(n), "{text}");
    }
}

#[test]
fn test_decimal_rescales_to_declared_scale() {
    let t = SqlType::Decimal { precision: 10, scale: 4 };
    let out = roundtrip(t, SqlValue::Numeric("1.5".parse().unwrap()));
    assert_eq!(out, SqlValue::Numeric(Numeric::new(15000, 4).unwrap()));
}

// ============================================================================
// Money
// ============================================================================

#[test]
fn test_money_rounds_to_four_places() {
    let out = roundtrip(SqlType::Money, SqlValue::Numeric("12.34565".parse().unwrap()));
    assert_eq!(out, SqlValue::Numeric(Numeric::new(123_457, 4).unwrap()));
}

#[test]
fn test_money_extremes() {
    let min = Numeric::from_money(i64::MIN);
    let max = Numeric::from_money(i64::MAX);
    assert_eq!(roundtrip(SqlType::Money, SqlValue::Numeric(min)), SqlValue::Numeric(min));
    assert_eq!(roundtrip(SqlType::Money, SqlValue::Numeric(max)), SqlValue::Numeric(max));

    let small = Numeric::new(-2_147_483_648, 4).unwrap();
    assert_eq!(
        roundtrip(SqlType::SmallMoney, SqlValue::Numeric(small)),
        SqlValue::Numeric(small)
    );
}

// ============================================================================
// Text, binary and temporal types
// ============================================================================

#[test]
fn test_strings() {
    let s = "héllo wörld ✓";
    assert_eq!(
        roundtrip(SqlType::NVarChar(TypeLength::Limited(50)), SqlValue::String(s.into())),
        SqlValue::String(s.into())
    );
    assert_eq!(
        roundtrip(SqlType::VarChar(TypeLength::Limited(50)), SqlValue::String("héllo".into())),
        SqlValue::String("héllo".into())
    );
    let long = "x".repeat(20_000);
    assert_eq!(
        roundtrip(SqlType::NVarChar(TypeLength::Max), SqlValue::String(long.clone())),
        SqlValue::String(long)
    );
}

#[test]
fn test_binary_max_spans_plp_chunks() {
    let data: Vec<u8> = (0..=255u8).cycle().take(30_000).collect();
    assert_eq!(
        roundtrip(SqlType::VarBinary(TypeLength::Max), SqlValue::Binary(data.clone().into())),
        SqlValue::Binary(data.into())
    );
}

#[test]
fn test_temporal_types() {
    let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let time = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_900).unwrap();
    assert_eq!(roundtrip(SqlType::Date, SqlValue::Date(date)), SqlValue::Date(date));
    assert_eq!(roundtrip(SqlType::Time(7), SqlValue::Time(time)), SqlValue::Time(time));
    let dt = date.and_time(time);
    assert_eq!(roundtrip(SqlType::DateTime2(7), SqlValue::DateTime(dt)), SqlValue::DateTime(dt));

    let offset = FixedOffset::east_opt(-5 * 3600 - 30 * 60).unwrap();
    let dto = offset.from_local_datetime(&dt).unwrap();
    assert_eq!(
        roundtrip(SqlType::DateTimeOffset(7), SqlValue::DateTimeOffset(dto)),
        SqlValue::DateTimeOffset(dto)
    );

    let legacy = NaiveDate::from_ymd_opt(1753, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    assert_eq!(roundtrip(SqlType::DateTime, SqlValue::DateTime(legacy)), SqlValue::DateTime(legacy));
}

#[test]
fn test_guid_and_bit() {
    let id = uuid::Uuid::parse_str("6F9619FF-8B86-D011-B42D-00C04FC964FF").unwrap();
    assert_eq!(roundtrip(SqlType::UniqueIdentifier, SqlValue::Uuid(id)), SqlValue::Uuid(id));
    assert_eq!(roundtrip(SqlType::Bit, SqlValue::Bool(true)), SqlValue::Bool(true));
}

// ============================================================================
// Property tests
// ============================================================================

proptest! {
    #[test]
    fn prop_bigint_roundtrip(v in any::<i64>()) {
        prop_assert_eq!(roundtrip(SqlType::BigInt, SqlValue::BigInt(v)), SqlValue::BigInt(v));
    }

    #[test]
    fn prop_decimal_38_roundtrip(mantissa in -(10i128.pow(37))..10i128.pow(37), scale in 0u8..=20) {
        let n = Numeric::new(mantissa, scale).unwrap();
        let t = SqlType::Decimal { precision: 38, scale };
        prop_assert_eq!(roundtrip(t, SqlValue::Numeric(n)), SqlValue::Numeric(n));
    }

    #[test]
    fn prop_nvarchar_roundtrip(s in "\\PC{0,300}") {
        let t = SqlType::NVarChar(TypeLength::Limited(4000));
        prop_assert_eq!(roundtrip(t, SqlValue::String(s.clone())), SqlValue::String(s));
    }

    #[test]
    fn prop_float_roundtrip(v in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
        prop_assert_eq!(roundtrip(SqlType::Float, SqlValue::Double(v)), SqlValue::Double(v));
    }
}
