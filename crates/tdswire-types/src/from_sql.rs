//! Trait for converting from SQL values to Rust types.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::TypeError;
use crate::numeric::Numeric;
use crate::value::SqlValue;

/// Trait for types that can be converted from SQL values.
///
/// Integer conversions widen but never narrow. Conversions into
/// floating point fail with [`TypeError::OutOfRange`] instead of rounding
/// an exact value.
pub trait FromSql: Sized {
    /// Convert from a SQL value to this type.
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError>;

    /// Convert from an optional SQL value.
    ///
    /// Returns `None` if the value is NULL.
    fn from_sql_nullable(value: &SqlValue) -> Result<Option<Self>, TypeError> {
        if value.is_null() {
            Ok(None)
        } else {
            Self::from_sql(value).map(Some)
        }
    }
}

fn mismatch(expected: &'static str, value: &SqlValue) -> TypeError {
    match value {
        SqlValue::Null => TypeError::UnexpectedNull,
        _ => TypeError::TypeMismatch {
            expected,
            actual: value.type_name(),
        },
    }
}

/// Largest magnitude an `f64` stores exactly.
const F64_EXACT_LIMIT: u64 = 1 << 53;

impl FromSql for bool {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Bool(v) => Ok(*v),
            _ => Err(mismatch("bool", value)),
        }
    }
}

impl FromSql for u8 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::TinyInt(v) => Ok(*v),
            _ => Err(mismatch("u8", value)),
        }
    }
}

impl FromSql for i16 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::SmallInt(v) => Ok(*v),
            SqlValue::TinyInt(v) => Ok(i16::from(*v)),
            _ => Err(mismatch("i16", value)),
        }
    }
}

impl FromSql for i32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::SmallInt(v) => Ok(i32::from(*v)),
            SqlValue::TinyInt(v) => Ok(i32::from(*v)),
            _ => Err(mismatch("i32", value)),
        }
    }
}

impl FromSql for i64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromSql for f32 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Float(v) => Ok(*v),
            _ => Err(mismatch("f32", value)),
        }
    }
}

impl FromSql for f64 {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Double(v) => Ok(*v),
            SqlValue::Float(v) => Ok(f64::from(*v)),
            SqlValue::Int(v) => Ok(f64::from(*v)),
            SqlValue::BigInt(v) if v.unsigned_abs() <= F64_EXACT_LIMIT => Ok(*v as f64),
            SqlValue::BigInt(_) => Err(TypeError::OutOfRange { target_type: "f64" }),
            SqlValue::Numeric(n) => n.to_f64(),
            _ => Err(mismatch("f64", value)),
        }
    }
}

impl FromSql for Numeric {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Numeric(n) => Ok(*n),
            SqlValue::BigInt(v) => Ok(Numeric::from(*v)),
            SqlValue::Int(v) => Ok(Numeric::from(*v)),
            _ => Err(mismatch("Numeric", value)),
        }
    }
}

#[cfg(feature = "decimal")]
impl FromSql for rust_decimal::Decimal {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        rust_decimal::Decimal::try_from(Numeric::from_sql(value)?)
    }
}

impl FromSql for String {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        value
            .as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| mismatch("String", value))
    }
}

impl FromSql for Bytes {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Binary(v) => Ok(v.clone()),
            _ => Err(mismatch("Bytes", value)),
        }
    }
}

impl FromSql for Vec<u8> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        Bytes::from_sql(value).map(|b| b.to_vec())
    }
}

impl FromSql for Uuid {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Uuid(v) => Ok(*v),
            SqlValue::String(s) => s
                .parse()
                .map_err(|e| TypeError::InvalidUuid(format!("{e}"))),
            _ => Err(mismatch("Uuid", value)),
        }
    }
}

impl FromSql for NaiveDate {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Date(v) => Ok(*v),
            SqlValue::DateTime(v) => Ok(v.date()),
            _ => Err(mismatch("NaiveDate", value)),
        }
    }
}

impl FromSql for NaiveTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::Time(v) => Ok(*v),
            SqlValue::DateTime(v) => Ok(v.time()),
            _ => Err(mismatch("NaiveTime", value)),
        }
    }
}

impl FromSql for NaiveDateTime {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTime(v) => Ok(*v),
            SqlValue::DateTimeOffset(v) => Ok(v.naive_utc()),
            _ => Err(mismatch("NaiveDateTime", value)),
        }
    }
}

impl FromSql for DateTime<FixedOffset> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(*v),
            _ => Err(mismatch("DateTime<FixedOffset>", value)),
        }
    }
}

impl FromSql for DateTime<Utc> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        match value {
            SqlValue::DateTimeOffset(v) => Ok(v.to_utc()),
            SqlValue::DateTime(v) => Ok(DateTime::from_naive_utc_and_offset(*v, Utc)),
            _ => Err(mismatch("DateTime<Utc>", value)),
        }
    }
}

impl<T: FromSql> FromSql for Option<T> {
    fn from_sql(value: &SqlValue) -> Result<Self, TypeError> {
        T::from_sql_nullable(value)
    }
}
