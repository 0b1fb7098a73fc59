//! Trait for converting Rust types to SQL values.

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::error::TypeError;
use crate::numeric::Numeric;
use crate::value::SqlValue;

/// Trait for types that can be bound as request parameters.
pub trait ToSql {
    /// Convert this value to a SQL value.
    fn to_sql(&self) -> Result<SqlValue, TypeError>;

    /// SQL type name used when the caller does not declare one.
    fn sql_type(&self) -> &'static str;
}

macro_rules! impl_to_sql {
    ($($ty:ty => $variant:ident, $name:literal);* $(;)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> Result<SqlValue, TypeError> {
                    Ok(SqlValue::$variant(self.clone()))
                }

                fn sql_type(&self) -> &'static str {
                    $name
                }
            }
        )*
    };
}

impl_to_sql! {
    bool => Bool, "BIT";
    u8 => TinyInt, "TINYINT";
    i16 => SmallInt, "SMALLINT";
    i32 => Int, "INT";
    i64 => BigInt, "BIGINT";
    f32 => Float, "REAL";
    f64 => Double, "FLOAT";
    Numeric => Numeric, "NUMERIC";
    String => String, "NVARCHAR";
    Bytes => Binary, "VARBINARY";
    Uuid => Uuid, "UNIQUEIDENTIFIER";
    NaiveDate => Date, "DATE";
    NaiveTime => Time, "TIME";
    NaiveDateTime => DateTime, "DATETIME2";
    DateTime<FixedOffset> => DateTimeOffset, "DATETIMEOFFSET";
}

impl ToSql for &str {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::String((*self).to_owned()))
    }

    fn sql_type(&self) -> &'static str {
        "NVARCHAR"
    }
}

impl ToSql for &[u8] {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Binary(Bytes::copy_from_slice(self)))
    }

    fn sql_type(&self) -> &'static str {
        "VARBINARY"
    }
}

#[cfg(feature = "decimal")]
impl ToSql for rust_decimal::Decimal {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        Ok(SqlValue::Numeric(Numeric::from(*self)))
    }

    fn sql_type(&self) -> &'static str {
        "DECIMAL"
    }
}

impl<T: ToSql> ToSql for Option<T> {
    fn to_sql(&self) -> Result<SqlValue, TypeError> {
        match self {
            Some(v) => v.to_sql(),
            None => Ok(SqlValue::Null),
        }
    }

    fn sql_type(&self) -> &'static str {
        match self {
            Some(v) => v.sql_type(),
            None => "NULL",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_to_sql_scalars() {
        assert_eq!(42i32.to_sql().unwrap(), SqlValue::Int(42));
        assert_eq!("hi".to_sql().unwrap(), SqlValue::String("hi".into()));
        assert_eq!(i64::MAX.to_sql().unwrap(), SqlValue::BigInt(i64::MAX));
    }

    #[test]
    fn test_option_to_sql() {
        let none: Option<i32> = None;
        assert!(none.to_sql().unwrap().is_null());
        assert_eq!(none.sql_type(), "NULL");
    }
}
