//! # tdswire-types
//!
//! Value model shared by every tdswire layer.
//!
//! The wire codec in `tdswire-protocol` decodes column and parameter data
//! into [`SqlValue`]; applications move between `SqlValue` and Rust types
//! through [`FromSql`] and [`ToSql`].
//!
//! Values are kept lossless: `BIGINT` stays an `i64`, and `DECIMAL`,
//! `NUMERIC`, `MONEY` and `SMALLMONEY` decode into [`Numeric`], an `i128`
//! mantissa with a decimal scale. Conversions that would lose precision are
//! reported as [`TypeError::OutOfRange`] instead of rounding silently.
//!
//! ## Features
//!
//! - `decimal` (default): conversions between [`Numeric`] and
//!   `rust_decimal::Decimal`
//!
//! ## Type Mappings
//!
//! | SQL Server Type | Rust Type |
//! |-----------------|-----------|
//! | `BIT` | `bool` |
//! | `TINYINT` | `u8` |
//! | `SMALLINT` | `i16` |
//! | `INT` | `i32` |
//! | `BIGINT` | `i64` |
//! | `REAL` | `f32` |
//! | `FLOAT` | `f64` |
//! | `DECIMAL`/`NUMERIC`/`MONEY` | [`Numeric`] |
//! | `CHAR`/`VARCHAR`/`NCHAR`/`NVARCHAR` | `String` |
//! | `BINARY`/`VARBINARY` | `bytes::Bytes` |
//! | `DATE` | `chrono::NaiveDate` |
//! | `TIME` | `chrono::NaiveTime` |
//! | `DATETIME`/`DATETIME2` | `chrono::NaiveDateTime` |
//! | `DATETIMEOFFSET` | `chrono::DateTime<FixedOffset>` |
//! | `UNIQUEIDENTIFIER` | `uuid::Uuid` |

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod from_sql;
pub mod numeric;
pub mod to_sql;
pub mod value;

pub use error::TypeError;
pub use from_sql::FromSql;
pub use numeric::Numeric;
pub use to_sql::ToSql;
pub use value::SqlValue;
