//! Declared parameter types.
//!
//! [`SqlType`] is what a caller declares for an RPC parameter. It produces
//! the `@p nvarchar(4000)` declaration text for `sp_executesql`, the
//! TYPE_INFO written before the value, and validates a [`SqlValue`]
//! against the declaration before anything reaches the wire.
//!
//! Variable-length types switch to PLP when the declared length is `MAX` or
//! exceeds the largest non-PLP size (4000 characters for `nvarchar`, 8000
//! bytes for `varchar` and `varbinary`).

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tdswire_types::numeric::{MAX_PRECISION, MONEY_SCALE};
use tdswire_types::{Numeric, SqlValue, TypeError};

use crate::codec::utf16_len;
use crate::collation::Collation;
use crate::error::ParamError;
use crate::metadata::{MAX_LENGTH_MARKER, TypeInfo};
use crate::types::TypeId;

/// Largest `nvarchar` length, in characters, sent without PLP.
pub const NVARCHAR_MAX_CHARS: u32 = 4000;

/// Largest `varchar`/`varbinary` length, in bytes, sent without PLP.
pub const VARBYTE_MAX_LEN: u32 = 8000;

/// Largest fractional-second scale.
pub const MAX_TIME_SCALE: u8 = 7;

/// Declared length of a variable-length type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeLength {
    /// A bounded length.
    Limited(u32),
    /// `(max)`.
    Max,
}

impl TypeLength {
    /// Length to declare for a value of `len` units, given the non-PLP
    /// limit of the type.
    #[must_use]
    pub const fn for_len(len: usize, limit: u32) -> Self {
        if len <= limit as usize {
            Self::Limited(limit)
        } else {
            Self::Max
        }
    }

    const fn resolve(self, limit: u32) -> Self {
        match self {
            Self::Limited(n) if n <= limit => Self::Limited(n),
            _ => Self::Max,
        }
    }
}

impl fmt::Display for TypeLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Max => f.write_str("max"),
        }
    }
}

/// A parameter's declared SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SqlType {
    /// `bit`.
    Bit,
    /// `tinyint`.
    TinyInt,
    /// `smallint`.
    SmallInt,
    /// `int`.
    Int,
    /// `bigint`.
    BigInt,
    /// `real`.
    Real,
    /// `float`.
    Float,
    /// `decimal(precision, scale)`.
    Decimal {
        /// Total digits, 1..=38.
        precision: u8,
        /// Digits after the point.
        scale: u8,
    },
    /// `money`.
    Money,
    /// `smallmoney`.
    SmallMoney,
    /// `nvarchar(n)`, length in characters.
    NVarChar(TypeLength),
    /// `varchar(n)`, length in bytes.
    VarChar(TypeLength),
    /// `varbinary(n)`.
    VarBinary(TypeLength),
    /// `uniqueidentifier`.
    UniqueIdentifier,
    /// `date`.
    Date,
    /// `time(scale)`.
    Time(u8),
    /// `datetime`.
    DateTime,
    /// `smalldatetime`.
    SmallDateTime,
    /// `datetime2(scale)`.
    DateTime2(u8),
    /// `datetimeoffset(scale)`.
    DateTimeOffset(u8),
    /// `xml`.
    Xml,
}

impl SqlType {
    /// Type to declare for a value when the caller gave none.
    #[must_use]
    pub fn infer(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => Self::NVarChar(TypeLength::Limited(1)),
            SqlValue::Bool(_) => Self::Bit,
            SqlValue::TinyInt(_) => Self::TinyInt,
            SqlValue::SmallInt(_) => Self::SmallInt,
            SqlValue::Int(_) => Self::Int,
            SqlValue::BigInt(_) => Self::BigInt,
            SqlValue::Float(_) => Self::Real,
            SqlValue::Double(_) => Self::Float,
            SqlValue::Numeric(n) => Self::Decimal {
                precision: n.precision().max(n.scale()).max(1),
                scale: n.scale(),
            },
            SqlValue::String(s) => {
                Self::NVarChar(TypeLength::for_len(utf16_len(s), NVARCHAR_MAX_CHARS))
            }
            SqlValue::Binary(b) => Self::VarBinary(TypeLength::for_len(b.len(), VARBYTE_MAX_LEN)),
            SqlValue::Uuid(_) => Self::UniqueIdentifier,
            SqlValue::Date(_) => Self::Date,
            SqlValue::Time(_) => Self::Time(MAX_TIME_SCALE),
            SqlValue::DateTime(_) => Self::DateTime2(MAX_TIME_SCALE),
            SqlValue::DateTimeOffset(_) => Self::DateTimeOffset(MAX_TIME_SCALE),
            SqlValue::Xml(_) => Self::Xml,
        }
    }

    /// Declaration text, as used in the `sp_executesql` parameter list.
    #[must_use]
    pub fn declaration(&self) -> String {
        match *self {
            Self::Bit => "bit".into(),
            Self::TinyInt => "tinyint".into(),
            Self::SmallInt => "smallint".into(),
            Self::Int => "int".into(),
            Self::BigInt => "bigint".into(),
            Self::Real => "real".into(),
            Self::Float => "float".into(),
            Self::Decimal { precision, scale } => format!("decimal({precision}, {scale})"),
            Self::Money => "money".into(),
            Self::SmallMoney => "smallmoney".into(),
            Self::NVarChar(len) => format!("nvarchar({})", len.resolve(NVARCHAR_MAX_CHARS)),
            Self::VarChar(len) => format!("varchar({})", len.resolve(VARBYTE_MAX_LEN)),
            Self::VarBinary(len) => format!("varbinary({})", len.resolve(VARBYTE_MAX_LEN)),
            Self::UniqueIdentifier => "uniqueidentifier".into(),
            Self::Date => "date".into(),
            Self::Time(s) => format!("time({s})"),
            Self::DateTime => "datetime".into(),
            Self::SmallDateTime => "smalldatetime".into(),
            Self::DateTime2(s) => format!("datetime2({s})"),
            Self::DateTimeOffset(s) => format!("datetimeoffset({s})"),
            Self::Xml => "xml".into(),
        }
    }

    /// TYPE_INFO sent ahead of the parameter value.
    ///
    /// `collation` applies to `varchar`/`nvarchar`; it is normally the
    /// database collation reported at login.
    #[must_use]
    pub fn type_info(&self, collation: Collation) -> TypeInfo {
        match *self {
            Self::Bit => TypeInfo::new(TypeId::BitN, 1),
            Self::TinyInt => TypeInfo::new(TypeId::IntN, 1),
            Self::SmallInt => TypeInfo::new(TypeId::IntN, 2),
            Self::Int => TypeInfo::new(TypeId::IntN, 4),
            Self::BigInt => TypeInfo::new(TypeId::IntN, 8),
            Self::Real => TypeInfo::new(TypeId::FloatN, 4),
            Self::Float => TypeInfo::new(TypeId::FloatN, 8),
            Self::Decimal { precision, scale } => {
                let mut ti = TypeInfo::decimal(precision, scale);
                ti.type_id = TypeId::NumericN;
                ti
            }
            Self::Money => TypeInfo::new(TypeId::MoneyN, 8),
            Self::SmallMoney => TypeInfo::new(TypeId::MoneyN, 4),
            Self::NVarChar(len) => TypeInfo::character(
                TypeId::NVarChar,
                match len.resolve(NVARCHAR_MAX_CHARS) {
                    TypeLength::Limited(n) => n * 2,
                    TypeLength::Max => MAX_LENGTH_MARKER,
                },
                collation,
            ),
            Self::VarChar(len) => {
                TypeInfo::character(TypeId::BigVarChar, wire_length(len), collation)
            }
            Self::VarBinary(len) => TypeInfo::new(TypeId::BigVarBinary, wire_length(len)),
            Self::UniqueIdentifier => TypeInfo::new(TypeId::Guid, 16),
            Self::Date => TypeInfo::new(TypeId::Date, 3),
            Self::Time(s) => TypeInfo::scaled(TypeId::Time, s),
            Self::DateTime => TypeInfo::new(TypeId::DateTimeN, 8),
            Self::SmallDateTime => TypeInfo::new(TypeId::DateTimeN, 4),
            Self::DateTime2(s) => TypeInfo::scaled(TypeId::DateTime2, s),
            Self::DateTimeOffset(s) => TypeInfo::scaled(TypeId::DateTimeOffset, s),
            Self::Xml => TypeInfo::new(TypeId::Xml, MAX_LENGTH_MARKER),
        }
    }

    /// Whether values are sent as a PLP stream.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        match *self {
            Self::NVarChar(len) => len.resolve(NVARCHAR_MAX_CHARS) == TypeLength::Max,
            Self::VarChar(len) | Self::VarBinary(len) => {
                len.resolve(VARBYTE_MAX_LEN) == TypeLength::Max
            }
            Self::Xml => true,
            _ => false,
        }
    }

    /// Validate `value` against the declaration and convert it to the
    /// representation [`encode_value`](super::encode_value) expects.
    ///
    /// `collation` is the code page `varchar` text will be encoded in.
    pub fn coerce(&self, value: &SqlValue, collation: Collation) -> Result<SqlValue, ParamError> {
        if value.is_null() {
            self.check_declaration()?;
            return Ok(SqlValue::Null);
        }
        match *self {
            Self::Bit => match value {
                SqlValue::Bool(b) => Ok(SqlValue::Bool(*b)),
                v => v
                    .as_i64()
                    .map(|i| SqlValue::Bool(i != 0))
                    .ok_or_else(|| self.mismatch(v)),
            },
            Self::TinyInt => {
                let i = self.integer(value)?;
                u8::try_from(i).map(SqlValue::TinyInt).map_err(|_| self.out_of_range())
            }
            Self::SmallInt => {
                let i = self.integer(value)?;
                i16::try_from(i).map(SqlValue::SmallInt).map_err(|_| self.out_of_range())
            }
            Self::Int => {
                let i = self.integer(value)?;
                i32::try_from(i).map(SqlValue::Int).map_err(|_| self.out_of_range())
            }
            Self::BigInt => self.integer(value).map(SqlValue::BigInt),
            Self::Real => match value {
                SqlValue::Float(f) => Ok(SqlValue::Float(*f)),
                SqlValue::Double(d) if d.is_finite() && d.abs() <= f64::from(f32::MAX) => {
                    Ok(SqlValue::Float(*d as f32))
                }
                SqlValue::Double(_) => Err(self.out_of_range()),
                v => Err(self.mismatch(v)),
            },
            Self::Float => match value {
                SqlValue::Float(f) => Ok(SqlValue::Double(f64::from(*f))),
                SqlValue::Double(d) => Ok(SqlValue::Double(*d)),
                v => v
                    .as_i64()
                    .map(|i| SqlValue::Double(i as f64))
                    .ok_or_else(|| self.mismatch(v)),
            },
            Self::Decimal { precision, scale } => {
                self.check_declaration()?;
                let n = self.numeric(value)?.rescale(scale)?;
                if n.precision() > precision {
                    return Err(self.out_of_range());
                }
                Ok(SqlValue::Numeric(n))
            }
            Self::Money | Self::SmallMoney => {
                let n = self.numeric(value)?.rescale(MONEY_SCALE)?;
                let fits = match self {
                    Self::Money => i64::try_from(n.value()).is_ok(),
                    _ => i32::try_from(n.value()).is_ok(),
                };
                if fits {
                    Ok(SqlValue::Numeric(n))
                } else {
                    Err(self.out_of_range())
                }
            }
            Self::NVarChar(len) => {
                let s = self.string(value)?;
                if let TypeLength::Limited(max) = len.resolve(NVARCHAR_MAX_CHARS) {
                    let length = utf16_len(s);
                    if length > max as usize {
                        return Err(ParamError::TooLong { length, max });
                    }
                }
                Ok(SqlValue::String(s.to_owned()))
            }
            Self::VarChar(len) => {
                let s = self.string(value)?;
                let (bytes, _, had_errors) = collation.encoding().encode(s);
                if had_errors {
                    return Err(ParamError::Unrepresentable(collation.codepage()));
                }
                if let TypeLength::Limited(max) = len.resolve(VARBYTE_MAX_LEN) {
                    if bytes.len() > max as usize {
                        return Err(ParamError::TooLong {
                            length: bytes.len(),
                            max,
                        });
                    }
                }
                Ok(SqlValue::String(s.to_owned()))
            }
            Self::VarBinary(len) => {
                let b = value.as_bytes().ok_or_else(|| self.mismatch(value))?;
                if let TypeLength::Limited(max) = len.resolve(VARBYTE_MAX_LEN) {
                    if b.len() > max as usize {
                        return Err(ParamError::TooLong {
                            length: b.len(),
                            max,
                        });
                    }
                }
                Ok(value.clone())
            }
            Self::UniqueIdentifier => match value {
                SqlValue::Uuid(u) => Ok(SqlValue::Uuid(*u)),
                SqlValue::String(s) => uuid::Uuid::parse_str(s)
                    .map(SqlValue::Uuid)
                    .map_err(|e| TypeError::InvalidUuid(e.to_string()).into()),
                v => Err(self.mismatch(v)),
            },
            Self::Date => {
                let d = match value {
                    SqlValue::Date(d) => *d,
                    SqlValue::DateTime(dt) => dt.date(),
                    v => return Err(self.mismatch(v)),
                };
                Ok(SqlValue::Date(d))
            }
            Self::Time(_) => {
                self.check_declaration()?;
                match value {
                    SqlValue::Time(t) => Ok(SqlValue::Time(*t)),
                    SqlValue::DateTime(dt) => Ok(SqlValue::Time(dt.time())),
                    v => Err(self.mismatch(v)),
                }
            }
            Self::DateTime | Self::SmallDateTime | Self::DateTime2(_) => {
                self.check_declaration()?;
                let dt = match value {
                    SqlValue::DateTime(dt) => *dt,
                    SqlValue::Date(d) => d.and_time(NaiveTime::MIN),
                    v => return Err(self.mismatch(v)),
                };
                let (min, max) = match self {
                    Self::DateTime => (ymd(1753, 1, 1), ymd(9999, 12, 31)),
                    Self::SmallDateTime => (ymd(1900, 1, 1), ymd(2079, 6, 6)),
                    _ => (NaiveDate::MIN, NaiveDate::MAX),
                };
                if dt.date() < min || dt.date() > max || self.rounds_past_max(dt) {
                    return Err(TypeError::InvalidDateTime(format!(
                        "{dt} outside {} range",
                        self.declaration()
                    ))
                    .into());
                }
                Ok(SqlValue::DateTime(dt))
            }
            Self::DateTimeOffset(_) => {
                self.check_declaration()?;
                match value {
                    SqlValue::DateTimeOffset(dt) => Ok(SqlValue::DateTimeOffset(*dt)),
                    SqlValue::DateTime(dt) => Ok(SqlValue::DateTimeOffset(dt.and_utc().fixed_offset())),
                    v => Err(self.mismatch(v)),
                }
            }
            Self::Xml => match value {
                SqlValue::Xml(s) | SqlValue::String(s) => Ok(SqlValue::Xml(s.clone())),
                v => Err(self.mismatch(v)),
            },
        }
    }

    fn check_declaration(&self) -> Result<(), ParamError> {
        match *self {
            Self::Decimal { precision, scale }
                if precision == 0 || precision > MAX_PRECISION || scale > precision =>
            {
                Err(ParamError::InvalidPrecision { precision, scale })
            }
            Self::Time(s) | Self::DateTime2(s) | Self::DateTimeOffset(s) if s > MAX_TIME_SCALE => {
                Err(ParamError::InvalidScale(s))
            }
            _ => Ok(()),
        }
    }

    /// Values that round up past the last representable minute or tick.
    fn rounds_past_max(&self, dt: NaiveDateTime) -> bool {
        match self {
            Self::SmallDateTime => {
                dt.date() == ymd(2079, 6, 6)
                    && dt.time() >= NaiveTime::from_hms_opt(23, 59, 30).unwrap_or(NaiveTime::MIN)
            }
            _ => false,
        }
    }

    fn integer(&self, value: &SqlValue) -> Result<i64, ParamError> {
        match value {
            SqlValue::Bool(b) => Ok(i64::from(*b)),
            v => v.as_i64().ok_or_else(|| self.mismatch(v)),
        }
    }

    fn numeric(&self, value: &SqlValue) -> Result<Numeric, ParamError> {
        match value {
            SqlValue::Numeric(n) => Ok(*n),
            SqlValue::String(s) => Ok(s.parse()?),
            v => v
                .as_i64()
                .map(Numeric::from)
                .ok_or_else(|| self.mismatch(v)),
        }
    }

    fn string<'v>(&self, value: &'v SqlValue) -> Result<&'v str, ParamError> {
        match value {
            SqlValue::String(s) => Ok(s),
            v => Err(self.mismatch(v)),
        }
    }

    fn mismatch(&self, value: &SqlValue) -> ParamError {
        TypeError::TypeMismatch {
            expected: self.name(),
            actual: value.type_name(),
        }
        .into()
    }

    fn out_of_range(&self) -> ParamError {
        TypeError::OutOfRange {
            target_type: self.name(),
        }
        .into()
    }

    /// Upper-case type name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Bit => "BIT",
            Self::TinyInt => "TINYINT",
            Self::SmallInt => "SMALLINT",
            Self::Int => "INT",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Float => "FLOAT",
            Self::Decimal { .. } => "DECIMAL",
            Self::Money => "MONEY",
            Self::SmallMoney => "SMALLMONEY",
            Self::NVarChar(_) => "NVARCHAR",
            Self::VarChar(_) => "VARCHAR",
            Self::VarBinary(_) => "VARBINARY",
            Self::UniqueIdentifier => "UNIQUEIDENTIFIER",
            Self::Date => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime => "DATETIME",
            Self::SmallDateTime => "SMALLDATETIME",
            Self::DateTime2(_) => "DATETIME2",
            Self::DateTimeOffset(_) => "DATETIMEOFFSET",
            Self::Xml => "XML",
        }
    }
}

fn wire_length(len: TypeLength) -> u32 {
    match len.resolve(VARBYTE_MAX_LEN) {
        TypeLength::Limited(n) => n,
        TypeLength::Max => MAX_LENGTH_MARKER,
    }
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}
