//! TDS data type identifiers.
//!
//! The type-id space is small and closed, so it is modelled as an enum and
//! every decode path matches on it exhaustively. Unknown ids are fatal:
//! without knowing the length class there is no way to skip the value.

use crate::error::ProtocolError;

/// TDS data type identifiers as they appear in TYPE_INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Zero-length
    /// Null type.
    Null = 0x1F,

    // Fixed-length types (no length prefix)
    /// 8-bit unsigned integer (TINYINT).
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Nullable variants with a 1-byte length
    /// Unique identifier.
    Guid = 0x24,
    /// Nullable integer.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Decimal.
    DecimalN = 0x6A,
    /// Numeric.
    NumericN = 0x6C,
    /// Nullable float.
    FloatN = 0x6D,
    /// Nullable money.
    MoneyN = 0x6E,
    /// Nullable datetime.
    DateTimeN = 0x6F,
    /// Legacy fixed-length character.
    Char = 0x2F,
    /// Legacy variable-length character.
    VarChar = 0x27,
    /// Legacy fixed-length binary.
    Binary = 0x2D,
    /// Legacy variable-length binary.
    VarBinary = 0x25,

    // Date/time with scale
    /// Date (3 bytes).
    Date = 0x28,
    /// Time with variable precision.
    Time = 0x29,
    /// DateTime2 with variable precision.
    DateTime2 = 0x2A,
    /// DateTimeOffset with variable precision.
    DateTimeOffset = 0x2B,

    // 2-byte length (PLP when declared as MAX)
    /// Variable-length character.
    BigVarChar = 0xA7,
    /// Variable-length binary.
    BigVarBinary = 0xA5,
    /// Fixed-length character.
    BigChar = 0xAF,
    /// Fixed-length binary.
    BigBinary = 0xAD,
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,

    // 4-byte length
    /// Text (deprecated).
    Text = 0x23,
    /// Image (deprecated).
    Image = 0x22,
    /// NText (deprecated).
    NText = 0x63,
    /// SQL Variant.
    Variant = 0x62,

    // Always PLP
    /// User-defined type.
    Udt = 0xF0,
    /// XML type.
    Xml = 0xF1,
}

/// How the length of a value of a given type is carried in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthClass {
    /// No data at all.
    Zero,
    /// Fixed width, no prefix.
    Fixed(usize),
    /// 1-byte length prefix, 0 means NULL.
    ByteLen,
    /// 2-byte length prefix, `0xFFFF` means NULL.
    UShortLen,
    /// 4-byte length prefix.
    LongLen,
    /// Partially length-prefixed stream.
    Plp,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x7F => Self::Int8,
            0x3B => Self::Float4,
            0x3E => Self::Float8,
            0x3C => Self::Money,
            0x7A => Self::Money4,
            0x3D => Self::DateTime,
            0x3A => Self::DateTime4,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x37 => Self::Decimal,
            0x3F => Self::Numeric,
            0x68 => Self::BitN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x2F => Self::Char,
            0x27 => Self::VarChar,
            0x2D => Self::Binary,
            0x25 => Self::VarBinary,
            0x28 => Self::Date,
            0x29 => Self::Time,
            0x2A => Self::DateTime2,
            0x2B => Self::DateTimeOffset,
            0xA7 => Self::BigVarChar,
            0xA5 => Self::BigVarBinary,
            0xAF => Self::BigChar,
            0xAD => Self::BigBinary,
            0xEF => Self::NChar,
            0xE7 => Self::NVarChar,
            0x23 => Self::Text,
            0x22 => Self::Image,
            0x63 => Self::NText,
            0x62 => Self::Variant,
            0xF0 => Self::Udt,
            0xF1 => Self::Xml,
            _ => return Err(ProtocolError::UnknownType(value)),
        })
    }

    /// Whether a raw id falls in the variable-length category
    /// (`(id & 0x30) == 0x20`).
    ///
    /// Legacy DECIMAL/NUMERIC and UDT/XML are variable length despite
    /// their bit pattern; [`TypeId::length_class`] is authoritative.
    #[must_use]
    pub const fn is_variable_length_id(raw: u8) -> bool {
        raw & 0x30 == 0x20
    }

    /// Length class of values of this type when not declared as MAX.
    #[must_use]
    pub const fn length_class(self) -> LengthClass {
        match self {
            Self::Null => LengthClass::Zero,
            Self::Int1 | Self::Bit => LengthClass::Fixed(1),
            Self::Int2 => LengthClass::Fixed(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => LengthClass::Fixed(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => LengthClass::Fixed(8),
            Self::Guid
            | Self::IntN
            | Self::Decimal
            | Self::Numeric
            | Self::BitN
            | Self::DecimalN
            | Self::NumericN
            | Self::FloatN
            | Self::MoneyN
            | Self::DateTimeN
            | Self::Char
            | Self::VarChar
            | Self::Binary
            | Self::VarBinary
            | Self::Date
            | Self::Time
            | Self::DateTime2
            | Self::DateTimeOffset => LengthClass::ByteLen,
            Self::BigVarChar
            | Self::BigVarBinary
            | Self::BigChar
            | Self::BigBinary
            | Self::NChar
            | Self::NVarChar => LengthClass::UShortLen,
            Self::Text | Self::Image | Self::NText | Self::Variant => LengthClass::LongLen,
            Self::Udt | Self::Xml => LengthClass::Plp,
        }
    }

    /// Whether TYPE_INFO carries a collation for this type.
    #[must_use]
    pub const fn has_collation(self) -> bool {
        matches!(
            self,
            Self::BigVarChar | Self::BigChar | Self::NVarChar | Self::NChar | Self::Text | Self::NText
        )
    }

    /// Whether TYPE_INFO carries precision and scale.
    #[must_use]
    pub const fn has_precision(self) -> bool {
        matches!(
            self,
            Self::Decimal | Self::Numeric | Self::DecimalN | Self::NumericN
        )
    }

    /// SQL type name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int1 => "tinyint",
            Self::Bit | Self::BitN => "bit",
            Self::Int2 => "smallint",
            Self::Int4 => "int",
            Self::Int8 => "bigint",
            Self::IntN => "intn",
            Self::Float4 => "real",
            Self::Float8 => "float",
            Self::FloatN => "floatn",
            Self::Money => "money",
            Self::Money4 => "smallmoney",
            Self::MoneyN => "moneyn",
            Self::DateTime => "datetime",
            Self::DateTime4 => "smalldatetime",
            Self::DateTimeN => "datetimen",
            Self::Guid => "uniqueidentifier",
            Self::Decimal | Self::DecimalN => "decimal",
            Self::Numeric | Self::NumericN => "numeric",
            Self::Char | Self::BigChar => "char",
            Self::VarChar | Self::BigVarChar => "varchar",
            Self::Binary | Self::BigBinary => "binary",
            Self::VarBinary | Self::BigVarBinary => "varbinary",
            Self::NChar => "nchar",
            Self::NVarChar => "nvarchar",
            Self::Date => "date",
            Self::Time => "time",
            Self::DateTime2 => "datetime2",
            Self::DateTimeOffset => "datetimeoffset",
            Self::Text => "text",
            Self::Image => "image",
            Self::NText => "ntext",
            Self::Variant => "sql_variant",
            Self::Udt => "udt",
            Self::Xml => "xml",
        }
    }
}

/// Column flags from COLMETADATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnFlags(u16);

impl ColumnFlags {
    /// Column allows NULL.
    pub const NULLABLE: u16 = 0x0001;
    /// Column is case sensitive.
    pub const CASE_SENSITIVE: u16 = 0x0002;
    /// Column is writable.
    pub const UPDATEABLE: u16 = 0x0008;
    /// Column is an identity column.
    pub const IDENTITY: u16 = 0x0010;
    /// Column is computed.
    pub const COMPUTED: u16 = 0x0020;
    /// Column is hidden (browse mode key).
    pub const HIDDEN: u16 = 0x2000;
    /// Column is part of a key.
    pub const KEY: u16 = 0x4000;

    /// Wrap raw flag bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Whether the column allows NULL.
    #[must_use]
    pub const fn is_nullable(self) -> bool {
        self.0 & Self::NULLABLE != 0
    }

    /// Whether the column is an identity column.
    #[must_use]
    pub const fn is_identity(self) -> bool {
        self.0 & Self::IDENTITY != 0
    }

    /// Whether the column is computed.
    #[must_use]
    pub const fn is_computed(self) -> bool {
        self.0 & Self::COMPUTED != 0
    }
}
