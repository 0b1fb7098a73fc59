//! TYPE_INFO and column metadata.
//!
//! TYPE_INFO follows the type id with type-specific fields: a maximum
//! length whose width depends on the length class, precision and scale for
//! decimals, a scale for the time family, a collation for character
//! types, and descriptors for XML and UDT columns.

use std::sync::Arc;

use bytes::BufMut;

use crate::codec::{write_b_varchar, write_us_varchar};
use crate::collation::Collation;
use crate::cursor::Cursor;
use crate::error::{DecodeResult, ProtocolError};
use crate::types::{ColumnFlags, LengthClass, TypeId};
use crate::version::TdsVersion;

/// Declared length that marks a `(MAX)` column.
pub const MAX_LENGTH_MARKER: u32 = 0xFFFF;

/// XML schema collection bound to an XML column or parameter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlSchema {
    /// Database holding the schema collection.
    pub db_name: String,
    /// Owning schema.
    pub owning_schema: String,
    /// Schema collection name.
    pub collection: String,
}

/// UDT descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UdtInfo {
    /// Maximum byte size, `0xFFFF` when unbounded.
    pub max_byte_size: u16,
    /// Database name.
    pub db_name: String,
    /// Schema name.
    pub schema_name: String,
    /// Type name.
    pub type_name: String,
    /// Assembly-qualified CLR type name.
    pub assembly_qualified_name: String,
}

/// Decoded TYPE_INFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Wire type id.
    pub type_id: TypeId,
    /// Declared maximum data length in bytes. For fixed types this is the
    /// fixed width; for the time family it is derived from the scale.
    pub length: u32,
    /// Decimal precision.
    pub precision: u8,
    /// Decimal or fractional-second scale.
    pub scale: u8,
    /// Collation of character data.
    pub collation: Option<Collation>,
    /// XML schema, if the column is typed.
    pub xml_schema: Option<XmlSchema>,
    /// UDT descriptor.
    pub udt: Option<UdtInfo>,
}

impl TypeInfo {
    /// TYPE_INFO with only a type id and length.
    #[must_use]
    pub const fn new(type_id: TypeId, length: u32) -> Self {
        Self {
            type_id,
            length,
            precision: 0,
            scale: 0,
            collation: None,
            xml_schema: None,
            udt: None,
        }
    }

    /// Decimal TYPE_INFO for a precision and scale.
    #[must_use]
    pub const fn decimal(precision: u8, scale: u8) -> Self {
        let mut ti = Self::new(
            TypeId::DecimalN,
            crate::value::numeric::numeric_wire_len(precision) as u32,
        );
        ti.precision = precision;
        ti.scale = scale;
        ti
    }

    /// Time-family TYPE_INFO for a scale.
    #[must_use]
    pub const fn scaled(type_id: TypeId, scale: u8) -> Self {
        let mut ti = Self::new(type_id, scaled_length(type_id, scale) as u32);
        ti.scale = scale;
        ti
    }

    /// Character TYPE_INFO with a collation.
    #[must_use]
    pub const fn character(type_id: TypeId, length: u32, collation: Collation) -> Self {
        let mut ti = Self::new(type_id, length);
        ti.collation = Some(collation);
        ti
    }

    /// How values of this column are length-prefixed.
    #[must_use]
    pub const fn length_class(&self) -> LengthClass {
        match self.type_id.length_class() {
            LengthClass::UShortLen if self.length == MAX_LENGTH_MARKER => LengthClass::Plp,
            other => other,
        }
    }

    /// Whether values are sent as a PLP stream.
    #[must_use]
    pub const fn is_plp(&self) -> bool {
        matches!(self.length_class(), LengthClass::Plp)
    }

    /// Decode TYPE_INFO.
    pub fn decode(cur: &mut Cursor<'_>) -> DecodeResult<Self> {
        let raw = cur.read_u8()?;
        let type_id = TypeId::from_u8(raw)?;
        let mut ti = Self::new(type_id, 0);

        match type_id {
            TypeId::Date => ti.length = 3,
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                ti.scale = cur.read_u8()?;
                if ti.scale > 7 {
                    return Err(ProtocolError::InvalidField {
                        field: "time scale",
                        reason: format!("{} exceeds 7", ti.scale),
                    }
                    .into());
                }
                ti.length = scaled_length(type_id, ti.scale) as u32;
            }
            TypeId::Xml => {
                let schema_present = cur.read_u8()?;
                if schema_present != 0 {
                    ti.xml_schema = Some(XmlSchema {
                        db_name: cur.read_b_varchar()?,
                        owning_schema: cur.read_b_varchar()?,
                        collection: cur.read_us_varchar()?,
                    });
                }
                ti.length = MAX_LENGTH_MARKER;
            }
            TypeId::Udt => {
                let max_byte_size = cur.read_u16_le()?;
                ti.udt = Some(UdtInfo {
                    max_byte_size,
                    db_name: cur.read_b_varchar()?,
                    schema_name: cur.read_b_varchar()?,
                    type_name: cur.read_b_varchar()?,
                    assembly_qualified_name: cur.read_us_varchar()?,
                });
                ti.length = MAX_LENGTH_MARKER;
            }
            _ => {
                ti.length = match type_id.length_class() {
                    LengthClass::Zero => 0,
                    LengthClass::Fixed(n) => n as u32,
                    LengthClass::ByteLen => u32::from(cur.read_u8()?),
                    LengthClass::UShortLen => u32::from(cur.read_u16_le()?),
                    LengthClass::LongLen => cur.read_u32_le()?,
                    LengthClass::Plp => MAX_LENGTH_MARKER,
                };
                if type_id.has_precision() {
                    ti.precision = cur.read_u8()?;
                    ti.scale = cur.read_u8()?;
                }
                if type_id.has_collation() {
                    ti.collation = Some(Collation::decode(cur)?);
                }
            }
        }
        Ok(ti)
    }

    /// Encode TYPE_INFO, the mirror of [`TypeInfo::decode`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        dst.put_u8(self.type_id as u8);
        match self.type_id {
            TypeId::Date => {}
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => dst.put_u8(self.scale),
            TypeId::Xml => match &self.xml_schema {
                Some(schema) => {
                    dst.put_u8(1);
                    write_b_varchar(dst, &schema.db_name)?;
                    write_b_varchar(dst, &schema.owning_schema)?;
                    write_us_varchar(dst, &schema.collection)?;
                }
                None => dst.put_u8(0),
            },
            TypeId::Udt => {
                let udt = self.udt.clone().unwrap_or_default();
                dst.put_u16_le(udt.max_byte_size);
                write_b_varchar(dst, &udt.db_name)?;
                write_b_varchar(dst, &udt.schema_name)?;
                write_b_varchar(dst, &udt.type_name)?;
                write_us_varchar(dst, &udt.assembly_qualified_name)?;
            }
            _ => {
                match self.type_id.length_class() {
                    LengthClass::ByteLen => dst.put_u8(self.length as u8),
                    LengthClass::UShortLen => dst.put_u16_le(self.length as u16),
                    LengthClass::LongLen => dst.put_u32_le(self.length),
                    LengthClass::Zero | LengthClass::Fixed(_) | LengthClass::Plp => {}
                }
                if self.type_id.has_precision() {
                    dst.put_u8(self.precision);
                    dst.put_u8(self.scale);
                }
                if self.type_id.has_collation() {
                    self.collation.unwrap_or_default().encode(dst);
                }
            }
        }
        Ok(())
    }
}

/// Byte width of a time-family value at `scale`.
#[must_use]
pub const fn scaled_length(type_id: TypeId, scale: u8) -> usize {
    let time = crate::value::datetime::time_len(scale);
    match type_id {
        TypeId::Time => time,
        TypeId::DateTime2 => time + 3,
        TypeId::DateTimeOffset => time + 5,
        _ => 0,
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// User type id.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Type description.
    pub type_info: TypeInfo,
    /// Multi-part table name, sent for TEXT/NTEXT/IMAGE columns.
    pub table_name: Option<Vec<String>>,
    /// Column name.
    pub name: String,
}

impl Column {
    /// Decode one column description from COLMETADATA.
    pub fn decode(cur: &mut Cursor<'_>, version: TdsVersion) -> DecodeResult<Self> {
        let user_type = if version.user_type_width() == 4 {
            cur.read_u32_le()?
        } else {
            u32::from(cur.read_u16_le()?)
        };
        let flags = ColumnFlags::from_bits(cur.read_u16_le()?);
        let type_info = TypeInfo::decode(cur)?;
        let table_name = match type_info.type_id {
            TypeId::Text | TypeId::NText | TypeId::Image => {
                if version.user_type_width() == 4 {
                    let parts = cur.read_u8()?;
                    let mut names = Vec::with_capacity(parts as usize);
                    for _ in 0..parts {
                        names.push(cur.read_us_varchar()?);
                    }
                    Some(names)
                } else {
                    Some(vec![cur.read_us_varchar()?])
                }
            }
            _ => None,
        };
        let name = cur.read_b_varchar()?;
        Ok(Self {
            user_type,
            flags,
            type_info,
            table_name,
            name,
        })
    }

    /// Build a nullable column with no user type.
    #[must_use]
    pub fn new(name: impl Into<String>, type_info: TypeInfo) -> Self {
        Self {
            user_type: 0,
            flags: ColumnFlags::from_bits(ColumnFlags::NULLABLE),
            type_info,
            table_name: None,
            name: name.into(),
        }
    }

    /// Encode in the TDS 7.2+ layout.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        dst.put_u32_le(self.user_type);
        dst.put_u16_le(self.flags.bits());
        self.type_info.encode(dst)?;
        if let TypeId::Text | TypeId::NText | TypeId::Image = self.type_info.type_id {
            let parts = self.table_name.as_deref().unwrap_or_default();
            dst.put_u8(parts.len() as u8);
            for part in parts {
                write_us_varchar(dst, part)?;
            }
        }
        write_b_varchar(dst, &self.name)
    }
}

/// Shape of a result set, shared by every row decoded against it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnMetadata {
    /// Columns in order.
    pub columns: Vec<Column>,
}

impl ColumnMetadata {
    /// Decode the body of a COLMETADATA token (after the token byte).
    ///
    /// A column count of `0xFFFF` means "no metadata" and yields an empty
    /// shape.
    pub fn decode(cur: &mut Cursor<'_>, version: TdsVersion) -> DecodeResult<Arc<Self>> {
        let count = cur.read_u16_le()?;
        if count == 0xFFFF {
            return Ok(Arc::new(Self::default()));
        }
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(Column::decode(cur, version)?);
        }
        Ok(Arc::new(Self { columns }))
    }

    /// Encode as a COLMETADATA token, including the token byte.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let count = u16::try_from(self.columns.len())
            .ok()
            .filter(|&n| n < 0xFFFF)
            .ok_or(ProtocolError::TooLong {
                field: "column count",
                length: self.columns.len(),
                max: 0xFFFE,
            })?;
        dst.put_u8(0x81);
        dst.put_u16_le(count);
        for column in &self.columns {
            column.encode(dst)?;
        }
        Ok(())
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether there are no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Position of a column by name, case-insensitively.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use bytes::BytesMut;

    fn roundtrip(ti: &TypeInfo) -> TypeInfo {
        let mut buf = BytesMut::new();
        ti.encode(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        let decoded = TypeInfo::decode(&mut cur).unwrap();
        assert!(cur.is_empty());
        decoded
    }

    #[test]
    fn test_nvarchar_type_info() {
        let data = [0xE7, 0x40, 0x1F, 0x09, 0x04, 0xD0, 0x00, 0x34];
        let ti = TypeInfo::decode(&mut Cursor::new(&data)).unwrap();
        assert_eq!(ti.type_id, TypeId::NVarChar);
        assert_eq!(ti.length, 8000);
        assert_eq!(ti.collation.unwrap().lcid(), 0x0409);
        assert!(!ti.is_plp());
    }

    #[test]
    fn test_max_is_plp() {
        let ti = TypeInfo::character(TypeId::NVarChar, MAX_LENGTH_MARKER, Collation::default());
        assert!(ti.is_plp());
        assert_eq!(roundtrip(&ti), ti);
    }

    #[test]
    fn test_time_length_from_scale() {
        let ti = TypeInfo::decode(&mut Cursor::new(&[0x2B, 0x07])).unwrap();
        assert_eq!(ti.scale, 7);
        assert_eq!(ti.length, 10);
        assert_eq!(TypeInfo::decode(&mut Cursor::new(&[0x29, 0x02])).unwrap().length, 3);
    }

    #[test]
    fn test_decimal_roundtrip() {
        let ti = TypeInfo::decimal(38, 10);
        assert_eq!(ti.length, 17);
        assert_eq!(roundtrip(&ti), ti);
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let err = TypeInfo::decode(&mut Cursor::new(&[0x99, 0x00])).unwrap_err();
        assert_eq!(err, DecodeError::Protocol(ProtocolError::UnknownType(0x99)));
    }

    #[test]
    fn test_incomplete_type_info() {
        let err = TypeInfo::decode(&mut Cursor::new(&[0xE7, 0x40, 0x1F, 0x09])).unwrap_err();
        assert_eq!(err, DecodeError::NeedMoreData { required: 8 });
    }

    #[test]
    fn test_xml_schema_roundtrip() {
        let mut ti = TypeInfo::new(TypeId::Xml, MAX_LENGTH_MARKER);
        ti.xml_schema = Some(XmlSchema {
            db_name: "db".into(),
            owning_schema: "dbo".into(),
            collection: "coll".into(),
        });
        assert_eq!(roundtrip(&ti), ti);
    }

    #[test]
    fn test_colmetadata_no_metadata_marker() {
        let md = ColumnMetadata::decode(&mut Cursor::new(&[0xFF, 0xFF]), TdsVersion::V7_4).unwrap();
        assert!(md.is_empty());
    }

    #[test]
    fn test_colmetadata_roundtrip() {
        let md = ColumnMetadata {
            columns: vec![
                Column::new("id", TypeInfo::new(TypeId::IntN, 4)),
                Column::new(
                    "name",
                    TypeInfo::character(TypeId::NVarChar, MAX_LENGTH_MARKER, Collation::default()),
                ),
            ],
        };
        let mut buf = BytesMut::new();
        md.encode(&mut buf).unwrap();
        assert_eq!(buf[0], 0x81);
        let decoded = ColumnMetadata::decode(&mut Cursor::new(&buf[1..]), TdsVersion::V7_4).unwrap();
        assert_eq!(*decoded, md);
        assert!(decoded.columns[1].type_info.is_plp());
    }

    #[test]
    fn test_column_with_legacy_user_type() {
        // user type (2 bytes), flags, INT4, name "id".
        let data = [0x00, 0x00, 0x01, 0x00, 0x38, 0x02, b'i', 0, b'd', 0];
        let col = Column::decode(&mut Cursor::new(&data), TdsVersion::V7_1).unwrap();
        assert_eq!(col.type_info.type_id, TypeId::Int4);
        assert_eq!(col.type_info.length, 4);
        assert!(col.flags.is_nullable());
        assert_eq!(col.name, "id");
    }

    #[test]
    fn test_text_column_reads_table_name() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u16_le(0x0001);
        buf.put_u8(0x23);
        buf.put_u32_le(0x7FFF_FFFF);
        Collation::default().encode(&mut buf);
        buf.put_u8(2);
        write_us_varchar(&mut buf, "dbo").unwrap();
        write_us_varchar(&mut buf, "t").unwrap();
        write_b_varchar(&mut buf, "body").unwrap();
        let col = Column::decode(&mut Cursor::new(&buf), TdsVersion::V7_4).unwrap();
        assert_eq!(col.table_name.unwrap(), vec!["dbo".to_string(), "t".to_string()]);
        assert_eq!(col.name, "body");
    }
}
