//! `sql_variant` bodies.
//!
//! After the `u32` total length a variant carries its base type id, a
//! property-byte count, the base type's properties and then the value
//! bytes, which decode exactly as a column of the base type would.
//!
//! | Base type | Properties |
//! |-----------|------------|
//! | integers, float, money, datetime, guid, bit, date | none |
//! | time, datetime2, datetimeoffset | scale |
//! | decimal, numeric | precision, scale |
//! | binary, varbinary | `u16` max length |
//! | char, varchar, nchar, nvarchar | collation, `u16` max length |

use tdswire_types::SqlValue;

use crate::collation::Collation;
use crate::cursor::{Cursor, bounded};
use crate::error::{DecodeResult, ProtocolError};
use crate::metadata::{TypeInfo, scaled_length};
use crate::types::TypeId;
use crate::value::value_from_bytes;

/// Decode a variant body (the bytes after the total length).
pub fn decode_variant(body: &[u8]) -> DecodeResult<SqlValue> {
    bounded("sql_variant", decode_inner(body))
}

fn decode_inner(body: &[u8]) -> DecodeResult<SqlValue> {
    let mut cur = Cursor::new(body);
    let type_id = TypeId::from_u8(cur.read_u8()?)?;
    let prop_len = cur.read_u8()? as usize;
    let mut props = cur.sub(prop_len)?;
    let data = cur.read_bytes(cur.remaining())?;

    let ti = match type_id {
        TypeId::Int1
        | TypeId::Bit
        | TypeId::Int2
        | TypeId::Int4
        | TypeId::Int8
        | TypeId::Float4
        | TypeId::Float8
        | TypeId::Money
        | TypeId::Money4
        | TypeId::DateTime
        | TypeId::DateTime4
        | TypeId::Guid
        | TypeId::Date => TypeInfo::new(type_id, data.len() as u32),
        TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
            let scale = props.read_u8()?;
            let mut ti = TypeInfo::new(type_id, scaled_length(type_id, scale) as u32);
            ti.scale = scale;
            ti
        }
        TypeId::DecimalN | TypeId::NumericN => {
            let precision = props.read_u8()?;
            let scale = props.read_u8()?;
            let mut ti = TypeInfo::decimal(precision, scale);
            ti.type_id = type_id;
            ti
        }
        TypeId::BigVarBinary | TypeId::BigBinary => {
            TypeInfo::new(type_id, u32::from(props.read_u16_le()?))
        }
        TypeId::BigVarChar | TypeId::BigChar | TypeId::NVarChar | TypeId::NChar => {
            let collation = Collation::decode(&mut props)?;
            TypeInfo::character(type_id, u32::from(props.read_u16_le()?), collation)
        }
        other => {
            return Err(ProtocolError::InvalidField {
                field: "sql_variant",
                reason: format!("{} is not a valid base type", other.name()),
            }
            .into());
        }
    };
    value_from_bytes(&ti, data)
}
