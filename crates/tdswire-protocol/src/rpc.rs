//! RPC request payloads (packet type 0x03).
//!
//! ```text
//! ALL_HEADERS
//! proc:      0xFFFF + u16 well-known id | US_VARCHAR name
//! options:   u16
//! param*:    B_VARCHAR name, u8 status, TYPE_INFO, value
//! ```
//!
//! Parameterized SQL goes through `sp_executesql` by id. The statement and
//! the declaration list are its first two (unnamed) parameters, followed by
//! the caller's parameters.
//!
//! A parameter may be streamed: its TYPE_INFO is a `(max)` type and the
//! value bytes are produced later as an unknown-length PLP body. Encoding
//! then yields [`RpcPart`]s with a gap where each stream goes.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tdswire_types::{SqlValue, TypeError};

use crate::codec::{write_b_varchar, write_us_varchar};
use crate::collation::Collation;
use crate::error::{ParamError, ProtocolError};
use crate::sql_batch::{ALL_HEADERS_LEN, write_all_headers};
use crate::value::{SqlType, TypeLength, encode_value};

/// Well-known procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// `sp_executesql`.
    ExecuteSql = 0x000A,
}

const PROC_ID_MARKER: u16 = 0xFFFF;

bitflags! {
    /// Per-parameter status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamStatus: u8 {
        /// Output parameter.
        const BY_REF = 0x01;
        /// Use the procedure's default value.
        const DEFAULT_VALUE = 0x02;
    }
}

/// Where a parameter's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamData {
    /// Buffered value.
    Value(SqlValue),
    /// Bytes supplied later as an unknown-length PLP body.
    Stream,
}

/// One RPC parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParam {
    /// Name including the leading `@`, or empty for positional.
    pub name: String,
    /// Status flags.
    pub status: ParamStatus,
    /// Declared type.
    pub sql_type: SqlType,
    /// Value source.
    pub data: ParamData,
}

impl RpcParam {
    /// Input parameter with an explicit type.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType, value: SqlValue) -> Self {
        Self {
            name: name.into(),
            status: ParamStatus::empty(),
            sql_type,
            data: ParamData::Value(value),
        }
    }

    /// Input parameter whose type is inferred from the value.
    #[must_use]
    pub fn infer(name: impl Into<String>, value: SqlValue) -> Self {
        let sql_type = SqlType::infer(&value);
        Self::new(name, sql_type, value)
    }

    /// Streamed parameter. Only `(max)` and `xml` types can be streamed.
    pub fn streamed(name: impl Into<String>, sql_type: SqlType) -> Result<Self, ParamError> {
        if !sql_type.is_plp() {
            return Err(TypeError::TypeMismatch {
                expected: "a (max) type",
                actual: sql_type.name(),
            }
            .into());
        }
        Ok(Self {
            name: name.into(),
            status: ParamStatus::empty(),
            sql_type,
            data: ParamData::Stream,
        })
    }

    /// Mark as an output parameter.
    #[must_use]
    pub fn output(mut self) -> Self {
        self.status |= ParamStatus::BY_REF;
        self
    }

    /// Whether this is an output parameter.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.status.contains(ParamStatus::BY_REF)
    }

    /// Validate the value against the declared type, replacing it with
    /// the form the encoder expects. Streams are checked when declared.
    pub fn coerce(&mut self, collation: Collation) -> Result<(), ParamError> {
        if let ParamData::Value(value) = &self.data {
            self.data = ParamData::Value(self.sql_type.coerce(value, collation)?);
        }
        Ok(())
    }

    fn encode_head(&self, dst: &mut BytesMut, collation: Collation) -> Result<(), ProtocolError> {
        write_b_varchar(dst, &self.name)?;
        dst.put_u8(self.status.bits());
        self.sql_type.type_info(collation).encode(dst)
    }
}

/// Procedure to call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcTarget {
    /// Well-known id.
    Id(ProcId),
    /// Procedure name, optionally schema-qualified.
    Name(String),
}

/// Piece of an encoded RPC payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcPart {
    /// Encoded bytes.
    Bytes(Bytes),
    /// PLP body of the parameter at this index goes here.
    Stream(usize),
}

/// An RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    target: RpcTarget,
    options: u16,
    params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Call a stored procedure by name.
    #[must_use]
    pub fn procedure(name: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            target: RpcTarget::Name(name.into()),
            options: 0,
            params,
        }
    }

    /// Run parameterized SQL through `sp_executesql`.
    #[must_use]
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        let mut all = Vec::with_capacity(params.len() + 2);
        all.push(RpcParam::infer("", SqlValue::String(sql.to_owned())));
        if !params.is_empty() {
            all.push(RpcParam::infer("", SqlValue::String(declarations(&params))));
        }
        all.extend(params);
        Self {
            target: RpcTarget::Id(ProcId::ExecuteSql),
            options: 0,
            params: all,
        }
    }

    /// Procedure being called.
    #[must_use]
    pub fn target(&self) -> &RpcTarget {
        &self.target
    }

    /// All parameters in wire order.
    #[must_use]
    pub fn params(&self) -> &[RpcParam] {
        &self.params
    }

    /// Mutable access for validation.
    pub fn params_mut(&mut self) -> &mut [RpcParam] {
        &mut self.params
    }

    /// Whether any parameter is streamed.
    #[must_use]
    pub fn has_streams(&self) -> bool {
        self.params.iter().any(|p| p.data == ParamData::Stream)
    }

    /// Encode into parts, leaving a [`RpcPart::Stream`] gap for each
    /// streamed parameter.
    pub fn encode_parts(
        &self,
        transaction_descriptor: u64,
        collation: Collation,
    ) -> Result<Vec<RpcPart>, ProtocolError> {
        let mut parts = Vec::new();
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + 64);
        write_all_headers(&mut buf, transaction_descriptor);
        match &self.target {
            RpcTarget::Id(id) => {
                buf.put_u16_le(PROC_ID_MARKER);
                buf.put_u16_le(*id as u16);
            }
            RpcTarget::Name(name) => write_us_varchar(&mut buf, name)?,
        }
        buf.put_u16_le(self.options);

        for (index, param) in self.params.iter().enumerate() {
            param.encode_head(&mut buf, collation)?;
            match &param.data {
                ParamData::Value(value) => {
                    encode_value(&mut buf, &param.sql_type.type_info(collation), value)?;
                }
                ParamData::Stream => {
                    parts.push(RpcPart::Bytes(buf.split().freeze()));
                    parts.push(RpcPart::Stream(index));
                }
            }
        }
        if !buf.is_empty() {
            parts.push(RpcPart::Bytes(buf.freeze()));
        }
        Ok(parts)
    }

    /// Encode a request without streamed parameters into one buffer.
    pub fn encode(&self, transaction_descriptor: u64, collation: Collation) -> Result<Bytes, ProtocolError> {
        let parts = self.encode_parts(transaction_descriptor, collation)?;
        let mut out = BytesMut::new();
        for part in parts {
            match part {
                RpcPart::Bytes(b) => out.extend_from_slice(&b),
                RpcPart::Stream(index) => {
                    return Err(ProtocolError::InvalidField {
                        field: "rpc parameter",
                        reason: format!("parameter {index} is streamed"),
                    });
                }
            }
        }
        Ok(out.freeze())
    }
}

/// Build the `sp_executesql` declaration list, e.g.
/// `@p1 int, @p2 nvarchar(4000) output`.
#[must_use]
pub fn declarations(params: &[RpcParam]) -> String {
    params
        .iter()
        .map(|p| {
            let mut decl = format!("{} {}", p.name, p.sql_type.declaration());
            if p.is_output() {
                decl.push_str(" output");
            }
            decl
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `nvarchar(max)`, the type used for streamed text parameters.
pub const NVARCHAR_MAX: SqlType = SqlType::NVarChar(TypeLength::Max);
