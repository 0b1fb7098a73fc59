//! TDS token stream definitions.
//!
//! A tabular-result message is a flat sequence of tokens. Each starts
//! with a one-byte type and is followed by a body that is either fixed
//! size, length-prefixed, or self-describing through column metadata.
//!
//! [`decode_token`] decodes exactly one token from a [`Cursor`] and reports
//! [`DecodeError::NeedMoreData`](crate::error::DecodeError::NeedMoreData)
//! when the buffer ends inside it. The stateful wrapper that owns the
//! buffer and the current row shape is
//! [`TokenStreamParser`](crate::stream::TokenStreamParser).
//!
//! An unknown token type is fatal: there is no generic length field to
//! skip it by.
//!
//! The `encode` methods write the server-side form of each token. The
//! client only decodes; the encoders exist for in-process test servers.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use tdswire_types::SqlValue;

use crate::codec::{write_b_varchar, write_us_varchar, write_utf16};
use crate::collation::Collation;
use crate::cursor::{Cursor, bounded, decode_utf16};
use crate::error::{DecodeResult, ProtocolError};
use crate::metadata::{ColumnMetadata, TypeInfo};
use crate::types::ColumnFlags;
use crate::value::{decode_value, encode_value};
use crate::version::{ServerVersion, TdsVersion};

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetadata = 0x81,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Return value of an output parameter (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column ordering (ORDER).
    Order = 0xA9,
    /// Column info for browse mode (COLINFO).
    ColInfo = 0xA5,
    /// Table names for browse mode (TABNAME).
    TabName = 0xA4,
    /// Statement offset (OFFSET).
    Offset = 0x78,
}

impl TokenType {
    /// Parse a token type byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x81 => Self::ColMetadata,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xAE => Self::FeatureExtAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xE4 => Self::SessionState,
            0xED => Self::Sspi,
            0xEE => Self::FedAuthInfo,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            0x79 => Self::ReturnStatus,
            0xA9 => Self::Order,
            0xA5 => Self::ColInfo,
            0xA4 => Self::TabName,
            0x78 => Self::Offset,
            _ => return Err(ProtocolError::UnknownToken(value)),
        })
    }
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// New result-set shape.
    ColMetadata(Arc<ColumnMetadata>),
    /// One row of the current result set (ROW or NBCROW).
    Row(Row),
    /// End of a SQL statement.
    Done(Done),
    /// End of a stored procedure.
    DoneProc(Done),
    /// End of a statement inside a stored procedure.
    DoneInProc(Done),
    /// Stored procedure return status.
    ReturnStatus(i32),
    /// Output parameter value.
    ReturnValue(ReturnValue),
    /// Server error.
    Error(ServerMessage),
    /// Server informational message.
    Info(ServerMessage),
    /// Login accepted.
    LoginAck(LoginAck),
    /// Session environment change.
    EnvChange(EnvChange),
    /// ORDER BY column numbers of the current result set.
    Order(Vec<u16>),
    /// Acknowledged Login7 feature extensions.
    FeatureExtAck(FeatureExtAck),
    /// SSPI (NTLM) challenge bytes.
    Sspi(Bytes),
    /// Federated authentication endpoint details.
    FedAuthInfo(FedAuthInfo),
}

bitflags! {
    /// DONE, DONEPROC and DONEINPROC status bits. No bits set is `FINAL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is open.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRV_ERROR = 0x0100;
    }
}

/// DONE, DONEPROC or DONEINPROC body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Token of the statement that completed.
    pub cur_cmd: u16,
    /// Rows affected, meaningful when [`DoneStatus::COUNT`] is set.
    pub row_count: u64,
}

impl Done {
    /// Decode a DONE body. The row count is 8 bytes from TDS 7.2 on.
    pub fn decode(cur: &mut Cursor<'_>, version: TdsVersion) -> DecodeResult<Self> {
        let status = DoneStatus::from_bits_retain(cur.read_u16_le()?);
        let cur_cmd = cur.read_u16_le()?;
        let row_count = if version.has_wide_row_count() {
            cur.read_u64_le()?
        } else {
            u64::from(cur.read_u32_le()?)
        };
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode with the token byte, using the 8-byte row count.
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) {
        dst.put_u8(token as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        dst.put_u64_le(self.row_count);
    }

    /// Whether more results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether this acknowledges an attention.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Whether the statement reported an error.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.intersects(DoneStatus::ERROR.union(DoneStatus::SRV_ERROR))
    }

    /// Row count, if the server marked it valid.
    #[must_use]
    pub const fn rows_affected(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }
}

/// ERROR or INFO body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name, empty for batches.
    pub procedure: String,
    /// Line number within the batch or procedure.
    pub line: u32,
}

impl ServerMessage {
    /// Decode an ERROR or INFO body.
    pub fn decode(cur: &mut Cursor<'_>, version: TdsVersion) -> DecodeResult<Self> {
        let len = cur.read_u16_le()? as usize;
        let mut body = cur.sub(len)?;
        bounded("error token", Self::decode_body(&mut body, version))
    }

    fn decode_body(cur: &mut Cursor<'_>, version: TdsVersion) -> DecodeResult<Self> {
        Ok(Self {
            number: cur.read_i32_le()?,
            state: cur.read_u8()?,
            class: cur.read_u8()?,
            message: cur.read_us_varchar()?,
            server: cur.read_b_varchar()?,
            procedure: cur.read_b_varchar()?,
            line: if version.has_wide_row_count() {
                cur.read_u32_le()?
            } else {
                u32::from(cur.read_u16_le()?)
            },
        })
    }

    /// Encode as an ERROR or INFO token.
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_i32_le(self.number);
        body.put_u8(self.state);
        body.put_u8(self.class);
        write_us_varchar(&mut body, &self.message)?;
        write_b_varchar(&mut body, &self.server)?;
        write_b_varchar(&mut body, &self.procedure)?;
        body.put_u32_le(self.line);
        put_u16_len(dst, token, &body)
    }
}

/// LOGINACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface: 0 = SQL default, 1 = T-SQL.
    pub interface: u8,
    /// Negotiated TDS version.
    pub tds_version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: ServerVersion,
}

impl LoginAck {
    /// Decode a LOGINACK body.
    pub fn decode(cur: &mut Cursor<'_>) -> DecodeResult<Self> {
        let len = cur.read_u16_le()? as usize;
        let mut body = cur.sub(len)?;
        bounded("loginack", Self::decode_body(&mut body))
    }

    fn decode_body(cur: &mut Cursor<'_>) -> DecodeResult<Self> {
        let interface = cur.read_u8()?;
        // The version is the one big-endian field in the token.
        let tds_version = TdsVersion::new(cur.read_u32_be()?);
        let prog_name = cur.read_b_varchar()?;
        let prog_version = ServerVersion::from_raw(cur.read_u32_be()?, 0);
        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode as a LOGINACK token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(self.interface);
        body.put_u32(self.tds_version.raw());
        write_b_varchar(&mut body, &self.prog_name)?;
        let v = self.prog_version;
        body.put_u8(v.major);
        body.put_u8(v.minor);
        body.put_u16(v.build);
        put_u16_len(dst, TokenType::LoginAck, &body)
    }
}

/// ENVCHANGE sub-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Current database.
    Database = 1,
    /// Session language.
    Language = 2,
    /// Character set.
    CharacterSet = 3,
    /// Negotiated packet size.
    PacketSize = 4,
    /// Unicode sort locale id.
    UnicodeSortLocale = 5,
    /// Unicode comparison flags.
    UnicodeComparisonFlags = 6,
    /// Database collation.
    SqlCollation = 7,
    /// Transaction started.
    BeginTransaction = 8,
    /// Transaction committed.
    CommitTransaction = 9,
    /// Transaction rolled back.
    RollbackTransaction = 10,
    /// Enlisted in a DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defected from a transaction.
    DefectTransaction = 12,
    /// Database mirroring partner.
    MirrorPartner = 13,
    /// Transaction promoted to DTC.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Reset-connection request completed.
    ResetConnectionAck = 18,
    /// User instance name.
    UserInstance = 19,
    /// Redirect to another server.
    Routing = 20,
}

impl EnvChangeType {
    /// Parse a sub-type byte. Unknown sub-types return `None`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortLocale,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::MirrorPartner,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            19 => Self::UserInstance,
            20 => Self::Routing,
            _ => return None,
        })
    }
}

/// ENVCHANGE old or new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// B_VARCHAR text.
    String(String),
    /// Opaque bytes (transaction descriptors, DTC data).
    Binary(Bytes),
    /// A collation; `None` when the server sent an empty value.
    Collation(Option<Collation>),
    /// Routing target.
    Routing {
        /// Host name.
        host: String,
        /// TCP port.
        port: u16,
    },
}

/// ENVCHANGE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// What changed.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Decode an ENVCHANGE body. Unknown sub-types are skipped and yield
    /// `None`.
    pub fn decode(cur: &mut Cursor<'_>) -> DecodeResult<Option<Self>> {
        let len = cur.read_u16_le()? as usize;
        let mut body = cur.sub(len)?;
        bounded("envchange", Self::decode_body(&mut body))
    }

    fn decode_body(cur: &mut Cursor<'_>) -> DecodeResult<Option<Self>> {
        let raw = cur.read_u8()?;
        let Some(env_type) = EnvChangeType::from_u8(raw) else {
            tracing::debug!(env_type = raw, "skipping unknown ENVCHANGE type");
            return Ok(None);
        };
        let (new_value, old_value) = match env_type {
            EnvChangeType::Database
            | EnvChangeType::Language
            | EnvChangeType::CharacterSet
            | EnvChangeType::PacketSize
            | EnvChangeType::UnicodeSortLocale
            | EnvChangeType::UnicodeComparisonFlags
            | EnvChangeType::MirrorPartner
            | EnvChangeType::UserInstance => (
                EnvChangeValue::String(cur.read_b_varchar()?),
                EnvChangeValue::String(cur.read_b_varchar()?),
            ),
            EnvChangeType::SqlCollation => (
                Self::collation(cur.read_b_varbyte()?),
                Self::collation(cur.read_b_varbyte()?),
            ),
            EnvChangeType::PromoteTransaction => {
                let len = cur.read_u32_le()? as usize;
                let new = Bytes::copy_from_slice(cur.read_bytes(len)?);
                (EnvChangeValue::Binary(new), EnvChangeValue::Binary(Bytes::new()))
            }
            EnvChangeType::Routing => {
                let len = cur.read_u16_le()? as usize;
                let mut routing = cur.sub(len)?;
                let _protocol = routing.read_u8()?;
                let port = routing.read_u16_le()?;
                let host = routing.read_us_varchar()?;
                (
                    EnvChangeValue::Routing { host, port },
                    EnvChangeValue::Binary(Bytes::new()),
                )
            }
            EnvChangeType::BeginTransaction
            | EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction
            | EnvChangeType::DefectTransaction
            | EnvChangeType::TransactionManagerAddress
            | EnvChangeType::TransactionEnded
            | EnvChangeType::ResetConnectionAck => (
                EnvChangeValue::Binary(Bytes::copy_from_slice(cur.read_b_varbyte()?)),
                EnvChangeValue::Binary(Bytes::copy_from_slice(cur.read_b_varbyte()?)),
            ),
        };
        Ok(Some(Self {
            env_type,
            new_value,
            old_value,
        }))
    }

    fn collation(bytes: &[u8]) -> EnvChangeValue {
        EnvChangeValue::Collation(<[u8; 5]>::try_from(bytes).ok().map(Collation::from_bytes))
    }

    /// Routing target, if this is a routing change.
    #[must_use]
    pub fn routing(&self) -> Option<(&str, u16)> {
        match &self.new_value {
            EnvChangeValue::Routing { host, port } => Some((host, *port)),
            _ => None,
        }
    }

    /// New packet size, if this is a packet-size change.
    #[must_use]
    pub fn packet_size(&self) -> Option<u32> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::PacketSize, EnvChangeValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// New database name, if this is a database change.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::Database, EnvChangeValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// New collation, if this is a collation change.
    #[must_use]
    pub fn collation_value(&self) -> Option<Collation> {
        match &self.new_value {
            EnvChangeValue::Collation(c) => *c,
            _ => None,
        }
    }

    /// New transaction descriptor for begin-transaction changes, or `0`
    /// once a transaction commits or rolls back.
    #[must_use]
    pub fn transaction_descriptor(&self) -> Option<u64> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::BeginTransaction | EnvChangeType::EnlistDtcTransaction, EnvChangeValue::Binary(b)) => {
                <[u8; 8]>::try_from(b.as_ref()).ok().map(u64::from_le_bytes)
            }
            (
                EnvChangeType::CommitTransaction
                | EnvChangeType::RollbackTransaction
                | EnvChangeType::DefectTransaction
                | EnvChangeType::TransactionEnded,
                _,
            ) => Some(0),
            _ => None,
        }
    }

    /// Encode a string-valued change.
    pub fn encode_string(
        env_type: EnvChangeType,
        new: &str,
        old: &str,
        dst: &mut impl BufMut,
    ) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(env_type as u8);
        write_b_varchar(&mut body, new)?;
        write_b_varchar(&mut body, old)?;
        put_u16_len(dst, TokenType::EnvChange, &body)
    }

    /// Encode a routing change.
    pub fn encode_routing(host: &str, port: u16, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut routing = BytesMut::new();
        routing.put_u8(0);
        routing.put_u16_le(port);
        write_us_varchar(&mut routing, host)?;
        let mut body = BytesMut::new();
        body.put_u8(EnvChangeType::Routing as u8);
        body.put_u16_le(routing.len() as u16);
        body.put_slice(&routing);
        body.put_u16_le(0);
        put_u16_len(dst, TokenType::EnvChange, &body)
    }

    /// Encode a binary-valued change such as a transaction descriptor.
    pub fn encode_binary(
        env_type: EnvChangeType,
        new: &[u8],
        old: &[u8],
        dst: &mut impl BufMut,
    ) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        body.put_u8(env_type as u8);
        for value in [new, old] {
            let len = u8::try_from(value.len()).map_err(|_| ProtocolError::TooLong {
                field: "envchange value",
                length: value.len(),
                max: 255,
            })?;
            body.put_u8(len);
            body.put_slice(value);
        }
        put_u16_len(dst, TokenType::EnvChange, &body)
    }
}

/// One acknowledged feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Feature id.
    pub feature_id: u8,
    /// Feature-specific data.
    pub data: Bytes,
}

/// FEATUREEXTACK body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureExtAck {
    /// Acknowledged features in order.
    pub features: Vec<FeatureAck>,
}

impl FeatureExtAck {
    const TERMINATOR: u8 = 0xFF;

    /// Decode until the `0xFF` terminator.
    pub fn decode(cur: &mut Cursor<'_>) -> DecodeResult<Self> {
        let mut features = Vec::new();
        loop {
            let feature_id = cur.read_u8()?;
            if feature_id == Self::TERMINATOR {
                break;
            }
            let len = cur.read_u32_le()? as usize;
            let data = Bytes::copy_from_slice(cur.read_bytes(len)?);
            features.push(FeatureAck { feature_id, data });
        }
        Ok(Self { features })
    }

    /// Acknowledgment for a feature id.
    #[must_use]
    pub fn get(&self, feature_id: u8) -> Option<&FeatureAck> {
        self.features.iter().find(|f| f.feature_id == feature_id)
    }

    /// Encode as a FEATUREEXTACK token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(TokenType::FeatureExtAck as u8);
        for f in &self.features {
            dst.put_u8(f.feature_id);
            dst.put_u32_le(f.data.len() as u32);
            dst.put_slice(&f.data);
        }
        dst.put_u8(Self::TERMINATOR);
    }
}

/// FEDAUTHINFO body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FedAuthInfo {
    /// Security token service URL.
    pub sts_url: String,
    /// Service principal name of the server.
    pub spn: String,
}

impl FedAuthInfo {
    const STS_URL: u8 = 0x01;
    const SPN: u8 = 0x02;

    /// Decode a FEDAUTHINFO body. Option data offsets are relative to the
    /// count field.
    pub fn decode(cur: &mut Cursor<'_>) -> DecodeResult<Self> {
        let len = cur.read_u32_le()? as usize;
        let body = cur.read_bytes(len)?;
        bounded("fedauthinfo", Self::decode_body(body))
    }

    fn decode_body(body: &[u8]) -> DecodeResult<Self> {
        let mut cur = Cursor::new(body);
        let count = cur.read_u32_le()?;
        let mut info = Self::default();
        for _ in 0..count {
            let id = cur.read_u8()?;
            let data_len = cur.read_u32_le()? as usize;
            let offset = cur.read_u32_le()? as usize;
            let data = body
                .get(offset..offset.saturating_add(data_len))
                .ok_or_else(|| ProtocolError::InvalidField {
                    field: "fedauthinfo",
                    reason: format!("option {id} outside token"),
                })?;
            match id {
                Self::STS_URL => info.sts_url = decode_utf16(data)?,
                Self::SPN => info.spn = decode_utf16(data)?,
                other => tracing::trace!(id = other, "ignoring FEDAUTHINFO option"),
            }
        }
        Ok(info)
    }

    /// Encode as a FEDAUTHINFO token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let sts: Vec<u8> = utf16_bytes(&self.sts_url);
        let spn: Vec<u8> = utf16_bytes(&self.spn);
        let header = 4 + 2 * 9;
        let mut body = BytesMut::new();
        body.put_u32_le(2);
        body.put_u8(Self::STS_URL);
        body.put_u32_le(sts.len() as u32);
        body.put_u32_le(header as u32);
        body.put_u8(Self::SPN);
        body.put_u32_le(spn.len() as u32);
        body.put_u32_le((header + sts.len()) as u32);
        body.put_slice(&sts);
        body.put_slice(&spn);
        dst.put_u8(TokenType::FedAuthInfo as u8);
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
    }
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    write_utf16(&mut out, s);
    out
}

/// RETURNVALUE body.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name including the `@`.
    pub name: String,
    /// 0x01 for an output parameter, 0x02 for a UDF return value.
    pub status: u8,
    /// User type id.
    pub user_type: u32,
    /// Column-style flags.
    pub flags: ColumnFlags,
    /// Value type.
    pub type_info: TypeInfo,
    /// Decoded value.
    pub value: SqlValue,
}

impl ReturnValue {
    /// Decode a RETURNVALUE body.
    pub fn decode(cur: &mut Cursor<'_>, version: TdsVersion) -> DecodeResult<Self> {
        let ordinal = cur.read_u16_le()?;
        let name = cur.read_b_varchar()?;
        let status = cur.read_u8()?;
        let user_type = if version.user_type_width() == 4 {
            cur.read_u32_le()?
        } else {
            u32::from(cur.read_u16_le()?)
        };
        let flags = ColumnFlags::from_bits(cur.read_u16_le()?);
        let type_info = TypeInfo::decode(cur)?;
        let value = decode_value(cur, &type_info)?;
        Ok(Self {
            ordinal,
            name,
            status,
            user_type,
            flags,
            type_info,
            value,
        })
    }

    /// Encode as a RETURNVALUE token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        dst.put_u8(TokenType::ReturnValue as u8);
        dst.put_u16_le(self.ordinal);
        write_b_varchar(dst, &self.name)?;
        dst.put_u8(self.status);
        dst.put_u32_le(self.user_type);
        dst.put_u16_le(self.flags.bits());
        self.type_info.encode(dst)?;
        encode_value(dst, &self.type_info, &self.value)
    }
}

/// A decoded row, sharing the metadata of its result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Shape of the result set.
    pub metadata: Arc<ColumnMetadata>,
    /// One value per column.
    pub values: Vec<SqlValue>,
}

impl Row {
    /// Decode a ROW body.
    pub fn decode(cur: &mut Cursor<'_>, metadata: &Arc<ColumnMetadata>) -> DecodeResult<Self> {
        let values = metadata
            .columns
            .iter()
            .map(|col| decode_value(cur, &col.type_info))
            .collect::<DecodeResult<Vec<_>>>()?;
        Ok(Self {
            metadata: Arc::clone(metadata),
            values,
        })
    }

    /// Decode an NBCROW body: a null bitmap, then only non-null values.
    pub fn decode_nbc(cur: &mut Cursor<'_>, metadata: &Arc<ColumnMetadata>) -> DecodeResult<Self> {
        let bitmap = cur.read_bytes(metadata.len().div_ceil(8))?;
        let mut values = Vec::with_capacity(metadata.len());
        for (i, col) in metadata.columns.iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) != 0 {
                values.push(SqlValue::Null);
            } else {
                values.push(decode_value(cur, &col.type_info)?);
            }
        }
        Ok(Self {
            metadata: Arc::clone(metadata),
            values,
        })
    }

    /// Value of a column by position.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value of a column by name, case-insensitively.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&SqlValue> {
        self.metadata.position(name).and_then(|i| self.values.get(i))
    }

    /// Encode values as a ROW token against `metadata`.
    pub fn encode(
        metadata: &ColumnMetadata,
        values: &[SqlValue],
        dst: &mut impl BufMut,
    ) -> Result<(), ProtocolError> {
        dst.put_u8(TokenType::Row as u8);
        for (col, value) in metadata.columns.iter().zip(values) {
            encode_value(dst, &col.type_info, value)?;
        }
        Ok(())
    }
}

fn put_u16_len(dst: &mut impl BufMut, token: TokenType, body: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(body.len()).map_err(|_| ProtocolError::TooLong {
        field: "token",
        length: body.len(),
        max: u16::MAX as usize,
    })?;
    dst.put_u8(token as u8);
    dst.put_u16_le(len);
    dst.put_slice(body);
    Ok(())
}

/// Decode one token starting at the cursor.
///
/// `metadata` is the shape of the current result set, required by ROW and
/// NBCROW. Returns `Ok(None)` for tokens that were consumed but carry
/// nothing the client acts on (browse-mode info, session state, offsets
/// and unknown ENVCHANGE sub-types).
pub fn decode_token(
    cur: &mut Cursor<'_>,
    version: TdsVersion,
    metadata: Option<&Arc<ColumnMetadata>>,
) -> DecodeResult<Option<Token>> {
    let token_type = TokenType::from_u8(cur.read_u8()?)?;
    let token = match token_type {
        TokenType::ColMetadata => Token::ColMetadata(ColumnMetadata::decode(cur, version)?),
        TokenType::Row | TokenType::NbcRow => {
            let metadata = metadata.ok_or(ProtocolError::MissingMetadata)?;
            if token_type == TokenType::Row {
                Token::Row(Row::decode(cur, metadata)?)
            } else {
                Token::Row(Row::decode_nbc(cur, metadata)?)
            }
        }
        TokenType::Done => Token::Done(Done::decode(cur, version)?),
        TokenType::DoneProc => Token::DoneProc(Done::decode(cur, version)?),
        TokenType::DoneInProc => Token::DoneInProc(Done::decode(cur, version)?),
        TokenType::ReturnStatus => Token::ReturnStatus(cur.read_i32_le()?),
        TokenType::ReturnValue => Token::ReturnValue(ReturnValue::decode(cur, version)?),
        TokenType::Error => Token::Error(ServerMessage::decode(cur, version)?),
        TokenType::Info => Token::Info(ServerMessage::decode(cur, version)?),
        TokenType::LoginAck => Token::LoginAck(LoginAck::decode(cur)?),
        TokenType::EnvChange => match EnvChange::decode(cur)? {
            Some(env) => Token::EnvChange(env),
            None => return Ok(None),
        },
        TokenType::Order => {
            let len = cur.read_u16_le()? as usize;
            let mut body = cur.sub(len)?;
            let columns = (0..len / 2)
                .map(|_| body.read_u16_le())
                .collect::<DecodeResult<Vec<_>>>()?;
            Token::Order(columns)
        }
        TokenType::FeatureExtAck => Token::FeatureExtAck(FeatureExtAck::decode(cur)?),
        TokenType::Sspi => {
            let data = cur.read_us_varbyte()?;
            Token::Sspi(Bytes::copy_from_slice(data))
        }
        TokenType::FedAuthInfo => Token::FedAuthInfo(FedAuthInfo::decode(cur)?),
        TokenType::ColInfo | TokenType::TabName => {
            let len = cur.read_u16_le()? as usize;
            cur.skip(len)?;
            return Ok(None);
        }
        TokenType::SessionState => {
            let len = cur.read_u32_le()? as usize;
            cur.skip(len)?;
            return Ok(None);
        }
        TokenType::Offset => {
            cur.skip(4)?;
            return Ok(None);
        }
    };
    Ok(Some(token))
}
