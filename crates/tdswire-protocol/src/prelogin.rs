//! PRELOGIN message encoding and decoding.
//!
//! PRELOGIN is the first exchange on every connection. It is a list of
//! 5-byte option descriptors (`token:u8, offset:u16 BE, length:u16 BE`)
//! terminated by `0xFF`, followed by the option data the offsets point at.
//! Offsets are measured from the start of the payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cursor::Cursor;
use crate::error::{DecodeError, ProtocolError};
use crate::version::{ServerVersion, TdsVersion};

/// Pre-login option tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name (for named instances).
    Instance = 0x02,
    /// Thread ID.
    ThreadId = 0x03,
    /// MARS (Multiple Active Result Sets) support.
    Mars = 0x04,
    /// Trace ID for distributed tracing.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Terminator (end of options).
    Terminator = 0xFF,
}

/// Encryption setting exchanged in PRELOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login packet only.
    #[default]
    Off = 0x00,
    /// Encrypt everything.
    On = 0x01,
    /// No TLS available.
    NotSupported = 0x02,
    /// Server insists on encryption.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            _ => Err(ProtocolError::InvalidField {
                field: "PRELOGIN encryption",
                reason: format!("unknown level 0x{value:02X}"),
            }),
        }
    }

    /// Whether this side is asking for an encrypted session.
    #[must_use]
    pub const fn wants_encryption(self) -> bool {
        matches!(self, Self::On | Self::Required)
    }
}

/// Pre-login message.
///
/// `version` is the client's TDS version on the way out. The server
/// answers with its product version in `server_version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreLogin {
    /// TDS version requested by the client.
    pub version: TdsVersion,
    /// Product version reported by the server.
    pub server_version: Option<ServerVersion>,
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name (for named instances).
    pub instance: Option<String>,
    /// Thread ID.
    pub thread_id: Option<u32>,
    /// MARS enabled.
    pub mars: bool,
    /// Trace ID: activity GUID bytes and sequence.
    pub trace_id: Option<([u8; 16], u32)>,
    /// Federated authentication required / supported.
    pub fed_auth_required: bool,
}

impl PreLogin {
    /// Create a pre-login request for `version`.
    #[must_use]
    pub fn new(version: TdsVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Set the encryption level.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the thread id option.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Announce federated authentication support.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = required;
        self
    }

    /// Encode the pre-login message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut options: Vec<(PreLoginOption, BytesMut)> = Vec::with_capacity(7);

        let mut version = BytesMut::with_capacity(6);
        version.put_u32(self.version.raw());
        version.put_u16_le(0);
        options.push((PreLoginOption::Version, version));

        options.push((PreLoginOption::Encryption, single(self.encryption as u8)));

        let mut instance = BytesMut::new();
        if let Some(name) = &self.instance {
            instance.put_slice(name.as_bytes());
        }
        instance.put_u8(0);
        options.push((PreLoginOption::Instance, instance));

        if let Some(thread_id) = self.thread_id {
            let mut buf = BytesMut::with_capacity(4);
            buf.put_u32(thread_id);
            options.push((PreLoginOption::ThreadId, buf));
        }

        options.push((PreLoginOption::Mars, single(u8::from(self.mars))));

        if let Some((activity_id, sequence)) = self.trace_id {
            let mut buf = BytesMut::with_capacity(36);
            buf.put_slice(&activity_id);
            buf.put_u32_le(sequence);
            buf.put_slice(&[0u8; 16]);
            options.push((PreLoginOption::TraceId, buf));
        }

        if self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, single(1)));
        }

        let header_size = options.len() * 5 + 1;
        let data_size: usize = options.iter().map(|(_, d)| d.len()).sum();
        let mut buf = BytesMut::with_capacity(header_size + data_size);
        let mut offset = header_size as u16;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset);
            buf.put_u16(data.len() as u16);
            offset += data.len() as u16;
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in options {
            buf.put_slice(&data);
        }
        buf.freeze()
    }

    /// Decode a pre-login response.
    ///
    /// The payload is a complete message, so running out of bytes is a
    /// malformed response. Unknown option tokens are skipped.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut prelogin = Self::default();
        let mut cur = Cursor::new(payload);
        let mut descriptors = Vec::new();
        loop {
            let token = truncated(cur.read_u8())?;
            if token == PreLoginOption::Terminator as u8 {
                break;
            }
            let offset = truncated(cur.read_u16_be())? as usize;
            let length = truncated(cur.read_u16_be())? as usize;
            descriptors.push((token, offset, length));
        }

        for (token, offset, length) in descriptors {
            let data = payload
                .get(offset..offset + length)
                .ok_or_else(|| ProtocolError::InvalidField {
                    field: "PRELOGIN option",
                    reason: format!("option 0x{token:02X} points past the payload"),
                })?;
            match token {
                0x00 if length >= 4 => {
                    let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    let sub_build = if length >= 6 {
                        u16::from_le_bytes([data[4], data[5]])
                    } else {
                        0
                    };
                    prelogin.server_version = Some(ServerVersion::from_raw(raw, sub_build));
                }
                0x01 if length >= 1 => {
                    prelogin.encryption = EncryptionLevel::from_u8(data[0])?;
                }
                0x02 if length > 0 => {
                    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                    let name = String::from_utf8_lossy(&data[..end]);
                    if !name.is_empty() {
                        prelogin.instance = Some(name.into_owned());
                    }
                }
                0x03 if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                0x04 if length >= 1 => prelogin.mars = data[0] != 0,
                0x06 if length >= 1 => prelogin.fed_auth_required = data[0] != 0,
                _ => {}
            }
        }

        Ok(prelogin)
    }
}

fn single(byte: u8) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1);
    buf.put_u8(byte);
    buf
}

fn truncated<T>(r: Result<T, DecodeError>) -> Result<T, ProtocolError> {
    r.map_err(|e| match e {
        DecodeError::NeedMoreData { .. } => ProtocolError::InvalidField {
            field: "PRELOGIN",
            reason: "truncated option list".into(),
        },
        DecodeError::Protocol(p) => p,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_prelogin_encode_layout() {
        let encoded = PreLogin::new(TdsVersion::V7_4)
            .with_encryption(EncryptionLevel::On)
            .encode();
        // VERSION, ENCRYPTION, INSTANCE, MARS + terminator.
        assert_eq!(encoded[0], PreLoginOption::Version as u8);
        assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), 21);
        assert_eq!(u16::from_be_bytes([encoded[3], encoded[4]]), 6);
        assert_eq!(encoded[20], PreLoginOption::Terminator as u8);
        assert_eq!(&encoded[21..25], &[0x74, 0x00, 0x00, 0x04]);
        assert_eq!(encoded[27], EncryptionLevel::On as u8);
    }

    #[test]
    fn test_prelogin_decode_out_of_order_offsets() {
        let mut buf = BytesMut::new();
        buf.put_u8(PreLoginOption::Encryption as u8);
        buf.put_u16(11);
        buf.put_u16(1);
        buf.put_u8(PreLoginOption::Version as u8);
        buf.put_u16(12);
        buf.put_u16(6);
        buf.put_u8(PreLoginOption::Terminator as u8);
        buf.put_u8(0x03);
        buf.put_slice(&[0x10, 0x00, 0x0F, 0xA0]);
        buf.put_u16_le(2);

        let decoded = PreLogin::decode(&buf).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::Required);
        let version = decoded.server_version.unwrap();
        assert_eq!((version.major, version.build, version.sub_build), (16, 4000, 2));
    }

    #[test]
    fn test_prelogin_roundtrip_options() {
        let original = PreLogin::new(TdsVersion::V7_4)
            .with_encryption(EncryptionLevel::NotSupported)
            .with_instance("SQLEXPRESS")
            .with_thread_id(42)
            .with_fed_auth_required(true);
        let decoded = PreLogin::decode(&original.encode()).unwrap();
        assert_eq!(decoded.encryption, EncryptionLevel::NotSupported);
        assert_eq!(decoded.instance.as_deref(), Some("SQLEXPRESS"));
        assert_eq!(decoded.thread_id, Some(42));
        assert!(decoded.fed_auth_required);
    }

    #[test]
    fn test_prelogin_truncated() {
        assert!(PreLogin::decode(&[0x00, 0x00]).is_err());
        // Offset beyond the payload.
        assert!(PreLogin::decode(&[0x01, 0x00, 0x40, 0x00, 0x01, 0xFF]).is_err());
    }
}
