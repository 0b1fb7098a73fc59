//! Server-side view of a LOGIN7 message.

use bytes::Bytes;

use crate::mock_server::MockServerError;

const HEADER_SIZE: usize = 94;
const FEATURE_TERMINATOR: u8 = 0xFF;
const FEDAUTH_FEATURE: u8 = 0x02;
const SECURITY_TOKEN_LIBRARY: u8 = 0x01;

/// What the client put in its LOGIN7 message.
///
/// Passwords are not recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedLogin {
    /// Requested TDS version.
    pub tds_version: u32,
    /// Requested packet size.
    pub packet_size: u32,
    /// Integrated-security (SSPI) flag.
    pub integrated_security: bool,
    /// Read-only application intent flag.
    pub read_only_intent: bool,
    /// Client host name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// Application name.
    pub app_name: String,
    /// Server name the client dialled.
    pub server_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// SSPI blob (NTLM NEGOTIATE).
    pub sspi: Bytes,
    /// Feature extensions as `(id, data)`.
    pub features: Vec<(u8, Bytes)>,
}

impl RecordedLogin {
    /// Parse a LOGIN7 payload.
    pub fn parse(payload: &[u8]) -> Result<Self, MockServerError> {
        if payload.len() < HEADER_SIZE {
            return Err(protocol(format!("LOGIN7 of {} bytes is shorter than its header", payload.len())));
        }
        let text = |entry: usize| -> Result<String, MockServerError> {
            let (offset, chars) = entry_at(payload, entry);
            let bytes = slice(payload, offset, chars * 2)?;
            utf16(bytes)
        };

        let mut login = Self {
            tds_version: u32_at(payload, 4),
            packet_size: u32_at(payload, 8),
            integrated_security: payload[25] & 0x80 != 0,
            read_only_intent: payload[26] & 0x20 != 0,
            hostname: text(36)?,
            username: text(40)?,
            app_name: text(48)?,
            server_name: text(52)?,
            language: text(64)?,
            database: text(68)?,
            ..Self::default()
        };

        let (sspi_offset, sspi_len) = entry_at(payload, 78);
        login.sspi = Bytes::copy_from_slice(slice(payload, sspi_offset, sspi_len)?);

        if payload[27] & 0x10 != 0 {
            let (slot, _) = entry_at(payload, 56);
            let block = u32_at(slice(payload, slot, 4)?, 0) as usize;
            login.features = parse_features(payload, block)?;
        }
        Ok(login)
    }

    /// Data of a feature extension.
    #[must_use]
    pub fn feature(&self, id: u8) -> Option<&Bytes> {
        self.features.iter().find(|(fid, _)| *fid == id).map(|(_, data)| data)
    }

    /// The access token carried in the FEDAUTH feature, if any.
    #[must_use]
    pub fn fed_auth_token(&self) -> Option<String> {
        let data = self.feature(FEDAUTH_FEATURE)?;
        if data.len() < 5 || data[0] >> 1 != SECURITY_TOKEN_LIBRARY {
            return None;
        }
        let len = u32_at(data, 1) as usize;
        data.get(5..5 + len).and_then(|bytes| utf16(bytes).ok())
    }

    /// Whether the FEDAUTH feature asks for the workflow library.
    #[must_use]
    pub fn requests_fed_auth_workflow(&self) -> bool {
        self.feature(FEDAUTH_FEATURE)
            .is_some_and(|data| !data.is_empty() && data[0] >> 1 != SECURITY_TOKEN_LIBRARY)
    }
}

fn parse_features(payload: &[u8], mut at: usize) -> Result<Vec<(u8, Bytes)>, MockServerError> {
    let mut features = Vec::new();
    loop {
        let id = *payload
            .get(at)
            .ok_or_else(|| protocol("feature block runs past the message"))?;
        if id == FEATURE_TERMINATOR {
            return Ok(features);
        }
        let len = u32_at(slice(payload, at + 1, 4)?, 0) as usize;
        let data = slice(payload, at + 5, len)?;
        features.push((id, Bytes::copy_from_slice(data)));
        at += 5 + len;
    }
}

fn entry_at(payload: &[u8], at: usize) -> (usize, usize) {
    (
        usize::from(u16::from_le_bytes([payload[at], payload[at + 1]])),
        usize::from(u16::from_le_bytes([payload[at + 2], payload[at + 3]])),
    )
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn slice(payload: &[u8], offset: usize, len: usize) -> Result<&[u8], MockServerError> {
    payload
        .get(offset..offset + len)
        .ok_or_else(|| protocol(format!("field at {offset}+{len} outside LOGIN7")))
}

fn utf16(bytes: &[u8]) -> Result<String, MockServerError> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| protocol("invalid UTF-16 in LOGIN7"))
}

fn protocol(message: impl Into<String>) -> MockServerError {
    MockServerError::Protocol(message.into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tdswire_protocol::{FeatureExtension, FedAuthWorkflow, Login7, TdsVersion};

    #[test]
    fn test_parse_sql_login() {
        let payload = Login7::new()
            .with_hostname("WORKSTATION")
            .with_sql_auth("sa", "secret")
            .with_app_name("tests")
            .with_server_name("db.example")
            .with_database("orders")
            .with_language("us_english")
            .with_packet_size(8192)
            .with_read_only_intent(true)
            .encode()
            .unwrap();
        let login = RecordedLogin::parse(&payload).unwrap();
        assert_eq!(login.tds_version, TdsVersion::V7_4.raw());
        assert_eq!(login.packet_size, 8192);
        assert_eq!(login.hostname, "WORKSTATION");
        assert_eq!(login.username, "sa");
        assert_eq!(login.app_name, "tests");
        assert_eq!(login.server_name, "db.example");
        assert_eq!(login.database, "orders");
        assert_eq!(login.language, "us_english");
        assert!(login.read_only_intent);
        assert!(!login.integrated_security);
        assert!(login.features.is_empty());
    }

    #[test]
    fn test_parse_integrated_and_features() {
        let payload = Login7::new()
            .with_integrated_auth(vec![0x4E, 0x54, 0x4C, 0x4D])
            .with_feature(FeatureExtension::fed_auth_token("token-123", false))
            .encode()
            .unwrap();
        let login = RecordedLogin::parse(&payload).unwrap();
        assert!(login.integrated_security);
        assert_eq!(&login.sspi[..], b"NTLM");
        assert_eq!(login.fed_auth_token().as_deref(), Some("token-123"));
        assert!(!login.requests_fed_auth_workflow());
    }

    #[test]
    fn test_workflow_feature() {
        let payload = Login7::new()
            .with_feature(FeatureExtension::fed_auth_workflow(FedAuthWorkflow::Integrated, true))
            .encode()
            .unwrap();
        let login = RecordedLogin::parse(&payload).unwrap();
        assert!(login.requests_fed_auth_workflow());
        assert!(login.fed_auth_token().is_none());
    }

    #[test]
    fn test_truncated_login_rejected() {
        assert!(RecordedLogin::parse(&[0u8; 40]).is_err());
    }
}
