//! NTLMv2 message construction.
//!
//! SQL Server integrated login with explicit credentials runs the NTLM
//! three-message exchange inside TDS:
//!
//! 1. LOGIN7 carries the NEGOTIATE message in its SSPI field
//! 2. the server answers with an SSPI token holding the CHALLENGE
//! 3. the client sends the AUTHENTICATE message as an SSPI (0x11) message
//!
//! Only the NTLMv2 response is produced; LM and NTLMv1 are not supported.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use rand::Rng;

use crate::error::AuthError;

type HmacMd5 = Hmac<Md5>;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NEGOTIATE: u32 = 1;
const CHALLENGE: u32 = 2;
const AUTHENTICATE: u32 = 3;

/// Header size of the AUTHENTICATE message without version or MIC.
const AUTHENTICATE_HEADER_LEN: usize = 64;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// AV_PAIR id of the server timestamp in the target info.
const AV_TIMESTAMP: u16 = 7;

/// NTLM negotiate flags used by this client.
pub mod flags {
    /// Strings are UTF-16LE.
    pub const UNICODE: u32 = 0x0000_0001;
    /// OEM strings allowed.
    pub const OEM: u32 = 0x0000_0002;
    /// Ask the server for its target name.
    pub const REQUEST_TARGET: u32 = 0x0000_0004;
    /// NTLM authentication.
    pub const NTLM: u32 = 0x0000_0200;
    /// Domain name present in NEGOTIATE.
    pub const OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
    /// Workstation name present in NEGOTIATE.
    pub const OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
    /// Always sign.
    pub const ALWAYS_SIGN: u32 = 0x0000_8000;
    /// Extended session security.
    pub const EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
    /// Target info present in CHALLENGE.
    pub const TARGET_INFO: u32 = 0x0080_0000;
    /// 128-bit session key.
    pub const KEY_128: u32 = 0x2000_0000;
    /// 56-bit session key.
    pub const KEY_56: u32 = 0x8000_0000;
}

const NEGOTIATE_FLAGS: u32 = flags::UNICODE
    | flags::OEM
    | flags::REQUEST_TARGET
    | flags::NTLM
    | flags::OEM_DOMAIN_SUPPLIED
    | flags::OEM_WORKSTATION_SUPPLIED
    | flags::ALWAYS_SIGN
    | flags::EXTENDED_SESSION_SECURITY
    | flags::KEY_128
    | flags::KEY_56;

/// Parsed CHALLENGE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallenge {
    /// Flags chosen by the server.
    pub flags: u32,
    /// 8-byte server challenge.
    pub server_challenge: [u8; 8],
    /// Raw target info AV_PAIR list.
    pub target_info: Vec<u8>,
}

impl NtlmChallenge {
    /// Parse a CHALLENGE message.
    pub fn parse(data: &[u8]) -> Result<Self, AuthError> {
        if data.len() < 48 {
            return Err(AuthError::InvalidChallenge(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }
        if &data[..8] != SIGNATURE {
            return Err(AuthError::InvalidChallenge("missing NTLMSSP signature".into()));
        }
        let message_type = read_u32(data, 8);
        if message_type != CHALLENGE {
            return Err(AuthError::InvalidChallenge(format!(
                "expected message type 2, got {message_type}"
            )));
        }

        let flags = read_u32(data, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&data[24..32]);

        let info_len = usize::from(read_u16(data, 40));
        let info_offset = read_u32(data, 44) as usize;
        let target_info = data
            .get(info_offset..info_offset + info_len)
            .ok_or_else(|| {
                AuthError::InvalidChallenge(format!(
                    "target info {info_offset}+{info_len} outside {} byte message",
                    data.len()
                ))
            })?
            .to_vec();

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// Server timestamp from the target info, if present.
    #[must_use]
    pub fn timestamp(&self) -> Option<u64> {
        let mut rest = self.target_info.as_slice();
        while rest.len() >= 4 {
            let id = u16::from_le_bytes([rest[0], rest[1]]);
            let len = usize::from(u16::from_le_bytes([rest[2], rest[3]]));
            let value = rest.get(4..4 + len)?;
            if id == 0 {
                return None;
            }
            if id == AV_TIMESTAMP && len == 8 {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(value);
                return Some(u64::from_le_bytes(bytes));
            }
            rest = &rest[4 + len..];
        }
        None
    }
}

/// NTLMv2 client for one login.
#[derive(Clone)]
pub struct NtlmClient {
    username: String,
    password: String,
    domain: String,
    workstation: String,
}

impl NtlmClient {
    /// Create a client for `domain\username`.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            domain: domain.into(),
            workstation: String::new(),
        }
    }

    /// Set the workstation name reported to the server.
    #[must_use]
    pub fn with_workstation(mut self, workstation: impl Into<String>) -> Self {
        self.workstation = workstation.into();
        self
    }

    /// Build the NEGOTIATE message carried in LOGIN7.
    #[must_use]
    pub fn negotiate_message(&self) -> Vec<u8> {
        let domain = self.domain.to_uppercase().into_bytes();
        let workstation = self.workstation.to_uppercase().into_bytes();
        let header_len = 40u32;

        let mut out = Vec::with_capacity(40 + domain.len() + workstation.len());
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&NEGOTIATE.to_le_bytes());
        out.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
        let domain_offset = header_len + workstation.len() as u32;
        write_security_buffer(&mut out, domain.len(), domain_offset);
        write_security_buffer(&mut out, workstation.len(), header_len);
        // Version: 5.0 build 2195, NTLM revision 15.
        out.extend_from_slice(&[5, 0, 0x93, 0x08, 0, 0, 0, 15]);
        out.extend_from_slice(&workstation);
        out.extend_from_slice(&domain);
        out
    }

    /// Answer a CHALLENGE with an AUTHENTICATE message.
    pub fn authenticate_message(&self, challenge: &[u8]) -> Result<Vec<u8>, AuthError> {
        let challenge = NtlmChallenge::parse(challenge)?;
        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill(&mut client_challenge);
        let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);
        tracing::debug!(
            domain = %self.domain,
            username = %self.username,
            server_timestamp = challenge.timestamp().is_some(),
            "building NTLMv2 AUTHENTICATE message"
        );
        self.build_authenticate(&challenge, client_challenge, timestamp)
    }

    fn build_authenticate(
        &self,
        challenge: &NtlmChallenge,
        client_challenge: [u8; 8],
        timestamp: u64,
    ) -> Result<Vec<u8>, AuthError> {
        let response_key = ntowf_v2(&self.password, &self.username, &self.domain)?;
        let lm_response = lmv2_response(&response_key, &challenge.server_challenge, &client_challenge)?;
        let nt_response = ntv2_response(
            &response_key,
            &challenge.server_challenge,
            &client_challenge,
            timestamp,
            &challenge.target_info,
        )?;

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.username);
        let workstation = utf16le(&self.workstation);

        let mut offset = AUTHENTICATE_HEADER_LEN;
        let mut out = Vec::with_capacity(
            offset + lm_response.len() + nt_response.len() + domain.len() + user.len() + workstation.len(),
        );
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&AUTHENTICATE.to_le_bytes());
        for field in [&lm_response, &nt_response, &domain, &user, &workstation] {
            write_security_buffer(&mut out, field.len(), offset as u32);
            offset += field.len();
        }
        // Empty encrypted session key.
        write_security_buffer(&mut out, 0, offset as u32);
        out.extend_from_slice(&challenge.flags.to_le_bytes());

        for field in [lm_response, nt_response, domain, user, workstation] {
            out.extend_from_slice(&field);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for NtlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmClient")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// NTOWFv2: HMAC-MD5 keyed by the NT hash over `UPPER(user) + domain`.
fn ntowf_v2(password: &str, username: &str, domain: &str) -> Result<[u8; 16], AuthError> {
    let nt_hash = Md4::digest(utf16le(password));
    let mut identity = utf16le(&username.to_uppercase());
    identity.extend(utf16le(domain));
    hmac_md5(&nt_hash, &[identity.as_slice()])
}

fn lmv2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>, AuthError> {
    let proof = hmac_md5(key, &[&server_challenge[..], &client_challenge[..]])?;
    let mut out = proof.to_vec();
    out.extend_from_slice(client_challenge);
    Ok(out)
}

fn ntv2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Result<Vec<u8>, AuthError> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(key, &[&server_challenge[..], &blob])?;
    let mut out = proof.to_vec();
    out.extend(blob);
    Ok(out)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], AuthError> {
    let mut mac = HmacMd5::new_from_slice(key)
        .map_err(|e| AuthError::Configuration(format!("HMAC-MD5 key: {e}")))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn write_security_buffer(out: &mut Vec<u8>, len: usize, offset: u32) {
    let len = len as u16;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Current time as a Windows FILETIME (100 ns ticks since 1601).
fn filetime_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_unix.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + u64::from(since_unix.subsec_nanos() / 100)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn challenge_message(target_info: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&CHALLENGE.to_le_bytes());
        write_security_buffer(&mut msg, 0, 56);
        msg.extend_from_slice(&(flags::UNICODE | flags::NTLM | flags::TARGET_INFO).to_le_bytes());
        msg.extend_from_slice(&hex("0123456789abcdef"));
        msg.extend_from_slice(&[0; 8]);
        write_security_buffer(&mut msg, target_info.len(), 56);
        msg.extend_from_slice(&[6, 1, 0xB1, 0x1D, 0, 0, 0, 15]);
        msg.extend_from_slice(target_info);
        msg
    }

    #[test]
    fn test_ntowf_v2_reference_vector() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(key.to_vec(), hex("0c868a403bfd7a93a3001ef22ef02e3f"));
    }

    #[test]
    fn test_lmv2_reference_vector() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        let server: [u8; 8] = hex("0123456789abcdef").try_into().unwrap();
        let response = lmv2_response(&key, &server, &[0xAA; 8]).unwrap();
        assert_eq!(
            response,
            hex("86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa")
        );
    }

    #[test]
    fn test_negotiate_message_layout() {
        let msg = NtlmClient::new("user", "pw", "corp")
            .with_workstation("ws1")
            .negotiate_message();
        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(read_u32(&msg, 8), NEGOTIATE);
        assert_eq!(read_u32(&msg, 12), NEGOTIATE_FLAGS);
        // Domain buffer points past the workstation name.
        assert_eq!(read_u16(&msg, 16), 4);
        assert_eq!(read_u32(&msg, 20), 43);
        assert_eq!(&msg[43..], b"CORP");
        assert_eq!(&msg[40..43], b"WS1");
    }

    #[test]
    fn test_parse_challenge() {
        let info = [2, 0, 4, 0, b'D', 0, b'M', 0, 0, 0, 0, 0];
        let parsed = NtlmChallenge::parse(&challenge_message(&info)).unwrap();
        assert_eq!(parsed.server_challenge.to_vec(), hex("0123456789abcdef"));
        assert_eq!(parsed.target_info, info);
        assert_eq!(parsed.timestamp(), None);
    }

    #[test]
    fn test_challenge_timestamp_found() {
        let mut info = vec![7, 0, 8, 0];
        info.extend_from_slice(&42u64.to_le_bytes());
        info.extend_from_slice(&[0, 0, 0, 0]);
        let parsed = NtlmChallenge::parse(&challenge_message(&info)).unwrap();
        assert_eq!(parsed.timestamp(), Some(42));
    }

    #[test]
    fn test_bad_challenge_rejected() {
        assert!(NtlmChallenge::parse(b"short").is_err());
        let mut msg = challenge_message(&[]);
        msg[8] = 3;
        assert!(NtlmChallenge::parse(&msg).is_err());
        let mut msg = challenge_message(&[]);
        msg[40] = 200;
        assert!(NtlmChallenge::parse(&msg).is_err());
    }

    #[test]
    fn test_authenticate_message_layout() {
        let client = NtlmClient::new("User", "Password", "Domain").with_workstation("COMPUTER");
        let info = [0u8, 0, 0, 0];
        let challenge = NtlmChallenge::parse(&challenge_message(&info)).unwrap();
        let msg = client
            .build_authenticate(&challenge, [0xAA; 8], 0)
            .unwrap();

        assert_eq!(read_u32(&msg, 8), AUTHENTICATE);
        // LMv2 response first, 24 bytes at the end of the header.
        assert_eq!(read_u16(&msg, 12), 24);
        assert_eq!(read_u32(&msg, 16), 64);
        assert_eq!(
            &msg[64..88],
            &hex("86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa")[..]
        );
        // NTLMv2 response: 16-byte proof + 28-byte blob + target info + 4.
        let nt_len = usize::from(read_u16(&msg, 20));
        assert_eq!(nt_len, 16 + 28 + info.len() + 4);
        let user_len = usize::from(read_u16(&msg, 36));
        let user_offset = read_u32(&msg, 40) as usize;
        assert_eq!(&msg[user_offset..user_offset + user_len], &utf16le("User")[..]);
        assert_eq!(read_u32(&msg, 60), challenge.flags);
        assert_eq!(msg.len(), read_u32(&msg, 56) as usize);
    }

    #[test]
    fn test_authenticate_is_randomized() {
        let client = NtlmClient::new("u", "p", "d");
        let challenge = challenge_message(&[0, 0, 0, 0]);
        let a = client.authenticate_message(&challenge).unwrap();
        let b = client.authenticate_message(&challenge).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", NtlmClient::new("u", "hunter2", "d"));
        assert!(!debug.contains("hunter2"));
    }
}
