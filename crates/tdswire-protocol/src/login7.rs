//! TDS LOGIN7 packet construction.
//!
//! The LOGIN7 packet is sent by the client to authenticate with SQL Server.
//! It contains client information, credentials, and feature negotiation data.
//!
//! ## Packet Structure
//!
//! - Fixed-length header (94 bytes): sizes, version, flags, and an
//!   offset/length table
//! - Variable-length data section the table points into (strings are
//!   UTF-16LE)
//! - Optional feature extension block, located through a 4-byte offset
//!   stored where the unused field would be
//!
//! ## Security Note
//!
//! The password is obfuscated (not encrypted) using a simple XOR + bit rotation.
//! The login packet is always sent inside TLS unless the server reports no
//! TLS support at all.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_len, write_utf16};
use crate::error::ProtocolError;
use crate::version::TdsVersion;

/// LOGIN7 packet header size (fixed portion).
pub const LOGIN7_HEADER_SIZE: usize = 94;

/// LOGIN7 option flags 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFlags1 {
    /// Warn if the initial database change fails instead of failing login.
    pub use_db_notify: bool,
    /// Initial database change failure is fatal.
    pub database_fatal: bool,
    /// Warn on language change.
    pub set_lang_warn: bool,
}

impl OptionFlags1 {
    /// Convert to byte. Byte order, character set and float format bits
    /// stay zero (little-endian, ASCII, IEEE 754).
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.use_db_notify {
            flags |= 0x20;
        }
        if self.database_fatal {
            flags |= 0x40;
        }
        if self.set_lang_warn {
            flags |= 0x80;
        }
        flags
    }
}

/// LOGIN7 option flags 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFlags2 {
    /// Language change failure is fatal.
    pub language_fatal: bool,
    /// ODBC-style session defaults.
    pub odbc: bool,
    /// SSPI data carries integrated security.
    pub integrated_security: bool,
}

impl OptionFlags2 {
    /// Convert to byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.language_fatal {
            flags |= 0x01;
        }
        if self.odbc {
            flags |= 0x02;
        }
        if self.integrated_security {
            flags |= 0x80;
        }
        flags
    }
}

/// LOGIN7 type flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeFlags {
    /// Read-only application intent.
    pub read_only_intent: bool,
}

impl TypeFlags {
    /// Convert to byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        if self.read_only_intent { 0x20 } else { 0x00 }
    }
}

/// LOGIN7 option flags 3.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionFlags3 {
    /// Request a password change.
    pub change_password: bool,
    /// Accept collations the client does not know.
    pub unknown_collation_handling: bool,
    /// Feature extension block present.
    pub extension: bool,
}

impl OptionFlags3 {
    /// Convert to byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.change_password {
            flags |= 0x01;
        }
        if self.unknown_collation_handling {
            flags |= 0x08;
        }
        if self.extension {
            flags |= 0x10;
        }
        flags
    }
}

/// Feature extension identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// UTF-8 support.
    Utf8Support = 0x0A,
    /// Terminator.
    Terminator = 0xFF,
}

/// Federated authentication library announced in the FEDAUTH feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthLibrary {
    /// Token supplied up front in LOGIN7.
    SecurityToken = 0x01,
    /// Token obtained after FEDAUTHINFO and sent in a FEDAUTH_TOKEN message.
    Workflow = 0x02,
}

/// Workflow byte sent with [`FedAuthLibrary::Workflow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthWorkflow {
    /// User name and password.
    Password = 0x01,
    /// Integrated (ambient) credentials.
    Integrated = 0x02,
}

/// Feature extension data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtension {
    /// Feature ID.
    pub feature_id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

impl FeatureExtension {
    /// FEDAUTH feature carrying a pre-acquired access token.
    #[must_use]
    pub fn fed_auth_token(token: &str, echo: bool) -> Self {
        let token_len = utf16_len(token) * 2;
        let mut data = BytesMut::with_capacity(5 + token_len);
        data.put_u8(((FedAuthLibrary::SecurityToken as u8) << 1) | u8::from(echo));
        data.put_u32_le(token_len as u32);
        write_utf16(&mut data, token);
        Self {
            feature_id: FeatureId::FedAuth,
            data: data.freeze(),
        }
    }

    /// FEDAUTH feature announcing a token workflow.
    #[must_use]
    pub fn fed_auth_workflow(workflow: FedAuthWorkflow, echo: bool) -> Self {
        Self {
            feature_id: FeatureId::FedAuth,
            data: Bytes::copy_from_slice(&[
                ((FedAuthLibrary::Workflow as u8) << 1) | u8::from(echo),
                workflow as u8,
            ]),
        }
    }
}

/// LOGIN7 packet builder.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process ID.
    pub client_pid: u32,
    /// Connection ID.
    pub connection_id: u32,
    /// Option flags 1.
    pub option_flags1: OptionFlags1,
    /// Option flags 2.
    pub option_flags2: OptionFlags2,
    /// Type flags.
    pub type_flags: TypeFlags,
    /// Option flags 3.
    pub option_flags3: OptionFlags3,
    /// Client timezone offset in minutes.
    pub client_timezone: i32,
    /// Client LCID (locale ID).
    pub client_lcid: u32,
    /// Hostname (client machine name).
    pub hostname: String,
    /// Username for SQL authentication.
    pub username: String,
    /// Password for SQL authentication.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Language.
    pub language: String,
    /// Database name.
    pub database: String,
    /// Client ID (MAC address, typically zeros).
    pub client_id: [u8; 6],
    /// SSPI data for integrated authentication.
    pub sspi_data: Vec<u8>,
    /// Attach DB filename.
    pub attach_db_file: String,
    /// New password (for password change).
    pub new_password: String,
    /// Feature extensions.
    pub features: Vec<FeatureExtension>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: TdsVersion::V7_4,
            packet_size: 4096,
            client_prog_version: 0,
            client_pid: std::process::id(),
            connection_id: 0,
            option_flags1: OptionFlags1 {
                use_db_notify: true,
                database_fatal: true,
                set_lang_warn: false,
            },
            option_flags2: OptionFlags2 {
                language_fatal: true,
                odbc: true,
                integrated_security: false,
            },
            type_flags: TypeFlags::default(),
            option_flags3: OptionFlags3 {
                unknown_collation_handling: true,
                ..Default::default()
            },
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::from("tdswire"),
            server_name: String::new(),
            library_name: String::from("tdswire"),
            language: String::new(),
            database: String::new(),
            client_id: [0u8; 6],
            sspi_data: Vec::new(),
            attach_db_file: String::new(),
            new_password: String::new(),
            features: Vec::new(),
        }
    }
}

/// Offset table and data section being built side by side.
struct VarData {
    table: BytesMut,
    data: BytesMut,
}

impl VarData {
    fn offset(&self) -> Result<u16, ProtocolError> {
        let offset = LOGIN7_HEADER_SIZE + self.data.len();
        u16::try_from(offset).map_err(|_| ProtocolError::TooLong {
            field: "LOGIN7",
            length: offset,
            max: u16::MAX as usize,
        })
    }

    fn entry(&mut self, offset: u16, len: usize, field: &'static str) -> Result<(), ProtocolError> {
        let len = u16::try_from(len).map_err(|_| ProtocolError::TooLong {
            field,
            length: len,
            max: u16::MAX as usize,
        })?;
        self.table.put_u16_le(offset);
        self.table.put_u16_le(len);
        Ok(())
    }

    fn text(&mut self, s: &str, field: &'static str) -> Result<(), ProtocolError> {
        let offset = self.offset()?;
        self.entry(offset, utf16_len(s), field)?;
        write_utf16(&mut self.data, s);
        Ok(())
    }

    fn password(&mut self, s: &str, field: &'static str) -> Result<(), ProtocolError> {
        let offset = self.offset()?;
        self.entry(offset, utf16_len(s), field)?;
        write_obfuscated_password(&mut self.data, s);
        Ok(())
    }

    fn bytes(&mut self, b: &[u8], field: &'static str) -> Result<(), ProtocolError> {
        let offset = self.offset()?;
        self.entry(offset, b.len(), field)?;
        self.data.put_slice(b);
        Ok(())
    }
}

impl Login7 {
    /// Create a new Login7 packet builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TDS version.
    #[must_use]
    pub fn with_tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set SQL authentication credentials.
    #[must_use]
    pub fn with_sql_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.option_flags2.integrated_security = false;
        self
    }

    /// Enable integrated authentication with an initial SSPI blob.
    #[must_use]
    pub fn with_integrated_auth(mut self, sspi_data: Vec<u8>) -> Self {
        self.sspi_data = sspi_data;
        self.option_flags2.integrated_security = true;
        self
    }

    /// Set the database to connect to.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the hostname (client machine name).
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Set the server name.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the session language.
    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Set the packet size.
    #[must_use]
    pub fn with_packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    /// Enable read-only intent for readable secondary connections.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.read_only_intent = read_only;
        self
    }

    /// Add a feature extension.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureExtension) -> Self {
        self.option_flags3.extension = true;
        self.features.push(feature);
        self
    }

    /// Encode the LOGIN7 packet to bytes.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut var = VarData {
            table: BytesMut::with_capacity(LOGIN7_HEADER_SIZE - 36),
            data: BytesMut::with_capacity(256),
        };

        var.text(&self.hostname, "hostname")?;
        var.text(&self.username, "username")?;
        var.password(&self.password, "password")?;
        var.text(&self.app_name, "app name")?;
        var.text(&self.server_name, "server name")?;

        // The extension slot holds a 4-byte pointer to the feature block,
        // patched once the block's position is known.
        let extension_slot = if self.option_flags3.extension {
            let offset = var.offset()?;
            var.entry(offset, 4, "extension")?;
            let slot = var.data.len();
            var.data.put_u32_le(0);
            Some(slot)
        } else {
            let offset = var.offset()?;
            var.entry(offset, 0, "extension")?;
            None
        };

        var.text(&self.library_name, "library name")?;
        var.text(&self.language, "language")?;
        var.text(&self.database, "database")?;
        var.table.put_slice(&self.client_id);
        var.bytes(&self.sspi_data, "SSPI")?;
        var.text(&self.attach_db_file, "attach db file")?;
        var.password(&self.new_password, "new password")?;
        // cbSSPILong: only used when SSPI exceeds 65535 bytes.
        var.table.put_u32_le(0);

        if let Some(slot) = extension_slot {
            let block = (LOGIN7_HEADER_SIZE + var.data.len()) as u32;
            var.data[slot..slot + 4].copy_from_slice(&block.to_le_bytes());
            for feature in &self.features {
                var.data.put_u8(feature.feature_id as u8);
                var.data.put_u32_le(feature.data.len() as u32);
                var.data.put_slice(&feature.data);
            }
            var.data.put_u8(FeatureId::Terminator as u8);
        }

        let total_length = LOGIN7_HEADER_SIZE + var.data.len();
        let mut buf = BytesMut::with_capacity(total_length);
        buf.put_u32_le(total_length as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(self.connection_id);
        buf.put_u8(self.option_flags1.to_byte());
        buf.put_u8(self.option_flags2.to_byte());
        buf.put_u8(self.type_flags.to_byte());
        buf.put_u8(self.option_flags3.to_byte());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);
        buf.put_slice(&var.table);
        debug_assert_eq!(buf.len(), LOGIN7_HEADER_SIZE);
        buf.put_slice(&var.data);

        Ok(buf.freeze())
    }
}

/// Write password with TDS obfuscation: swap the nibbles of every byte,
/// then XOR with 0xA5.
fn write_obfuscated_password(dst: &mut impl BufMut, password: &str) {
    for c in password.encode_utf16() {
        for b in c.to_le_bytes() {
            dst.put_u8(b.rotate_right(4) ^ 0xA5);
        }
    }
}
