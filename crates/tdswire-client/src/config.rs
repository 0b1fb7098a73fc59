//! Client configuration.
//!
//! A [`Config`] is built either with the builder methods or from an
//! ADO.NET-style connection string:
//!
//! ```text
//! Server=tcp:db.example.com,1433;Database=app;User Id=sa;Password=secret;Encrypt=true
//! ```

use std::time::Duration;

use tdswire_auth::Authentication;
use tdswire_protocol::{MAX_PACKET_SIZE, MIN_PACKET_SIZE, TdsVersion};
use tdswire_tls::TlsConfig;

use crate::error::Error;

/// Default SQL Server port.
pub const DEFAULT_PORT: u16 = 1433;

/// Default requested packet size.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

// =============================================================================
// Session options
// =============================================================================

/// Transaction isolation level applied at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// READ UNCOMMITTED.
    ReadUncommitted,
    /// READ COMMITTED.
    #[default]
    ReadCommitted,
    /// REPEATABLE READ.
    RepeatableRead,
    /// SERIALIZABLE.
    Serializable,
    /// SNAPSHOT.
    Snapshot,
}

impl IsolationLevel {
    /// SQL keyword form.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::RepeatableRead => "repeatable read",
            Self::Serializable => "serializable",
            Self::Snapshot => "snapshot",
        }
    }
}

/// `SET` options sent in the batch that follows login.
///
/// `None` leaves the server default in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// `SET ANSI_NULLS`.
    pub ansi_nulls: Option<bool>,
    /// `SET ANSI_NULL_DFLT_ON`.
    pub ansi_null_default: Option<bool>,
    /// `SET ANSI_PADDING`.
    pub ansi_padding: Option<bool>,
    /// `SET ANSI_WARNINGS`.
    pub ansi_warnings: Option<bool>,
    /// `SET ARITHABORT`.
    pub arith_abort: Option<bool>,
    /// `SET CONCAT_NULL_YIELDS_NULL`.
    pub concat_null_yields_null: Option<bool>,
    /// `SET CURSOR_CLOSE_ON_COMMIT`.
    pub cursor_close_on_commit: Option<bool>,
    /// `SET DATEFIRST`, 1 (Monday) to 7 (Sunday).
    pub date_first: Option<u8>,
    /// `SET DATEFORMAT`, e.g. `mdy`.
    pub date_format: Option<String>,
    /// `SET IMPLICIT_TRANSACTIONS`.
    pub implicit_transactions: Option<bool>,
    /// `SET NUMERIC_ROUNDABORT`.
    pub numeric_round_abort: Option<bool>,
    /// `SET QUOTED_IDENTIFIER`.
    pub quoted_identifier: Option<bool>,
    /// `SET TEXTSIZE`.
    pub text_size: Option<i32>,
    /// `SET TRANSACTION ISOLATION LEVEL`.
    pub isolation_level: Option<IsolationLevel>,
    /// `SET XACT_ABORT`.
    pub xact_abort: Option<bool>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ansi_nulls: Some(true),
            ansi_null_default: Some(true),
            ansi_padding: Some(true),
            ansi_warnings: Some(true),
            arith_abort: Some(true),
            concat_null_yields_null: Some(true),
            cursor_close_on_commit: None,
            date_first: Some(7),
            date_format: Some("mdy".to_string()),
            implicit_transactions: Some(false),
            numeric_round_abort: Some(false),
            quoted_identifier: Some(true),
            text_size: Some(i32::MAX),
            isolation_level: Some(IsolationLevel::ReadCommitted),
            xact_abort: Some(false),
        }
    }
}

impl SessionOptions {
    /// Build the session-setup batch. `language` is added when non-empty.
    #[must_use]
    pub fn initial_sql(&self, language: &str) -> String {
        fn flag(out: &mut Vec<String>, name: &str, value: Option<bool>) {
            if let Some(on) = value {
                out.push(format!("set {name} {}", if on { "on" } else { "off" }));
            }
        }

        let mut out = Vec::new();
        flag(&mut out, "ansi_nulls", self.ansi_nulls);
        flag(&mut out, "ansi_null_dflt_on", self.ansi_null_default);
        flag(&mut out, "ansi_padding", self.ansi_padding);
        flag(&mut out, "ansi_warnings", self.ansi_warnings);
        flag(&mut out, "arithabort", self.arith_abort);
        flag(&mut out, "concat_null_yields_null", self.concat_null_yields_null);
        flag(&mut out, "cursor_close_on_commit", self.cursor_close_on_commit);
        if let Some(day) = self.date_first {
            out.push(format!("set datefirst {day}"));
        }
        if let Some(format) = &self.date_format {
            out.push(format!("set dateformat {format}"));
        }
        flag(&mut out, "implicit_transactions", self.implicit_transactions);
        if !language.is_empty() {
            out.push(format!("set language {}", quote_identifier(language)));
        }
        flag(&mut out, "numeric_roundabort", self.numeric_round_abort);
        flag(&mut out, "quoted_identifier", self.quoted_identifier);
        if let Some(size) = self.text_size {
            out.push(format!("set textsize {size}"));
        }
        if let Some(level) = self.isolation_level {
            out.push(format!("set transaction isolation level {}", level.as_sql()));
        }
        flag(&mut out, "xact_abort", self.xact_abort);
        out.join("\n")
    }
}

fn quote_identifier(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

// =============================================================================
// Config
// =============================================================================

/// Client configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server hostname or IP address.
    pub host: String,
    /// Server port. `None` uses [`DEFAULT_PORT`] unless `instance` is set.
    pub port: Option<u16>,
    /// Named instance. Needs an explicit port.
    pub instance: Option<String>,
    /// Database to use after login.
    pub database: Option<String>,
    /// Authentication mode.
    pub authentication: Authentication,
    /// Encrypt the session.
    pub encrypt: bool,
    /// Skip server certificate validation.
    pub trust_server_certificate: bool,
    /// TLS settings.
    pub tls: TlsConfig,
    /// Requested packet size, 512 to 32767.
    pub packet_size: usize,
    /// TDS version to request.
    pub tds_version: TdsVersion,
    /// Application name reported to the server.
    pub application_name: String,
    /// Workstation name reported to the server.
    pub workstation_id: String,
    /// Session language. Empty uses the login default.
    pub language: String,
    /// Ask for a read-only replica.
    pub read_only_intent: bool,
    /// Race connects to all resolved addresses.
    pub multi_subnet_failover: bool,
    /// Per-attempt connect and login timeout.
    pub connect_timeout: Duration,
    /// Default request timeout. Zero disables it.
    pub request_timeout: Duration,
    /// How long to wait for an attention acknowledgment.
    pub cancel_timeout: Duration,
    /// Delay before retrying a transient login failure.
    pub connect_retry_interval: Duration,
    /// Retries after a transient login failure.
    pub max_retries: u32,
    /// Routing redirects to follow.
    pub max_redirects: u8,
    /// Inbound packets buffered ahead of the reader.
    pub inbound_depth: usize,
    /// Options applied right after login.
    pub session: SessionOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            instance: None,
            database: None,
            authentication: Authentication::default(),
            encrypt: true,
            trust_server_certificate: false,
            tls: TlsConfig::default(),
            packet_size: DEFAULT_PACKET_SIZE,
            tds_version: TdsVersion::V7_4,
            application_name: "tdswire".to_string(),
            workstation_id: String::new(),
            language: "us_english".to_string(),
            read_only_intent: false,
            multi_subnet_failover: false,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(15),
            cancel_timeout: Duration::from_secs(5),
            connect_retry_interval: Duration::from_millis(500),
            max_retries: 3,
            max_redirects: 2,
            inbound_depth: 64,
            session: SessionOptions::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an ADO.NET-style connection string.
    ///
    /// Keys are case-insensitive. Unknown keys are logged and ignored.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, Error> {
        let mut config = Self::default();
        let mut user = None;
        let mut password = None;
        let mut method = None;
        let mut access_token = None;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("invalid key-value: {part}")))?;
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "server" | "data source" | "host" | "address" | "addr" => {
                    config.set_server(value)?;
                }
                "port" => config.port = Some(parse_port(value)?),
                "database" | "initial catalog" => {
                    config.database = Some(value.to_string());
                }
                "user id" | "uid" | "user" => user = Some(value.to_string()),
                "password" | "pwd" => password = Some(value.to_string()),
                "authentication" => method = Some(value.to_lowercase()),
                "access token" | "accesstoken" => access_token = Some(value.to_string()),
                "application name" | "app" => {
                    config.application_name = value.to_string();
                }
                "workstation id" | "wsid" => config.workstation_id = value.to_string(),
                "current language" | "language" => config.language = value.to_string(),
                "application intent" | "applicationintent" => {
                    config.read_only_intent = value.eq_ignore_ascii_case("readonly");
                }
                "connect timeout" | "connection timeout" | "timeout" => {
                    config.connect_timeout = parse_seconds(&key, value)?;
                }
                "command timeout" => config.request_timeout = parse_seconds(&key, value)?,
                "connect retry count" | "connectretrycount" => {
                    config.max_retries = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid retry count: {value}")))?;
                }
                "connect retry interval" | "connectretryinterval" => {
                    config.connect_retry_interval = parse_seconds(&key, value)?;
                }
                "trustservercertificate" | "trust server certificate" => {
                    config.trust_server_certificate = parse_bool(&key, value)?;
                }
                "encrypt" => config.encrypt = parse_bool(&key, value)?,
                "hostnameincertificate" | "host name in certificate" => {
                    config.tls = config.tls.with_server_name(value);
                }
                "servercertificate" | "server certificate" => {
                    let pem = std::fs::read(value)
                        .map_err(|e| Error::Config(format!("cannot read server certificate {value}: {e}")))?;
                    config.tls = config
                        .tls
                        .add_root_certificates_pem(&pem)
                        .map_err(|e| Error::Config(format!("server certificate {value}: {e}")))?;
                }
                "multisubnetfailover" | "multi subnet failover" => {
                    config.multi_subnet_failover = parse_bool(&key, value)?;
                }
                "packet size" => {
                    config.packet_size = value
                        .parse()
                        .map_err(|_| Error::Config(format!("invalid packet size: {value}")))?;
                }
                "tdsversion" | "tds version" => {
                    config.tds_version = TdsVersion::parse(value).ok_or_else(|| {
                        Error::Config(format!(
                            "invalid TDS version: {value}. Supported values: 7.1, 7.2, 7.3A, 7.3B, 7.4"
                        ))
                    })?;
                }
                _ => {
                    tracing::debug!(
                        key = key.as_str(),
                        value = value,
                        "ignoring unknown connection string option"
                    );
                }
            }
        }

        config.authentication = match (method.as_deref(), access_token) {
            (Some("activedirectoryaccesstoken"), None) => {
                return Err(Error::Config(
                    "Authentication=ActiveDirectoryAccessToken needs an Access Token key".into(),
                ));
            }
            (Some("activedirectoryaccesstoken") | None, Some(token)) => Authentication::access_token(token),
            (None | Some("sqlpassword" | "sql password"), None) => {
                Authentication::sql_server(user.unwrap_or_default(), password.unwrap_or_default())
            }
            (Some("ntlm" | "windows"), None) => {
                Authentication::ntlm(user.unwrap_or_default(), password.unwrap_or_default(), "")
            }
            (Some(other), _) => {
                return Err(Error::Config(format!("unsupported authentication method: {other}")));
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn set_server(&mut self, value: &str) -> Result<(), Error> {
        let value = value.strip_prefix("tcp:").unwrap_or(value);
        let host = match value.rsplit_once(',') {
            Some((host, port)) => {
                self.port = Some(parse_port(port.trim())?);
                host.trim()
            }
            None => value,
        };
        match host.split_once('\\') {
            Some((host, instance)) => {
                self.host = host.to_string();
                self.instance = Some(instance.to_string());
            }
            None => self.host = host.to_string(),
        }
        if self.host == "." || self.host.eq_ignore_ascii_case("(local)") {
            self.host = "localhost".to_string();
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet size {} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.host.is_empty() {
            return Err(Error::Config("server host is empty".into()));
        }
        if let Some(day) = self.session.date_first {
            if !(1..=7).contains(&day) {
                return Err(Error::Config(format!("datefirst {day} outside 1..=7")));
            }
        }
        Ok(())
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the authentication mode.
    #[must_use]
    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    /// Enable or disable encryption.
    #[must_use]
    pub fn encrypt(mut self, enabled: bool) -> Self {
        self.encrypt = enabled;
        self
    }

    /// Trust the server certificate without validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Set the TLS configuration.
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the TDS version to request.
    #[must_use]
    pub fn tds_version(mut self, version: TdsVersion) -> Self {
        self.tds_version = version;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the workstation name.
    #[must_use]
    pub fn workstation_id(mut self, name: impl Into<String>) -> Self {
        self.workstation_id = name.into();
        self
    }

    /// Set the session language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Ask for a read-only replica.
    #[must_use]
    pub fn read_only_intent(mut self, read_only: bool) -> Self {
        self.read_only_intent = read_only;
        self
    }

    /// Race connects to every resolved address.
    #[must_use]
    pub fn multi_subnet_failover(mut self, enabled: bool) -> Self {
        self.multi_subnet_failover = enabled;
        self
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout. Zero disables it.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the attention acknowledgment timeout.
    #[must_use]
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Set the delay between transient login retries.
    #[must_use]
    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Set the number of transient login retries.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the number of routing redirects to follow.
    #[must_use]
    pub fn max_redirects(mut self, max: u8) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the inbound packet buffer depth.
    #[must_use]
    pub fn inbound_depth(mut self, depth: usize) -> Self {
        self.inbound_depth = depth;
        self
    }

    /// Set the session options.
    #[must_use]
    pub fn session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    /// Whether the request timeout is enabled.
    #[must_use]
    pub fn has_request_timeout(&self) -> bool {
        !self.request_timeout.is_zero()
    }
}

fn parse_port(value: &str) -> Result<u16, Error> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid port: {value}")))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, Error> {
    value
        .parse()
        .map(Duration::from_secs)
        .map_err(|_| Error::Config(format!("invalid {key}: {value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0" {
        Ok(false)
    } else {
        Err(Error::Config(format!("invalid {key}: {value}")))
    }
}
