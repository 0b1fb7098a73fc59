//! Mock TDS server for client tests.
//!
//! Binds to an ephemeral loopback port and speaks enough of the protocol
//! to drive a client through PRELOGIN, an optional TLS handshake, LOGIN7
//! and any number of requests. Each connection follows the script given to
//! [`MockServerBuilder`], and everything the client sends is recorded in a
//! [`MockLog`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use tdswire_testing::{MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("SELECT 1", MockResponse::scalar_int(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Connect your client to addr...
//! }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tdswire_codec::{CodecError, Transport};
use tdswire_protocol::sql_batch::ALL_HEADERS_LEN;
use tdswire_protocol::token::FeatureAck;
use tdswire_protocol::{
    DEFAULT_PACKET_SIZE, DoneStatus, EncryptionLevel, EnvChange, EnvChangeType, FeatureExtAck,
    FedAuthInfo, LoginAck, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PacketStatus, PacketType, PreLogin,
    ProtocolError, ServerVersion, TdsVersion, TokenType,
};
use tdswire_tls::PreloginStream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;

use crate::login::RecordedLogin;
use crate::script::{LoginBehavior, MockResponse, done, server_message};

/// Product version the server reports, 16.0.1000.
const SERVER_VERSION: u32 = 0x1000_03E8;
const FEDAUTH_FEATURE: u8 = 0x02;
const SP_EXECUTESQL: u16 = 10;

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent something the server did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Encoding or decoding a protocol structure failed.
    #[error("TDS error: {0}")]
    Tds(#[from] ProtocolError),

    /// Packet transport failed.
    #[error("transport error: {0}")]
    Codec(#[from] CodecError),

    /// The certificate or TLS configuration could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// Server already stopped.
    #[error("Server already stopped")]
    Stopped,
}

// =============================================================================
// Recording
// =============================================================================

/// A SQL batch as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedBatch {
    /// Statement text.
    pub sql: String,
    /// Reset-connection bit of the first packet.
    pub reset: bool,
    /// Transaction descriptor from the ALL_HEADERS block.
    pub transaction_descriptor: u64,
}

/// An RPC call as the server received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRpc {
    /// Procedure name, `sp_executesql` for the well-known id 10.
    pub procedure: String,
    /// Reset-connection bit of the first packet.
    pub reset: bool,
    /// Whole message payload.
    pub payload: Bytes,
}

/// Everything the clients sent, across all connections.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    /// Accepted TCP connections.
    pub connections: usize,
    /// PRELOGIN requests.
    pub prelogins: Vec<PreLogin>,
    /// LOGIN7 requests.
    pub logins: Vec<RecordedLogin>,
    /// SQL batches, including session-setup batches.
    pub batches: Vec<RecordedBatch>,
    /// RPC calls.
    pub rpcs: Vec<RecordedRpc>,
    /// ATTENTION signals.
    pub attentions: usize,
    /// Messages the client cancelled with the IGNORE bit.
    pub ignored_messages: usize,
    /// SSPI messages (NTLM AUTHENTICATE blobs).
    pub sspi: Vec<Bytes>,
    /// Tokens received in FEDAUTH_TOKEN messages.
    pub fed_auth_tokens: Vec<String>,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`MockTdsServer`].
#[derive(Debug)]
pub struct MockServerBuilder {
    encryption: EncryptionLevel,
    logins: Vec<LoginBehavior>,
    default_login: LoginBehavior,
    responses: HashMap<String, MockResponse>,
    default_response: MockResponse,
    server_name: String,
    database: String,
    packet_size: Option<u32>,
}

impl Default for MockServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerBuilder {
    /// Create a builder for a server that does not support encryption and
    /// accepts every login.
    #[must_use]
    pub fn new() -> Self {
        Self {
            encryption: EncryptionLevel::NotSupported,
            logins: Vec::new(),
            default_login: LoginBehavior::Accept,
            responses: HashMap::new(),
            default_response: MockResponse::empty(),
            server_name: "MockServer".to_string(),
            database: "master".to_string(),
            packet_size: None,
        }
    }

    /// Encryption level answered in PRELOGIN.
    ///
    /// Anything other than `NotSupported` generates a self-signed
    /// certificate for `localhost`.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Login behavior for every connection.
    #[must_use]
    pub fn with_login(mut self, behavior: LoginBehavior) -> Self {
        self.default_login = behavior;
        self
    }

    /// Login behaviors for the first connections, in order. Later
    /// connections use the behavior set with [`Self::with_login`].
    #[must_use]
    pub fn with_login_sequence(mut self, behaviors: impl IntoIterator<Item = LoginBehavior>) -> Self {
        self.logins = behaviors.into_iter().collect();
        self
    }

    /// Response for a SQL batch or RPC procedure name.
    ///
    /// SQL is matched trimmed and case-insensitively.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.responses.insert(normalize(&sql.into()), response);
        self
    }

    /// Response for anything without a specific response.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.default_response = response;
        self
    }

    /// Program name reported in LOGINACK.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Database announced after login.
    #[must_use]
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    /// Packet size announced after login instead of echoing the client's.
    #[must_use]
    pub fn with_packet_size(mut self, size: u32) -> Self {
        self.packet_size = Some(size);
        self
    }

    /// Bind and start accepting connections.
    pub async fn build(self) -> Result<MockTdsServer, MockServerError> {
        MockTdsServer::start(self).await
    }
}

// =============================================================================
// Server
// =============================================================================

struct Shared {
    script: MockServerBuilder,
    next_login: AtomicUsize,
    tls: Option<(TlsAcceptor, CertificateDer<'static>)>,
    log: Mutex<MockLog>,
}

impl Shared {
    fn next_login(&self) -> LoginBehavior {
        let index = self.next_login.fetch_add(1, Ordering::SeqCst);
        self.script
            .logins
            .get(index)
            .unwrap_or(&self.script.default_login)
            .clone()
    }

    fn response_for(&self, key: &str) -> MockResponse {
        self.script
            .responses
            .get(&normalize(key))
            .unwrap_or(&self.script.default_response)
            .clone()
    }

    fn record(&self, f: impl FnOnce(&mut MockLog)) {
        f(&mut self.log.lock());
    }
}

/// A mock TDS server on a loopback port.
pub struct MockTdsServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
}

impl std::fmt::Debug for MockTdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTdsServer")
            .field("addr", &self.addr)
            .field("encryption", &self.shared.script.encryption)
            .finish_non_exhaustive()
    }
}

impl MockTdsServer {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    async fn start(script: MockServerBuilder) -> Result<Self, MockServerError> {
        let tls = if script.encryption == EncryptionLevel::NotSupported {
            None
        } else {
            Some(tls_acceptor()?)
        };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            script,
            next_login: AtomicUsize::new(0),
            tls,
            log: Mutex::new(MockLog::default()),
        });

        let accept_shared = Arc::clone(&shared);
        let mut stop = shutdown.subscribe();
        let conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { break };
                        tracing::debug!(%peer, "mock server accepted connection");
                        accept_shared.record(|log| log.connections += 1);
                        let shared = Arc::clone(&accept_shared);
                        let mut stop = conn_shutdown.subscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                result = handle_connection(stream, shared) => {
                                    if let Err(e) = result {
                                        tracing::debug!(error = %e, "mock connection ended with error");
                                    }
                                }
                                _ = stop.recv() => {}
                            }
                        });
                    }
                    _ = stop.recv() => break,
                }
            }
        });

        tracing::debug!(%addr, "mock TDS server listening");
        Ok(Self {
            addr,
            shared,
            shutdown,
        })
    }

    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Host to connect to.
    #[must_use]
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Port to connect to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The server certificate, when encryption is enabled.
    #[must_use]
    pub fn certificate(&self) -> Option<CertificateDer<'static>> {
        self.shared.tls.as_ref().map(|(_, cert)| cert.clone())
    }

    /// Snapshot of what clients have sent so far.
    #[must_use]
    pub fn log(&self) -> MockLog {
        self.shared.log.lock().clone()
    }

    /// Stop accepting and drop every open connection.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// TLS
// =============================================================================

fn tls_acceptor() -> Result<(TlsAcceptor, CertificateDer<'static>), MockServerError> {
    let tls_error = |e: &dyn std::fmt::Display| MockServerError::Tls(e.to_string());
    let key = rcgen::KeyPair::generate().map_err(|e| tls_error(&e))?;
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .and_then(|params| params.self_signed(&key))
        .map_err(|e| tls_error(&e))?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

    // TLS 1.2 only: a 1.3 server writes session tickets after the
    // handshake, when the client has already stopped PRELOGIN framing.
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS12])
    .map_err(|e| tls_error(&e))?
    .with_no_client_auth()
    .with_single_cert(vec![cert_der.clone()], key_der)
    .map_err(|e| tls_error(&e))?;

    Ok((TlsAcceptor::from(Arc::new(config)), cert_der))
}

// =============================================================================
// Connection handling
// =============================================================================

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type ServerTransport = Transport<Box<dyn AsyncStream>>;

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<(), MockServerError> {
    stream.set_nodelay(true)?;
    let mut transport = Transport::new(stream, MAX_PACKET_SIZE);

    // PRELOGIN
    let Some(message) = transport.read_message().await? else {
        return Ok(());
    };
    expect_type(message.packet_type, PacketType::PreLogin)?;
    let request = PreLogin::decode(&message.payload)?;
    shared.record(|log| log.prelogins.push(request.clone()));

    let level = shared.script.encryption;
    let mut reply = PreLogin::new(TdsVersion::new(SERVER_VERSION)).with_encryption(level);
    reply.fed_auth_required = request.fed_auth_required;
    transport.send_message(PacketType::TabularResult, &reply.encode()).await?;

    let tcp = transport.into_inner()?;
    let io: Box<dyn AsyncStream> = match &shared.tls {
        Some((acceptor, _)) if request.encryption.wants_encryption() => {
            let mut tls = acceptor
                .accept(PreloginStream::new(tcp, DEFAULT_PACKET_SIZE))
                .await?;
            tls.get_mut().0.handshake_complete();
            tracing::debug!("mock server TLS handshake completed");
            Box::new(tls)
        }
        _ => Box::new(tcp),
    };
    let mut transport: ServerTransport = Transport::new(io, MAX_PACKET_SIZE);

    // LOGIN7
    let Some(message) = transport.read_message().await? else {
        return Ok(());
    };
    expect_type(message.packet_type, PacketType::Login7)?;
    let login = RecordedLogin::parse(&message.payload)?;
    shared.record(|log| log.logins.push(login.clone()));

    if run_login(&mut transport, &shared, &login).await? {
        serve_requests(&mut transport, &shared).await
    } else {
        transport.close().await?;
        Ok(())
    }
}

/// Answer the login. Returns whether the session continues.
async fn run_login(
    transport: &mut ServerTransport,
    shared: &Shared,
    login: &RecordedLogin,
) -> Result<bool, MockServerError> {
    let behavior = shared.next_login();
    tracing::debug!(?behavior, "mock server answering login");
    let has_fed_auth = login.feature(FEDAUTH_FEATURE).is_some();
    let mut buf = BytesMut::new();

    match behavior {
        LoginBehavior::Accept => {
            login_accepted(shared, login, has_fed_auth, &mut buf)?;
        }
        LoginBehavior::NoFeatureAck => {
            login_accepted(shared, login, false, &mut buf)?;
        }
        LoginBehavior::Reject { number, message } => {
            server_message(number, 14, &message).encode(TokenType::Error, &mut buf)?;
            done(TokenType::Done, DoneStatus::ERROR, 0, &mut buf);
            transport.send_message(PacketType::TabularResult, &buf).await?;
            return Ok(false);
        }
        LoginBehavior::Route { host, port } => {
            login_ack(shared, &mut buf)?;
            EnvChange::encode_routing(&host, port, &mut buf)?;
            done(TokenType::Done, DoneStatus::empty(), 0, &mut buf);
            transport.send_message(PacketType::TabularResult, &buf).await?;
            return Ok(false);
        }
        LoginBehavior::Ntlm => {
            if !login.integrated_security {
                return Err(MockServerError::Protocol("expected an integrated login".into()));
            }
            let challenge = ntlm_challenge();
            buf.put_u8(TokenType::Sspi as u8);
            buf.put_u16_le(challenge.len() as u16);
            buf.put_slice(&challenge);
            transport.send_message(PacketType::TabularResult, &buf).await?;
            buf.clear();

            let Some(reply) = transport.read_message().await? else {
                return Ok(false);
            };
            expect_type(reply.packet_type, PacketType::Sspi)?;
            shared.record(|log| log.sspi.push(reply.payload.clone()));
            login_accepted(shared, login, false, &mut buf)?;
        }
        LoginBehavior::FedAuth { sts_url, spn } => {
            FedAuthInfo { sts_url, spn }.encode(&mut buf);
            transport.send_message(PacketType::TabularResult, &buf).await?;
            buf.clear();

            let Some(reply) = transport.read_message().await? else {
                return Ok(false);
            };
            expect_type(reply.packet_type, PacketType::FedAuthToken)?;
            let token = decode_fedauth_token(&reply.payload)?;
            shared.record(|log| log.fed_auth_tokens.push(token));
            login_accepted(shared, login, true, &mut buf)?;
        }
        LoginBehavior::Hang => {
            while transport.read_packet().await?.is_some() {}
            return Ok(false);
        }
    }

    transport.send_message(PacketType::TabularResult, &buf).await?;
    transport.set_packet_size(negotiated_packet_size(shared, login))?;
    Ok(true)
}

fn login_accepted(
    shared: &Shared,
    login: &RecordedLogin,
    fed_auth_ack: bool,
    buf: &mut BytesMut,
) -> Result<(), MockServerError> {
    EnvChange::encode_string(EnvChangeType::Database, &shared.script.database, "master", buf)?;
    login_ack(shared, buf)?;
    let size = negotiated_packet_size(shared, login);
    EnvChange::encode_string(
        EnvChangeType::PacketSize,
        &size.to_string(),
        &login.packet_size.to_string(),
        buf,
    )?;
    if fed_auth_ack {
        FeatureExtAck {
            features: vec![FeatureAck {
                feature_id: FEDAUTH_FEATURE,
                data: Bytes::new(),
            }],
        }
        .encode(buf);
    }
    done(TokenType::Done, DoneStatus::empty(), 0, buf);
    Ok(())
}

fn login_ack(shared: &Shared, buf: &mut BytesMut) -> Result<(), MockServerError> {
    LoginAck {
        interface: 1,
        tds_version: TdsVersion::V7_4,
        prog_name: shared.script.server_name.clone(),
        prog_version: ServerVersion::from_raw(SERVER_VERSION, 0),
    }
    .encode(buf)?;
    Ok(())
}

fn negotiated_packet_size(shared: &Shared, login: &RecordedLogin) -> usize {
    let size = shared.script.packet_size.unwrap_or(login.packet_size) as usize;
    size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE)
}

/// CHALLENGE with an empty target info list.
fn ntlm_challenge() -> Vec<u8> {
    const HEADER: u32 = 56;
    let target_info = [0u8; 4];
    let mut msg = Vec::with_capacity(HEADER as usize + target_info.len());
    msg.extend_from_slice(b"NTLMSSP\0");
    msg.extend_from_slice(&2u32.to_le_bytes());
    // Target name: empty.
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&HEADER.to_le_bytes());
    msg.extend_from_slice(&0x0088_0201u32.to_le_bytes());
    msg.extend_from_slice(&[0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
    msg.extend_from_slice(&[0u8; 8]);
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
    msg.extend_from_slice(&HEADER.to_le_bytes());
    msg.extend_from_slice(&[10, 0, 0x61, 0x4A, 0, 0, 0, 15]);
    msg.extend_from_slice(&target_info);
    msg
}

fn decode_fedauth_token(payload: &[u8]) -> Result<String, MockServerError> {
    let len = payload
        .get(4..8)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .ok_or_else(|| MockServerError::Protocol("short FEDAUTH_TOKEN message".into()))?;
    let bytes = payload
        .get(8..8 + len)
        .ok_or_else(|| MockServerError::Protocol("FEDAUTH_TOKEN shorter than its length".into()))?;
    utf16(bytes)
}

// =============================================================================
// Requests
// =============================================================================

enum Inbound {
    Request {
        packet_type: PacketType,
        reset: bool,
        payload: Bytes,
    },
    Attention,
    Closed,
}

/// Message being assembled across reads.
#[derive(Default)]
struct Incoming {
    packet_type: Option<PacketType>,
    reset: bool,
    payload: BytesMut,
}

/// Read the next request or ATTENTION. Cancel-safe: partial messages stay
/// in `incoming`.
async fn read_inbound(
    transport: &mut ServerTransport,
    incoming: &mut Incoming,
    shared: &Shared,
) -> Result<Inbound, MockServerError> {
    loop {
        let Some(packet) = transport.read_packet().await? else {
            return Ok(Inbound::Closed);
        };
        let header = packet.header;
        if header.packet_type == PacketType::Attention {
            shared.record(|log| log.attentions += 1);
            return Ok(Inbound::Attention);
        }
        if incoming.packet_type.is_none() {
            incoming.packet_type = Some(header.packet_type);
            incoming.reset = header.status.contains(PacketStatus::RESET_CONNECTION);
        }
        incoming.payload.extend_from_slice(&packet.payload);
        if !header.is_end_of_message() {
            continue;
        }
        let message = std::mem::take(incoming);
        if header.is_ignore() {
            tracing::debug!("mock server discarding ignored message");
            shared.record(|log| log.ignored_messages += 1);
            continue;
        }
        return Ok(Inbound::Request {
            packet_type: message.packet_type.unwrap_or(header.packet_type),
            reset: message.reset,
            payload: message.payload.freeze(),
        });
    }
}

async fn serve_requests(transport: &mut ServerTransport, shared: &Shared) -> Result<(), MockServerError> {
    let mut incoming = Incoming::default();
    loop {
        let response = match read_inbound(transport, &mut incoming, shared).await? {
            Inbound::Closed => return Ok(()),
            Inbound::Attention => {
                acknowledge_attention(transport).await?;
                continue;
            }
            Inbound::Request {
                packet_type: PacketType::SqlBatch,
                reset,
                payload,
            } => {
                let (sql, transaction_descriptor) = decode_batch(&payload)?;
                let response = shared.response_for(&sql);
                shared.record(|log| {
                    log.batches.push(RecordedBatch {
                        sql,
                        reset,
                        transaction_descriptor,
                    });
                });
                response
            }
            Inbound::Request {
                packet_type: PacketType::Rpc,
                reset,
                payload,
            } => {
                let procedure = decode_rpc_name(&payload)?;
                let response = shared.response_for(&procedure);
                shared.record(|log| {
                    log.rpcs.push(RecordedRpc {
                        procedure,
                        reset,
                        payload,
                    });
                });
                response
            }
            Inbound::Request { packet_type, .. } => {
                return Err(MockServerError::Protocol(format!(
                    "unexpected {packet_type:?} message after login"
                )));
            }
        };
        if !respond(transport, &mut incoming, shared, response).await? {
            return Ok(());
        }
    }
}

/// Send a response, honoring delays and attention. Returns `false` once
/// the client has gone.
async fn respond(
    transport: &mut ServerTransport,
    incoming: &mut Incoming,
    shared: &Shared,
    mut response: MockResponse,
) -> Result<bool, MockServerError> {
    let response = loop {
        match response {
            MockResponse::Delay(delay, inner) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => response = *inner,
                    inbound = read_inbound(transport, incoming, shared) => {
                        return interrupted(transport, inbound?).await;
                    }
                }
            }
            other => break other,
        }
    };

    match response {
        MockResponse::Hang => {
            let inbound = read_inbound(transport, incoming, shared).await?;
            interrupted(transport, inbound).await
        }
        MockResponse::IgnoreAttention => loop {
            if let Inbound::Closed = read_inbound(transport, incoming, shared).await? {
                return Ok(false);
            }
        },
        MockResponse::SlowAttentionAck(pause) => {
            let inbound = read_inbound(transport, incoming, shared).await?;
            if let Inbound::Attention = inbound {
                tokio::time::sleep(pause).await;
            }
            interrupted(transport, inbound).await
        }
        MockResponse::Disconnect => Ok(false),
        response => {
            let mut buf = BytesMut::new();
            response.encode(&mut buf)?;
            transport.send_message(PacketType::TabularResult, &buf).await?;
            Ok(true)
        }
    }
}

async fn interrupted(transport: &mut ServerTransport, inbound: Inbound) -> Result<bool, MockServerError> {
    match inbound {
        Inbound::Attention => {
            acknowledge_attention(transport).await?;
            Ok(true)
        }
        Inbound::Closed => Ok(false),
        Inbound::Request { packet_type, .. } => Err(MockServerError::Protocol(format!(
            "{packet_type:?} message while a response was pending"
        ))),
    }
}

async fn acknowledge_attention(transport: &mut ServerTransport) -> Result<(), MockServerError> {
    let mut buf = BytesMut::new();
    done(TokenType::Done, DoneStatus::ATTN, 0, &mut buf);
    transport.send_message(PacketType::TabularResult, &buf).await?;
    Ok(())
}

/// Statement text and transaction descriptor of a SQL batch.
fn decode_batch(payload: &[u8]) -> Result<(String, u64), MockServerError> {
    let (descriptor, body) = split_all_headers(payload)?;
    Ok((utf16(body)?, descriptor))
}

fn decode_rpc_name(payload: &[u8]) -> Result<String, MockServerError> {
    let (_, body) = split_all_headers(payload)?;
    let short = || MockServerError::Protocol("RPC message too short".into());
    let len = body.get(0..2).map(|b| u16::from_le_bytes([b[0], b[1]])).ok_or_else(short)?;
    if len == 0xFFFF {
        let id = body.get(2..4).map(|b| u16::from_le_bytes([b[0], b[1]])).ok_or_else(short)?;
        return Ok(match id {
            SP_EXECUTESQL => "sp_executesql".to_string(),
            other => format!("proc#{other}"),
        });
    }
    let name = body.get(2..2 + usize::from(len) * 2).ok_or_else(short)?;
    utf16(name)
}

fn split_all_headers(payload: &[u8]) -> Result<(u64, &[u8]), MockServerError> {
    if payload.len() < ALL_HEADERS_LEN {
        return Err(MockServerError::Protocol("message shorter than ALL_HEADERS".into()));
    }
    let total = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let mut descriptor = [0u8; 8];
    descriptor.copy_from_slice(&payload[10..18]);
    let body = payload
        .get(total..)
        .ok_or_else(|| MockServerError::Protocol(format!("ALL_HEADERS length {total} too large")))?;
    Ok((u64::from_le_bytes(descriptor), body))
}

fn expect_type(actual: PacketType, expected: PacketType) -> Result<(), MockServerError> {
    if actual == expected {
        Ok(())
    } else {
        Err(MockServerError::Protocol(format!("expected {expected:?}, got {actual:?}")))
    }
}

fn utf16(bytes: &[u8]) -> Result<String, MockServerError> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| MockServerError::Protocol("invalid UTF-16".into()))
}

fn normalize(sql: &str) -> String {
    sql.trim().to_uppercase()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tdswire_protocol::{Login7, Token, TokenStreamParser, encode_sql_batch};

    async fn raw_client(server: &MockTdsServer) -> Transport<TcpStream> {
        let stream = TcpStream::connect(server.addr()).await.unwrap();
        Transport::new(stream, DEFAULT_PACKET_SIZE)
    }

    async fn read_tokens(transport: &mut Transport<TcpStream>) -> Vec<Token> {
        let message = transport.read_message().await.unwrap().unwrap();
        assert_eq!(message.packet_type, PacketType::TabularResult);
        let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
        parser.push(&message.payload);
        let mut tokens = Vec::new();
        while let Some(token) = parser.next_token().unwrap() {
            tokens.push(token);
        }
        tokens
    }

    async fn login(transport: &mut Transport<TcpStream>) -> Vec<Token> {
        let prelogin = PreLogin::new(TdsVersion::V7_4).with_encryption(EncryptionLevel::NotSupported);
        transport.send_message(PacketType::PreLogin, &prelogin.encode()).await.unwrap();
        let reply = transport.read_message().await.unwrap().unwrap();
        let reply = PreLogin::decode(&reply.payload).unwrap();
        assert_eq!(reply.encryption, EncryptionLevel::NotSupported);

        let login = Login7::new().with_sql_auth("sa", "pw").with_database("orders").encode().unwrap();
        transport.send_message(PacketType::Login7, &login).await.unwrap();
        read_tokens(transport).await
    }

    #[tokio::test]
    async fn test_server_starts() {
        let server = MockTdsServer::builder().build().await.unwrap();
        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert!(server.certificate().is_none());
    }

    #[tokio::test]
    async fn test_encrypting_server_has_certificate() {
        let server = MockTdsServer::builder()
            .with_encryption(EncryptionLevel::On)
            .build()
            .await
            .unwrap();
        assert!(server.certificate().is_some());
    }

    #[tokio::test]
    async fn test_login_and_batch_recorded() {
        let server = MockTdsServer::builder()
            .with_database("orders")
            .with_response("select 1", MockResponse::scalar_int(1))
            .build()
            .await
            .unwrap();
        let mut client = raw_client(&server).await;

        let tokens = login(&mut client).await;
        assert!(tokens.iter().any(|t| matches!(t, Token::LoginAck(_))));

        client
            .send_message(PacketType::SqlBatch, &encode_sql_batch("SELECT 1", 0))
            .await
            .unwrap();
        let tokens = read_tokens(&mut client).await;
        assert!(matches!(tokens[0], Token::ColMetadata(_)));

        let log = server.log();
        assert_eq!(log.connections, 1);
        assert_eq!(log.logins[0].username, "sa");
        assert_eq!(log.logins[0].database, "orders");
        assert_eq!(log.batches[0].sql, "SELECT 1");
        assert!(!log.batches[0].reset);
    }

    #[tokio::test]
    async fn test_reject_sends_error() {
        let server = MockTdsServer::builder()
            .with_login(LoginBehavior::reject("Login failed for user 'sa'."))
            .build()
            .await
            .unwrap();
        let mut client = raw_client(&server).await;
        let tokens = login(&mut client).await;
        assert!(matches!(&tokens[0], Token::Error(e) if e.number == 18456));
    }

    #[tokio::test]
    async fn test_login_sequence_then_default() {
        let server = MockTdsServer::builder()
            .with_login_sequence([LoginBehavior::transient(40613)])
            .build()
            .await
            .unwrap();

        let mut first = raw_client(&server).await;
        let tokens = login(&mut first).await;
        assert!(matches!(&tokens[0], Token::Error(e) if e.number == 40613));

        let mut second = raw_client(&server).await;
        let tokens = login(&mut second).await;
        assert!(tokens.iter().any(|t| matches!(t, Token::LoginAck(_))));
    }

    #[tokio::test]
    async fn test_attention_during_hang_is_acknowledged() {
        let server = MockTdsServer::builder()
            .with_default_response(MockResponse::Hang)
            .build()
            .await
            .unwrap();
        let mut client = raw_client(&server).await;
        login(&mut client).await;

        client
            .send_message(PacketType::SqlBatch, &encode_sql_batch("WAITFOR DELAY '01:00'", 0))
            .await
            .unwrap();
        client.send_attention().await.unwrap();
        let tokens = read_tokens(&mut client).await;
        assert!(matches!(&tokens[0], Token::Done(d) if d.is_attention_ack()));
        assert_eq!(server.log().attentions, 1);
    }

    #[tokio::test]
    async fn test_disconnect_closes_connection() {
        let server = MockTdsServer::builder()
            .with_default_response(MockResponse::Disconnect)
            .build()
            .await
            .unwrap();
        let mut client = raw_client(&server).await;
        login(&mut client).await;

        client
            .send_message(PacketType::SqlBatch, &encode_sql_batch("SELECT 1", 0))
            .await
            .unwrap();
        assert!(client.read_message().await.unwrap().is_none());
    }

    #[test]
    fn test_decode_batch_reads_descriptor() {
        let payload = encode_sql_batch("SELECT 2", 0x0102_0304);
        let (sql, descriptor) = decode_batch(&payload).unwrap();
        assert_eq!(sql, "SELECT 2");
        assert_eq!(descriptor, 0x0102_0304);
    }

    #[test]
    fn test_ntlm_challenge_parses() {
        let challenge = tdswire_auth::NtlmChallenge::parse(&ntlm_challenge()).unwrap();
        assert_eq!(challenge.server_challenge, [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
        assert_eq!(challenge.target_info, vec![0u8; 4]);
    }
}
