//! Connection state machine.
//!
//! A [`Connection`] is always in exactly one [`State`]. Every change goes
//! through [`Connection::enter`], which checks the transition table, logs
//! it and runs the entry work of the new state (dropping the socket on
//! the way to `ReRouting`, `TransientFailureRetry` and `Final`, clearing
//! the cancel slot on the way back to `LoggedIn`).
//!
//! ```text
//! Connecting → SentPrelogin → [SentTlsNegotiation] → SentLogin7With*
//!     → LoggedInSendingInitialSql → LoggedIn ⇄ BuildingClientRequest
//!     → SentClientRequest → [SentAttention] → LoggedIn
//! ```
//!
//! Timers belong to the state that starts them: the connect timeout wraps
//! one attempt, the request timeout lives inside the `SentClientRequest`
//! read loop and the cancel timeout inside the `SentAttention` loop. None
//! of them outlives its state.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tdswire_auth::{Authentication, FedAuthContext, NtlmClient};
use tdswire_codec::{CodecError, Message, SourceError, Transport};
use tdswire_protocol::{
    Collation, EncryptionLevel, EnvChange, EnvChangeType, EnvChangeValue, FeatureExtension, FeatureId,
    FedAuthWorkflow, Login7, Packet, PacketType, PreLogin, RpcParam, ServerVersion, TdsVersion, Token,
    TokenStreamParser, encode_fedauth_token, encode_sql_batch,
};
use tdswire_tls::TlsConnector;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancelHandle;
use crate::config::{Config, DEFAULT_PORT};
use crate::error::{
    ConnectionError, ConnectionErrorCode, Error, RequestError, RequestErrorCode, Result, ServerError,
};
use crate::request::{Payload, Request};
use crate::resolve::{self, ConnectError};
use crate::response::{Response, ResponseBuilder};
use crate::state::State;

/// Byte stream under the packet transport: plain TCP or TLS over TCP.
trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type ClientTransport = Transport<Box<dyn AsyncStream>>;

/// Session values negotiated at login and updated by ENVCHANGE.
#[derive(Debug, Clone)]
struct Session {
    database: Option<String>,
    language: Option<String>,
    collation: Collation,
    transaction_descriptor: u64,
    tds_version: TdsVersion,
    server_name: Option<String>,
    server_version: Option<ServerVersion>,
    packet_size: usize,
    encrypted: bool,
}

impl Session {
    fn new(config: &Config) -> Self {
        Self {
            database: config.database.clone(),
            language: None,
            collation: Collation::default(),
            transaction_descriptor: 0,
            tds_version: config.tds_version,
            server_name: None,
            server_version: None,
            packet_size: config.packet_size,
            encrypted: false,
        }
    }
}

/// How one connection attempt ended.
enum Outcome {
    LoggedIn,
    Routed { host: String, port: u16 },
}

/// Why a request is being interrupted with ATTENTION.
enum Interrupt {
    Cancel,
    Timeout(Duration),
    SourceFailed(SourceError),
}

/// What woke the read loop.
enum Event {
    Packet(Packet),
    Cancelled,
    TimedOut,
    Failed(CodecError),
}

/// A client connection.
///
/// One request runs at a time; every request method takes `&mut self`.
/// Use [`Connection::cancel_handle`] to cancel from another task.
pub struct Connection {
    config: Config,
    state: State,
    transport: Option<ClientTransport>,
    parser: TokenStreamParser,
    session: Session,
    cancel: CancelHandle,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("database", &self.session.database)
            .field("encrypted", &self.session.encrypted)
            .finish_non_exhaustive()
    }
}

impl Connection {
    // =========================================================================
    // Establishment
    // =========================================================================

    /// Connect and log in.
    pub async fn connect(config: Config) -> Result<Self> {
        Self::connect_with_cancellation(config, CancellationToken::new()).await
    }

    /// Connect and log in, giving up with `ECLOSE` when `cancel` fires.
    pub async fn connect_with_cancellation(config: Config, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            host = %config.host,
            port = ?config.port,
            auth = config.authentication.method_name(),
            "connecting"
        );
        let mut conn = Self {
            parser: TokenStreamParser::new(config.tds_version),
            session: Session::new(&config),
            state: State::Connecting,
            transport: None,
            cancel: CancelHandle::new(),
            config,
        };
        conn.establish(&cancel).await?;
        Ok(conn)
    }

    async fn establish(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut host = self.config.host.clone();
        let mut port = self.config.port;
        let mut instance = self.config.instance.clone();
        let mut redirects: u8 = 0;
        let mut retries: u32 = 0;

        loop {
            let deadline = Instant::now() + self.config.connect_timeout;
            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let err = ConnectionError::new(
                        ConnectionErrorCode::Closed,
                        self.state,
                        "connection attempt cancelled",
                    );
                    self.finalize();
                    return Err(err.into());
                }
                attempt = tokio::time::timeout_at(
                    deadline,
                    self.attempt(&host, port, instance.as_deref(), cancel),
                ) => attempt,
            };

            let error = match attempt {
                Ok(Ok(Outcome::LoggedIn)) => return Ok(()),
                Ok(Ok(Outcome::Routed { host: to_host, port: to_port })) => {
                    self.enter(State::ReRouting)?;
                    redirects += 1;
                    if redirects > self.config.max_redirects {
                        let err = ConnectionError::new(
                            ConnectionErrorCode::Login,
                            State::ReRouting,
                            format!("too many redirects (limit {})", self.config.max_redirects),
                        );
                        self.finalize();
                        return Err(err.into());
                    }
                    tracing::info!(host = %to_host, port = to_port, redirects, "routing to another server");
                    host = to_host;
                    port = Some(to_port);
                    instance = None;
                    self.enter(State::Connecting)?;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => ConnectionError::new(
                    ConnectionErrorCode::Timeout,
                    self.state,
                    format!(
                        "failed to connect to {host} in {}ms",
                        self.config.connect_timeout.as_millis()
                    ),
                ),
            };

            if error.is_transient() && retries < self.config.max_retries {
                retries += 1;
                self.enter(State::TransientFailureRetry)?;
                tracing::info!(
                    attempt = retries,
                    max = self.config.max_retries,
                    number = ?error.server.as_ref().map(|s| s.number),
                    "transient login failure, retrying"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.finalize();
                        return Err(ConnectionError::new(
                            ConnectionErrorCode::Closed,
                            State::TransientFailureRetry,
                            "connection attempt cancelled",
                        )
                        .into());
                    }
                    () = tokio::time::sleep(self.config.connect_retry_interval) => {}
                }
                self.enter(State::Connecting)?;
                continue;
            }

            self.finalize();
            return Err(error.into());
        }
    }

    /// One pass from socket connect to login, against one server.
    async fn attempt(
        &mut self,
        host: &str,
        port: Option<u16>,
        instance: Option<&str>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Outcome, ConnectionError> {
        let port = match (port, instance) {
            (Some(port), _) => port,
            (None, Some(instance)) => {
                return Err(ConnectionError::new(
                    ConnectionErrorCode::InstanceLookup,
                    self.state,
                    format!("cannot locate instance {instance}: set the port explicitly"),
                ));
            }
            (None, None) => DEFAULT_PORT,
        };

        let state = self.state;
        let tcp = resolve::connect(host, port, self.config.multi_subnet_failover, cancel)
            .await
            .map_err(|e| match e {
                ConnectError::Cancelled => {
                    ConnectionError::new(ConnectionErrorCode::Closed, state, "connection attempt cancelled")
                }
                other => ConnectionError::new(
                    ConnectionErrorCode::Socket,
                    state,
                    format!("failed to connect to {host}:{port}"),
                )
                .with_source(other),
            })?;

        // PRELOGIN runs in direct mode so the socket can be taken back for TLS.
        self.enter(State::SentPrelogin)?;
        let mut direct = Transport::new(tcp, self.config.packet_size);
        let requested = if self.config.encrypt {
            EncryptionLevel::On
        } else {
            EncryptionLevel::NotSupported
        };
        let mut prelogin = PreLogin::new(self.config.tds_version)
            .with_encryption(requested)
            .with_fed_auth_required(self.config.authentication.is_federated());
        if let Some(instance) = instance {
            prelogin = prelogin.with_instance(instance);
        }
        direct
            .send_message(PacketType::PreLogin, &prelogin.encode())
            .await
            .map_err(|e| codec_error(State::SentPrelogin, e))?;

        let reply = read_reply(&mut direct, State::SentPrelogin).await?;
        let server = PreLogin::decode(&reply.payload).map_err(|e| {
            ConnectionError::new(ConnectionErrorCode::Protocol, State::SentPrelogin, "malformed PRELOGIN response")
                .with_source(e)
        })?;
        tracing::debug!(
            encryption = ?server.encryption,
            version = ?server.server_version,
            fed_auth_required = server.fed_auth_required,
            "PRELOGIN response"
        );
        self.session.server_version = server.server_version;
        let encrypt = self.negotiate_encryption(server.encryption)?;

        let tcp = direct.into_inner().map_err(|e| codec_error(State::SentPrelogin, e))?;
        let mut fragment = None;
        let stream: Box<dyn AsyncStream> = if encrypt {
            self.enter(State::SentTlsNegotiation)?;
            let trust = self.config.tls.trust_server_certificate || self.config.trust_server_certificate;
            let tls_config = self.config.tls.clone().trust_server_certificate(trust);
            let tls_error = |e: tdswire_tls::TlsError| {
                ConnectionError::new(ConnectionErrorCode::Encrypt, State::SentTlsNegotiation, "TLS negotiation failed")
                    .with_source(e)
            };
            let connector = TlsConnector::new(tls_config, self.config.packet_size).map_err(tls_error)?;
            let (stream, limit) = connector.handshake(tcp, host).await.map_err(tls_error)?;
            fragment = Some(limit);
            Box::new(stream)
        } else {
            Box::new(tcp)
        };

        let mut transport: ClientTransport = Transport::new(stream, self.config.packet_size);
        if let Some(limit) = fragment {
            transport.on_packet_size_change(Box::new(move |size| limit.set_packet_size(size)));
        }
        transport
            .start_pump(self.config.inbound_depth)
            .map_err(|e| codec_error(self.state, e))?;
        self.transport = Some(transport);
        self.session.encrypted = encrypt;

        self.login(host, server.fed_auth_required).await
    }

    /// Pick the channel security from both PRELOGIN encryption levels.
    fn negotiate_encryption(&self, server: EncryptionLevel) -> std::result::Result<bool, ConnectionError> {
        match (self.config.encrypt, server) {
            (false, level) if level.wants_encryption() => Err(ConnectionError::new(
                ConnectionErrorCode::Encrypt,
                self.state,
                "server requires encryption, but encryption is disabled",
            )),
            (true, EncryptionLevel::NotSupported) => Err(ConnectionError::new(
                ConnectionErrorCode::Encrypt,
                self.state,
                "server does not support encryption",
            )),
            (encrypt, _) => Ok(encrypt),
        }
    }

    // =========================================================================
    // Login
    // =========================================================================

    fn build_login7(&self, host: &str) -> Login7 {
        let config = &self.config;
        let mut login = Login7::new()
            .with_tds_version(config.tds_version)
            .with_packet_size(u32::try_from(config.packet_size).unwrap_or(u32::MAX))
            .with_hostname(&config.workstation_id)
            .with_app_name(&config.application_name)
            .with_server_name(host)
            .with_language(&config.language)
            .with_read_only_intent(config.read_only_intent);
        if let Some(database) = &config.database {
            login = login.with_database(database);
        }
        login
    }

    async fn login(&mut self, host: &str, fed_auth_echo: bool) -> std::result::Result<Outcome, ConnectionError> {
        let mut login = self.build_login7(host);
        let mut ntlm: Option<NtlmClient> = None;
        let next = match &self.config.authentication {
            Authentication::SqlServer { username, password } => {
                login = login.with_sql_auth(username, password);
                State::SentLogin7WithStandardLogin
            }
            Authentication::Ntlm { .. } => {
                let client = self
                    .config
                    .authentication
                    .ntlm_client(&self.config.workstation_id)
                    .ok_or_else(|| {
                        ConnectionError::new(ConnectionErrorCode::Login, self.state, "NTLM credentials unavailable")
                    })?;
                login = login.with_integrated_auth(client.negotiate_message());
                ntlm = Some(client);
                State::SentLogin7WithNtlmLogin
            }
            Authentication::AccessToken { token } => {
                login = login.with_feature(FeatureExtension::fed_auth_token(token, fed_auth_echo));
                State::SentLogin7WithStandardLogin
            }
            Authentication::TokenProvider(_) => {
                login = login.with_feature(FeatureExtension::fed_auth_workflow(
                    FedAuthWorkflow::Integrated,
                    fed_auth_echo,
                ));
                State::SentLogin7WithFedauth
            }
        };
        let payload = login.encode().map_err(|e| {
            ConnectionError::new(ConnectionErrorCode::Protocol, self.state, "could not encode LOGIN7").with_source(e)
        })?;

        self.enter(next)?;
        self.send(PacketType::Login7, &payload).await?;

        let mut acked = false;
        let mut fed_auth_acked = false;
        let mut routing: Option<(String, u16)> = None;
        let mut error: Option<ServerError> = None;

        loop {
            let message = self.read_session_message().await?;
            self.parser.push(&message.payload);
            let mut reply: Option<(PacketType, Bytes)> = None;

            while let Some(token) = self.next_token()? {
                match token {
                    Token::LoginAck(ack) => {
                        tracing::info!(
                            tds_version = %ack.tds_version,
                            server = %ack.prog_name,
                            server_version = %ack.prog_version,
                            "login acknowledged"
                        );
                        self.parser.set_version(ack.tds_version);
                        self.session.tds_version = ack.tds_version;
                        self.session.server_name = Some(ack.prog_name);
                        self.session.server_version = Some(ack.prog_version);
                        acked = true;
                    }
                    Token::EnvChange(env) => match env.routing() {
                        Some((to_host, to_port)) => {
                            tracing::info!(host = to_host, port = to_port, "routing redirect received");
                            routing = Some((to_host.to_string(), to_port));
                        }
                        None => self.apply_env_change(&env)?,
                    },
                    Token::Error(msg) => {
                        tracing::debug!(number = msg.number, class = msg.class, message = %msg.message, "login error");
                        error.get_or_insert_with(|| msg.into());
                    }
                    Token::Info(msg) => {
                        tracing::info!(number = msg.number, message = %msg.message, "server message");
                    }
                    Token::FeatureExtAck(ack) => {
                        fed_auth_acked |= ack.get(FeatureId::FedAuth as u8).is_some();
                    }
                    Token::Sspi(challenge) => {
                        let client = ntlm.as_ref().ok_or_else(|| {
                            ConnectionError::new(
                                ConnectionErrorCode::Protocol,
                                self.state,
                                "SSPI challenge without integrated authentication",
                            )
                        })?;
                        let authenticate = client.authenticate_message(&challenge).map_err(|e| {
                            ConnectionError::new(ConnectionErrorCode::Login, self.state, "NTLM challenge rejected")
                                .with_source(e)
                        })?;
                        tracing::debug!("answering NTLM challenge");
                        reply = Some((PacketType::Sspi, Bytes::from(authenticate)));
                    }
                    Token::FedAuthInfo(info) => {
                        let token = self.fetch_fed_auth_token(info.sts_url, info.spn).await?;
                        reply = Some((PacketType::FedAuthToken, encode_fedauth_token(&token)));
                    }
                    Token::Done(_) | Token::DoneProc(_) | Token::DoneInProc(_) => {}
                    _ => tracing::debug!("unexpected token during login ignored"),
                }
            }
            self.finish_message()?;

            match reply {
                Some((packet_type, payload)) => self.send(packet_type, &payload).await?,
                None => break,
            }
        }

        if error.is_none() {
            if let Some((host, port)) = routing {
                return Ok(Outcome::Routed { host, port });
            }
        }
        if !acked {
            let message = match &error {
                Some(server) => format!("login failed: {}", server.message),
                None => "login failed: no LOGINACK received".to_string(),
            };
            let err = ConnectionError::new(ConnectionErrorCode::Login, self.state, message);
            return Err(match error {
                Some(server) => err.with_server(server),
                None => err,
            });
        }
        if self.state == State::SentLogin7WithFedauth && !fed_auth_acked {
            return Err(ConnectionError::new(
                ConnectionErrorCode::FedAuth,
                self.state,
                "server did not acknowledge federated authentication",
            ));
        }

        self.enter(State::LoggedInSendingInitialSql)?;
        self.send_initial_sql().await?;
        self.enter(State::LoggedIn)?;
        Ok(Outcome::LoggedIn)
    }

    async fn fetch_fed_auth_token(
        &self,
        sts_url: String,
        spn: String,
    ) -> std::result::Result<String, ConnectionError> {
        let provider = match &self.config.authentication {
            Authentication::TokenProvider(provider) => Arc::clone(provider),
            _ => {
                return Err(ConnectionError::new(
                    ConnectionErrorCode::Protocol,
                    self.state,
                    "FEDAUTHINFO without a token provider",
                ));
            }
        };
        tracing::debug!(sts_url = %sts_url, spn = %spn, "requesting federated authentication token");
        provider
            .token(&FedAuthContext { sts_url, spn })
            .await
            .map_err(|e| {
                ConnectionError::new(ConnectionErrorCode::FedAuth, self.state, "token provider failed").with_source(e)
            })
    }

    /// Session options go out as one batch. A failure here does not fail
    /// the login.
    async fn send_initial_sql(&mut self) -> std::result::Result<(), ConnectionError> {
        let language = self.session.language.clone().unwrap_or_else(|| self.config.language.clone());
        let sql = self.config.session.initial_sql(&language);
        self.send(PacketType::SqlBatch, &encode_sql_batch(&sql, 0)).await?;

        let message = self.read_session_message().await?;
        self.parser.push(&message.payload);
        let mut builder = ResponseBuilder::default();
        self.drain_into(&mut builder)?;
        self.finish_message()?;
        if let Err(e) = builder.finish() {
            tracing::warn!(error = %e, "initial session SQL failed");
        }
        Ok(())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Run a SQL batch.
    pub async fn exec_sql_batch(&mut self, sql: &str) -> Result<Response> {
        self.execute(Request::batch(sql)).await
    }

    /// Run parameterized SQL through `sp_executesql`.
    pub async fn execute_sql(&mut self, sql: &str, params: Vec<RpcParam>) -> Result<Response> {
        self.execute(Request::execute_sql(sql, params)).await
    }

    /// Call a stored procedure. Output parameters and the return status are
    /// in the [`Response`].
    pub async fn call_procedure(&mut self, name: &str, params: Vec<RpcParam>) -> Result<Response> {
        self.execute(Request::procedure(name, params)).await
    }

    /// Reset the session to its login state.
    pub async fn reset(&mut self) -> Result<()> {
        self.execute(Request::batch("").reset_connection(true)).await?;
        Ok(())
    }

    /// Run a request to completion.
    ///
    /// A timeout or a cancel sends ATTENTION and waits for the server to
    /// acknowledge it, so no rows of this request reach the next one.
    pub async fn execute(&mut self, mut request: Request) -> Result<Response> {
        if self.state != State::LoggedIn {
            return Err(RequestError::new(
                RequestErrorCode::InvalidState,
                format!("requests can only be made in the LoggedIn state, not the {} state", self.state),
            )
            .into());
        }

        self.enter(State::BuildingClientRequest)?;
        let timeout = request.timeout().unwrap_or(self.config.request_timeout);
        let reset = request.resets_connection();
        let collation = self.session.collation;
        let txn = self.session.transaction_descriptor;
        let payload = match request
            .prepare(collation)
            .and_then(|()| request.into_payload(txn, collation))
        {
            Ok(payload) => payload,
            Err(e) => {
                self.enter(State::LoggedIn)?;
                return Err(e.into());
            }
        };

        let cancel = self.cancel.arm();
        self.enter(State::SentClientRequest)?;
        let mut deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        if let Err(e) = self.send_payload(payload, reset).await {
            return match e {
                CodecError::Source(source) => self.interrupt(Interrupt::SourceFailed(source)).await,
                other => Err(self.request_lost(other)),
            };
        }

        let mut builder = ResponseBuilder::default();
        loop {
            match self.next_event(Some(&cancel), deadline).await {
                Event::Packet(packet) => {
                    deadline = None;
                    match self.feed_response(&packet, &mut builder) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => {
                            self.finalize();
                            return Err(e.into());
                        }
                    }
                }
                Event::Cancelled => return self.interrupt(Interrupt::Cancel).await,
                Event::TimedOut => return self.interrupt(Interrupt::Timeout(timeout)).await,
                Event::Failed(e) => return Err(self.request_lost(e)),
            }
        }

        self.enter(State::LoggedIn)?;
        Ok(builder.finish()?)
    }

    async fn send_payload(&mut self, payload: Payload, reset: bool) -> std::result::Result<(), CodecError> {
        let transport = self.transport.as_mut().ok_or(CodecError::ConnectionClosed)?;
        match payload {
            Payload::Buffered(packet_type, bytes) if reset => {
                transport.send_message_with_reset(packet_type, &bytes).await
            }
            Payload::Buffered(packet_type, bytes) => transport.send_message(packet_type, &bytes).await,
            Payload::Streamed(packet_type, stream) => {
                transport.send_message_stream(packet_type, stream, reset).await
            }
        }
    }

    /// Feed one response packet. Returns `true` at end of message.
    fn feed_response(
        &mut self,
        packet: &Packet,
        builder: &mut ResponseBuilder,
    ) -> std::result::Result<bool, ConnectionError> {
        if packet.header.packet_type != PacketType::TabularResult {
            return Err(ConnectionError::new(
                ConnectionErrorCode::Protocol,
                self.state,
                format!("unexpected {:?} packet in response", packet.header.packet_type),
            ));
        }
        if packet.header.is_ignore() {
            tracing::debug!("server discarded the response in progress");
            self.parser.reset();
            return Ok(false);
        }
        self.parser.push(&packet.payload);
        self.drain_into(builder)?;
        if packet.header.is_end_of_message() {
            self.finish_message()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Send ATTENTION and discard everything up to its acknowledgment.
    async fn interrupt(&mut self, cause: Interrupt) -> Result<Response> {
        let sent = match self.transport.as_mut() {
            Some(transport) => transport.send_attention().await,
            None => Err(CodecError::ConnectionClosed),
        };
        if let Err(e) = sent {
            return Err(self.request_lost(e));
        }
        self.enter(State::SentAttention)?;

        let deadline = Instant::now() + self.config.cancel_timeout;
        let mut acked = false;
        loop {
            match self.next_event(None, Some(deadline)).await {
                Event::Packet(packet) => {
                    match self.drain_attention(&packet) {
                        Ok(found) => acked |= found,
                        Err(e) => {
                            self.finalize();
                            return Err(e.into());
                        }
                    }
                    if acked && packet.header.is_end_of_message() {
                        break;
                    }
                }
                Event::TimedOut => {
                    let err = ConnectionError::new(
                        ConnectionErrorCode::Timeout,
                        State::SentAttention,
                        format!(
                            "failed to cancel request in {}ms",
                            self.config.cancel_timeout.as_millis()
                        ),
                    );
                    self.finalize();
                    return Err(err.into());
                }
                Event::Cancelled => {}
                Event::Failed(e) => return Err(self.request_lost(e)),
            }
        }

        self.parser.reset();
        self.enter(State::LoggedIn)?;
        let err = match cause {
            Interrupt::Cancel => RequestError::new(RequestErrorCode::Cancel, "request cancelled"),
            Interrupt::Timeout(after) => RequestError::new(
                RequestErrorCode::Timeout,
                format!("request timed out after {}ms", after.as_millis()),
            ),
            Interrupt::SourceFailed(source) => {
                RequestError::new(RequestErrorCode::Request, format!("parameter stream failed: {source}"))
                    .with_source(source)
            }
        };
        Err(err.into())
    }

    /// Parse and drop tokens while waiting for the attention ack. Returns
    /// whether the ack was in this packet.
    fn drain_attention(&mut self, packet: &Packet) -> std::result::Result<bool, ConnectionError> {
        if packet.header.is_ignore() {
            self.parser.reset();
            return Ok(false);
        }
        self.parser.push(&packet.payload);
        let mut acked = false;
        while let Some(token) = self.next_token()? {
            match token {
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) if done.is_attention_ack() => {
                    tracing::debug!("attention acknowledged");
                    acked = true;
                }
                Token::EnvChange(env) => self.apply_env_change(&env)?,
                _ => {}
            }
        }
        if packet.header.is_end_of_message() {
            self.parser.reset();
        }
        Ok(acked)
    }

    async fn next_event(&mut self, cancel: Option<&CancellationToken>, deadline: Option<Instant>) -> Event {
        let Some(transport) = self.transport.as_mut() else {
            return Event::Failed(CodecError::ConnectionClosed);
        };
        tokio::select! {
            biased;
            () = cancelled(cancel) => Event::Cancelled,
            () = expired(deadline) => Event::TimedOut,
            read = transport.read_packet() => match read {
                Ok(Some(packet)) => Event::Packet(packet),
                Ok(None) => Event::Failed(CodecError::ConnectionClosed),
                Err(e) => Event::Failed(e),
            },
        }
    }

    /// The socket failed mid-request. The connection is finished.
    fn request_lost(&mut self, e: CodecError) -> Error {
        let state = self.state;
        self.finalize();
        match e {
            CodecError::Io(_) | CodecError::ConnectionClosed => {
                let message = format!("connection lost: {e}");
                RequestError::new(RequestErrorCode::Socket, message).with_source(e).into()
            }
            other => codec_error(state, other).into(),
        }
    }

    // =========================================================================
    // Session tokens
    // =========================================================================

    fn drain_into(&mut self, builder: &mut ResponseBuilder) -> std::result::Result<(), ConnectionError> {
        while let Some(token) = self.next_token()? {
            if let Some(token) = builder.push(token) {
                match token {
                    Token::EnvChange(env) => self.apply_env_change(&env)?,
                    _ => tracing::debug!("unexpected session token ignored"),
                }
            }
        }
        Ok(())
    }

    fn apply_env_change(&mut self, env: &EnvChange) -> std::result::Result<(), ConnectionError> {
        match env.env_type {
            EnvChangeType::PacketSize => {
                if let Some(size) = env.packet_size() {
                    let size = size as usize;
                    if let Some(transport) = self.transport.as_mut() {
                        transport.set_packet_size(size).map_err(|e| {
                            ConnectionError::new(
                                ConnectionErrorCode::Protocol,
                                self.state,
                                format!("server sent invalid packet size {size}"),
                            )
                            .with_source(e)
                        })?;
                    }
                    self.session.packet_size = size;
                }
            }
            EnvChangeType::Database => {
                if let Some(database) = env.database() {
                    tracing::debug!(database, "database changed");
                    self.session.database = Some(database.to_string());
                }
            }
            EnvChangeType::Language => {
                if let EnvChangeValue::String(language) = &env.new_value {
                    tracing::debug!(language = %language, "language changed");
                    self.session.language = Some(language.clone());
                }
            }
            EnvChangeType::SqlCollation => {
                if let Some(collation) = env.collation_value() {
                    self.session.collation = collation;
                }
            }
            EnvChangeType::ResetConnectionAck => tracing::debug!("connection reset acknowledged"),
            EnvChangeType::Routing => tracing::debug!("routing change outside login ignored"),
            _ => {
                if let Some(descriptor) = env.transaction_descriptor() {
                    tracing::debug!(descriptor, "transaction descriptor changed");
                    self.session.transaction_descriptor = descriptor;
                }
            }
        }
        Ok(())
    }

    fn next_token(&mut self) -> std::result::Result<Option<Token>, ConnectionError> {
        let state = self.state;
        self.parser.next_token().map_err(|e| {
            ConnectionError::new(ConnectionErrorCode::Protocol, state, "malformed token stream").with_source(e)
        })
    }

    fn finish_message(&mut self) -> std::result::Result<(), ConnectionError> {
        let state = self.state;
        self.parser.finish().map_err(|e| {
            ConnectionError::new(ConnectionErrorCode::Protocol, state, "token stream ended mid-token").with_source(e)
        })
    }

    async fn send(&mut self, packet_type: PacketType, payload: &[u8]) -> std::result::Result<(), ConnectionError> {
        let state = self.state;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ConnectionError::new(ConnectionErrorCode::Closed, state, "connection is closed"))?;
        transport
            .send_message(packet_type, payload)
            .await
            .map_err(|e| codec_error(state, e))
    }

    async fn read_session_message(&mut self) -> std::result::Result<Message, ConnectionError> {
        let state = self.state;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ConnectionError::new(ConnectionErrorCode::Closed, state, "connection is closed"))?;
        read_reply(transport, state).await
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Move to `next`, rejecting transitions the state graph does not have.
    fn enter(&mut self, next: State) -> std::result::Result<(), ConnectionError> {
        if !self.state.can_transition_to(next) {
            return Err(ConnectionError::new(
                ConnectionErrorCode::InvalidState,
                self.state,
                format!("invalid transition from {} to {next}", self.state),
            ));
        }
        self.transition(next);
        Ok(())
    }

    /// Move to `Final` unless already there.
    fn finalize(&mut self) {
        if self.state != State::Final {
            self.transition(State::Final);
        }
    }

    fn transition(&mut self, next: State) {
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
        match next {
            State::Connecting => {
                self.parser = TokenStreamParser::new(self.config.tds_version);
                self.session = Session::new(&self.config);
            }
            State::ReRouting | State::TransientFailureRetry | State::Final => {
                self.transport = None;
                self.parser.reset();
                self.cancel.disarm();
            }
            State::LoggedIn => self.cancel.disarm(),
            _ => {}
        }
    }

    /// Close the connection. Safe to call in any state.
    pub async fn close(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "error while closing transport");
            }
        }
        self.finalize();
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the connection has reached `Final`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == State::Final
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.session.database.as_deref()
    }

    /// Current session language, once the server has reported it.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.session.language.as_deref()
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.session.packet_size
    }

    /// TDS version from LOGINACK.
    #[must_use]
    pub fn tds_version(&self) -> TdsVersion {
        self.session.tds_version
    }

    /// Default collation of the session.
    #[must_use]
    pub fn collation(&self) -> Collation {
        self.session.collation
    }

    /// Open transaction descriptor, `0` outside a transaction.
    #[must_use]
    pub fn transaction_descriptor(&self) -> u64 {
        self.session.transaction_descriptor
    }

    /// Server program name from LOGINACK.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.session.server_name.as_deref()
    }

    /// Server version.
    #[must_use]
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.session.server_version
    }

    /// Whether the channel is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.session.encrypted
    }

    /// Handle for cancelling the in-flight request from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Configuration the connection was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

fn codec_error(state: State, e: CodecError) -> ConnectionError {
    let code = match e {
        CodecError::Io(_) | CodecError::ConnectionClosed => ConnectionErrorCode::Socket,
        _ => ConnectionErrorCode::Protocol,
    };
    ConnectionError::new(code, state, e.to_string()).with_source(e)
}

/// Read one whole message and require it to be a tabular result.
async fn read_reply<S>(transport: &mut Transport<S>, state: State) -> std::result::Result<Message, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let message = transport
        .read_message()
        .await
        .map_err(|e| codec_error(state, e))?
        .ok_or_else(|| ConnectionError::new(ConnectionErrorCode::Socket, state, "connection closed by server"))?;
    if message.packet_type != PacketType::TabularResult {
        return Err(ConnectionError::new(
            ConnectionErrorCode::Protocol,
            state,
            format!("expected a tabular result, got {:?}", message.packet_type),
        ));
    }
    Ok(message)
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
