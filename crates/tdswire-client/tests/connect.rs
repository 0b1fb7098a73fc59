//! Connection establishment against the mock server: encryption
//! negotiation, login flows, routing and retry.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use tdswire_client::{Authentication, Config, Connection, Error, State, StaticTokenProvider, TlsConfig};
use tdswire_protocol::EncryptionLevel;
use tdswire_testing::{LoginBehavior, MockTdsServer};
use tokio_util::sync::CancellationToken;

fn config_for(server: &MockTdsServer) -> Config {
    Config::new()
        .host(server.host())
        .port(server.port())
        .encrypt(false)
        .authentication(Authentication::sql_server("sa", "Password123"))
        .max_retries(0)
        .connect_timeout(Duration::from_secs(5))
}

fn connection_error(err: &Error) -> &tdswire_client::ConnectionError {
    match err {
        Error::Connection(e) => e,
        other => panic!("expected a connection error, got {other:?}"),
    }
}

// =============================================================================
// Login
// =============================================================================

#[tokio::test]
async fn test_sql_login_sends_session_setup() {
    let server = MockTdsServer::builder()
        .with_database("orders")
        .with_server_name("MockServer")
        .build()
        .await
        .unwrap();

    let conn = Connection::connect(config_for(&server).database("orders").application_name("billing"))
        .await
        .unwrap();
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(conn.database(), Some("orders"));
    assert_eq!(conn.server_name(), Some("MockServer"));
    assert_eq!(conn.server_version().map(|v| v.major), Some(16));
    assert!(!conn.is_encrypted());

    let log = server.log();
    assert_eq!(log.prelogins.len(), 1);
    assert_eq!(log.prelogins[0].encryption, EncryptionLevel::NotSupported);
    let login = &log.logins[0];
    assert_eq!(login.username, "sa");
    assert_eq!(login.app_name, "billing");
    assert_eq!(login.database, "orders");
    assert_eq!(login.server_name, server.host());
    assert!(!login.integrated_security);

    let setup = &log.batches[0].sql;
    assert!(setup.contains("set ansi_nulls on"));
    assert!(setup.contains("set language [us_english]"));
    assert!(setup.contains("set transaction isolation level read committed"));
}

#[tokio::test]
async fn test_rejected_login_is_not_retried() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::reject("Login failed for user 'sa'."))
        .build()
        .await
        .unwrap();

    let err = Connection::connect(config_for(&server).max_retries(3)).await.unwrap_err();
    assert_eq!(err.code(), "ELOGIN");
    assert_eq!(err.server_error().map(|s| s.number), Some(18456));
    assert!(!err.is_transient());
    assert_eq!(server.log().connections, 1);
}

#[tokio::test]
async fn test_read_only_intent_flag() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let _conn = Connection::connect(config_for(&server).read_only_intent(true))
        .await
        .unwrap();
    assert!(server.log().logins[0].read_only_intent);
}

#[tokio::test]
async fn test_ntlm_login_answers_challenge() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::Ntlm)
        .build()
        .await
        .unwrap();

    let config = config_for(&server)
        .workstation_id("WS01")
        .authentication(Authentication::ntlm("alice", "s3cret", "CORP"));
    let conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);

    let log = server.log();
    assert!(log.logins[0].integrated_security);
    assert_eq!(&log.logins[0].sspi[..8], b"NTLMSSP\0");
    assert_eq!(log.sspi.len(), 1);
    let authenticate = &log.sspi[0];
    assert_eq!(&authenticate[..8], b"NTLMSSP\0");
    assert_eq!(u32::from_le_bytes([authenticate[8], authenticate[9], authenticate[10], authenticate[11]]), 3);
}

// =============================================================================
// Federated authentication
// =============================================================================

#[tokio::test]
async fn test_access_token_sent_in_login() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let config = config_for(&server).authentication(Authentication::access_token("eyJ0eXAi.token"));
    let conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);

    let log = server.log();
    assert!(log.prelogins[0].fed_auth_required);
    assert_eq!(log.logins[0].fed_auth_token().as_deref(), Some("eyJ0eXAi.token"));
    assert!(log.fed_auth_tokens.is_empty());
}

#[tokio::test]
async fn test_token_provider_workflow() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::FedAuth {
            sts_url: "https://login.example.com/tenant".into(),
            spn: "https://database.example.com/".into(),
        })
        .build()
        .await
        .unwrap();
    let provider = Arc::new(StaticTokenProvider::new("provided-token"));
    let config = config_for(&server).authentication(Authentication::token_provider(provider));

    let conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);

    let log = server.log();
    assert!(log.logins[0].requests_fed_auth_workflow());
    assert_eq!(log.fed_auth_tokens, vec!["provided-token".to_string()]);
}

#[tokio::test]
async fn test_missing_fed_auth_ack_fails() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::NoFeatureAck)
        .build()
        .await
        .unwrap();
    let provider = Arc::new(StaticTokenProvider::new("provided-token"));
    let config = config_for(&server).authentication(Authentication::token_provider(provider));

    let err = Connection::connect(config).await.unwrap_err();
    assert_eq!(err.code(), "EFEDAUTH");
    assert_eq!(connection_error(&err).state, State::SentLogin7WithFedauth);
}

// =============================================================================
// Encryption
// =============================================================================

#[tokio::test]
async fn test_server_requires_encryption_client_disabled() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::Required)
        .build()
        .await
        .unwrap();

    let err = Connection::connect(config_for(&server)).await.unwrap_err();
    assert_eq!(err.code(), "EENCRYPT");
    assert!(
        err.to_string()
            .contains("server requires encryption, but encryption is disabled")
    );
    let log = server.log();
    assert_eq!(log.prelogins.len(), 1);
    assert!(log.logins.is_empty());
}

#[tokio::test]
async fn test_client_requires_encryption_server_cannot() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let err = Connection::connect(config_for(&server).encrypt(true)).await.unwrap_err();
    assert_eq!(err.code(), "EENCRYPT");
    assert!(server.log().logins.is_empty());
}

#[tokio::test]
async fn test_tls_login_with_trusted_certificate() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::On)
        .with_response("SELECT 1", tdswire_testing::MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();

    let config = config_for(&server).encrypt(true).trust_server_certificate(true);
    let mut conn = Connection::connect(config).await.unwrap();
    assert!(conn.is_encrypted());
    assert_eq!(server.log().logins[0].username, "sa");

    let response = conn.exec_sql_batch("SELECT 1").await.unwrap();
    assert_eq!(response.first().unwrap().len(), 1);
}

#[tokio::test]
async fn test_tls_login_with_pinned_root() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::On)
        .build()
        .await
        .unwrap();
    let tls = TlsConfig::new()
        .add_root_certificate(server.certificate().unwrap())
        .with_server_name("localhost");

    let conn = Connection::connect(config_for(&server).encrypt(true).tls(tls))
        .await
        .unwrap();
    assert!(conn.is_encrypted());
}

#[tokio::test]
async fn test_tls_untrusted_certificate_rejected() {
    let server = MockTdsServer::builder()
        .with_encryption(EncryptionLevel::On)
        .build()
        .await
        .unwrap();

    let err = Connection::connect(config_for(&server).encrypt(true)).await.unwrap_err();
    assert_eq!(err.code(), "EENCRYPT");
    assert_eq!(connection_error(&err).state, State::SentTlsNegotiation);
    assert!(server.log().logins.is_empty());
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_routing_follows_redirect() {
    let target = MockTdsServer::builder()
        .with_database("routed")
        .build()
        .await
        .unwrap();
    let gateway = MockTdsServer::builder()
        .with_login(LoginBehavior::Route {
            host: target.host(),
            port: target.port(),
        })
        .build()
        .await
        .unwrap();

    let conn = Connection::connect(config_for(&gateway)).await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(conn.database(), Some("routed"));
    assert_eq!(gateway.log().logins.len(), 1);
    assert_eq!(target.log().logins.len(), 1);
    assert_eq!(target.log().logins[0].server_name, target.host());
}

#[tokio::test]
async fn test_too_many_redirects() {
    let target = MockTdsServer::builder().build().await.unwrap();
    let second = MockTdsServer::builder()
        .with_login(LoginBehavior::Route {
            host: target.host(),
            port: target.port(),
        })
        .build()
        .await
        .unwrap();
    let first = MockTdsServer::builder()
        .with_login(LoginBehavior::Route {
            host: second.host(),
            port: second.port(),
        })
        .build()
        .await
        .unwrap();

    let err = Connection::connect(config_for(&first).max_redirects(1)).await.unwrap_err();
    assert_eq!(err.code(), "ELOGIN");
    assert!(err.to_string().contains("too many redirects"));
    assert!(target.log().logins.is_empty());
}

// =============================================================================
// Retry and timeouts
// =============================================================================

#[tokio::test]
async fn test_transient_failure_retried_then_succeeds() {
    let server = MockTdsServer::builder()
        .with_login_sequence([LoginBehavior::transient(40613)])
        .build()
        .await
        .unwrap();
    let config = config_for(&server)
        .max_retries(2)
        .connect_retry_interval(Duration::from_millis(10));

    let conn = Connection::connect(config).await.unwrap();
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(server.log().connections, 2);
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_last_error() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::transient(40613))
        .build()
        .await
        .unwrap();
    let config = config_for(&server)
        .max_retries(2)
        .connect_retry_interval(Duration::from_millis(10));

    let err = Connection::connect(config).await.unwrap_err();
    assert_eq!(err.code(), "ELOGIN");
    assert!(err.is_transient());
    assert_eq!(err.server_error().map(|s| s.number), Some(40613));
    assert_eq!(server.log().connections, 3);
}

#[tokio::test]
async fn test_connect_timeout() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::Hang)
        .build()
        .await
        .unwrap();

    let err = Connection::connect(config_for(&server).connect_timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ETIMEOUT");
    assert!(err.to_string().contains("in 200ms"));
}

#[tokio::test]
async fn test_connect_cancelled() {
    let server = MockTdsServer::builder()
        .with_login(LoginBehavior::Hang)
        .build()
        .await
        .unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = Connection::connect_with_cancellation(config_for(&server), token)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ECLOSE");
}

#[tokio::test]
async fn test_refused_connection_is_socket_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = Config::new()
        .host("127.0.0.1")
        .port(port)
        .encrypt(false)
        .max_retries(0);
    let err = Connection::connect(config).await.unwrap_err();
    assert_eq!(err.code(), "ESOCKET");
}

#[tokio::test]
async fn test_named_instance_without_port() {
    let config = Config::new().host("127.0.0.1").instance("SQLEXPRESS").encrypt(false);
    let err = Connection::connect(config).await.unwrap_err();
    assert_eq!(err.code(), "EINSTLOOKUP");
}

#[tokio::test]
async fn test_invalid_packet_size_rejected_before_connecting() {
    let err = Connection::connect(Config::new().packet_size(100)).await.unwrap_err();
    assert_eq!(err.code(), "ECONFIG");
}
