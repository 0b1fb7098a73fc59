//! Requests against the mock server: results, procedures, timeouts,
//! cancellation and streamed parameters.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tdswire_client::{
    Authentication, Config, Connection, Error, Request, RpcParam, SqlType, State, TypeLength,
};
use tdswire_codec::SourceError;
use tdswire_protocol::{Done, DoneStatus, EnvChange, EnvChangeType, TokenType};
use tdswire_testing::{MockResponse, MockTdsServer};
use tdswire_types::SqlValue;

const HANGING_QUERY: &str = "WAITFOR DELAY '01:00:00'";

async fn connect(server: &MockTdsServer, configure: impl FnOnce(Config) -> Config) -> Connection {
    let config = Config::new()
        .host(server.host())
        .port(server.port())
        .encrypt(false)
        .authentication(Authentication::sql_server("sa", "Password123"))
        .max_retries(0);
    Connection::connect(configure(config)).await.unwrap()
}

fn request_code(err: &Error) -> &'static str {
    match err {
        Error::Request(e) => e.code.as_str(),
        other => panic!("expected a request error, got {other:?}"),
    }
}

// =============================================================================
// Results
// =============================================================================

#[tokio::test]
async fn test_batch_returns_rows() {
    let server = MockTdsServer::builder()
        .with_response("SELECT name FROM users", MockResponse::scalar_string("alice"))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let response = conn.exec_sql_batch("SELECT name FROM users").await.unwrap();
    let set = response.first().unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(set.rows[0].get(0), Some(&SqlValue::String("alice".into())));
    assert_eq!(conn.state(), State::LoggedIn);
}

#[tokio::test]
async fn test_rows_affected() {
    let server = MockTdsServer::builder()
        .with_response("DELETE FROM logs", MockResponse::affected(12))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let response = conn.exec_sql_batch("DELETE FROM logs").await.unwrap();
    assert_eq!(response.rows_affected(), 12);
}

#[tokio::test]
async fn test_server_error_keeps_connection() {
    let server = MockTdsServer::builder()
        .with_response("SELECT * FROM missing", MockResponse::error(208, "Invalid object name 'missing'."))
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let err = conn.exec_sql_batch("SELECT * FROM missing").await.unwrap_err();
    assert_eq!(request_code(&err), "EREQUEST");
    assert_eq!(err.server_error().map(|s| s.number), Some(208));
    assert_eq!(conn.state(), State::LoggedIn);

    conn.exec_sql_batch("SELECT 1").await.unwrap();
}

#[tokio::test]
async fn test_execute_sql_goes_through_sp_executesql() {
    let server = MockTdsServer::builder()
        .with_response("sp_executesql", MockResponse::scalar_int(7))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let response = conn
        .execute_sql(
            "SELECT @a + @b",
            vec![RpcParam::infer("@a", SqlValue::Int(3)), RpcParam::infer("@b", SqlValue::Int(4))],
        )
        .await
        .unwrap();
    assert_eq!(response.first().unwrap().rows[0].get(0), Some(&SqlValue::Int(7)));
    assert_eq!(server.log().rpcs[0].procedure, "sp_executesql");
}

#[tokio::test]
async fn test_procedure_outputs_and_return_status() {
    let server = MockTdsServer::builder()
        .with_response(
            "dbo.get_total",
            MockResponse::Procedure {
                return_status: 3,
                outputs: vec![("@total".into(), SqlValue::Int(42))],
            },
        )
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let response = conn
        .call_procedure(
            "dbo.get_total",
            vec![RpcParam::new("@total", SqlType::Int, SqlValue::Null).output()],
        )
        .await
        .unwrap();
    assert_eq!(response.return_status, Some(3));
    assert_eq!(response.get_output("total").unwrap().value, SqlValue::Int(42));
    assert_eq!(server.log().rpcs[0].procedure, "dbo.get_total");
}

#[tokio::test]
async fn test_parameter_out_of_range_is_param_error() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut conn = connect(&server, |c| c).await;

    let err = conn
        .execute_sql("SELECT @p", vec![RpcParam::new("@p", SqlType::TinyInt, SqlValue::Int(1000))])
        .await
        .unwrap_err();
    assert_eq!(request_code(&err), "EPARAM");
    assert_eq!(conn.state(), State::LoggedIn);
    assert!(server.log().rpcs.is_empty());
}

// =============================================================================
// Session state
// =============================================================================

#[tokio::test]
async fn test_packet_size_from_server_applies() {
    let server = MockTdsServer::builder()
        .with_packet_size(8192)
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c.packet_size(4096)).await;
    assert_eq!(conn.packet_size(), 8192);
    assert_eq!(server.log().logins[0].packet_size, 4096);

    conn.exec_sql_batch("SELECT 1").await.unwrap();
}

#[tokio::test]
async fn test_transaction_descriptor_sent_with_next_batch() {
    let descriptor: u64 = 0x0000_0001_0000_00AB;
    let mut begin = BytesMut::new();
    EnvChange::encode_binary(EnvChangeType::BeginTransaction, &descriptor.to_le_bytes(), &[], &mut begin)
        .unwrap();
    Done {
        status: DoneStatus::empty(),
        cur_cmd: 0,
        row_count: 0,
    }
    .encode(TokenType::Done, &mut begin);

    let server = MockTdsServer::builder()
        .with_response("BEGIN TRANSACTION", MockResponse::Raw(begin.freeze()))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    conn.exec_sql_batch("BEGIN TRANSACTION").await.unwrap();
    assert_eq!(conn.transaction_descriptor(), descriptor);
    conn.exec_sql_batch("UPDATE accounts SET balance = 0").await.unwrap();

    let log = server.log();
    let update = log.batches.last().unwrap();
    assert_eq!(update.sql, "UPDATE accounts SET balance = 0");
    assert_eq!(update.transaction_descriptor, descriptor);
}

#[tokio::test]
async fn test_reset_sets_reset_bit() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut conn = connect(&server, |c| c).await;

    conn.reset().await.unwrap();
    let log = server.log();
    let reset = log.batches.last().unwrap();
    assert!(reset.reset);
    assert!(reset.sql.is_empty());
    assert!(!log.batches[0].reset);
}

// =============================================================================
// Timeouts and cancellation
// =============================================================================

#[tokio::test]
async fn test_request_timeout_sends_attention() {
    let server = MockTdsServer::builder()
        .with_response(HANGING_QUERY, MockResponse::Hang)
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c.request_timeout(Duration::from_millis(100))).await;

    let err = conn.exec_sql_batch(HANGING_QUERY).await.unwrap_err();
    assert_eq!(request_code(&err), "ETIMEOUT");
    assert!(err.to_string().contains("100ms"));
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(server.log().attentions, 1);

    let response = conn.exec_sql_batch("SELECT 1").await.unwrap();
    assert_eq!(response.first().unwrap().rows[0].get(0), Some(&SqlValue::Int(1)));
}

#[tokio::test]
async fn test_per_request_timeout_overrides_config() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c.request_timeout(Duration::ZERO)).await;

    let err = conn
        .execute(Request::batch(HANGING_QUERY).with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(request_code(&err), "ETIMEOUT");
}

#[tokio::test]
async fn test_first_packet_clears_request_timer() {
    let server = MockTdsServer::builder()
        .with_response("SELECT 1", MockResponse::scalar_int(1).delayed(Duration::from_millis(20)))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c.request_timeout(Duration::from_millis(500))).await;
    conn.exec_sql_batch("SELECT 1").await.unwrap();
    assert_eq!(server.log().attentions, 0);
}

#[tokio::test]
async fn test_cancel_in_flight_request() {
    let server = MockTdsServer::builder()
        .with_response(HANGING_QUERY, MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c.request_timeout(Duration::ZERO)).await;
    let handle = conn.cancel_handle();
    assert!(!handle.cancel());

    let canceller = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if handle.cancel() {
                break;
            }
        }
    });

    let err = conn.exec_sql_batch(HANGING_QUERY).await.unwrap_err();
    canceller.await.unwrap();
    assert_eq!(request_code(&err), "ECANCEL");
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(server.log().attentions, 1);
    assert!(!conn.cancel_handle().is_cancelling());
}

#[tokio::test]
async fn test_cancel_timeout_closes_connection() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::IgnoreAttention)
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| {
        c.request_timeout(Duration::from_millis(50))
            .cancel_timeout(Duration::from_millis(100))
    })
    .await;
    let err = conn.exec_sql_batch(HANGING_QUERY).await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(err.code(), "ETIMEOUT");
    assert!(err.to_string().contains("failed to cancel request in 100ms"));
    assert_eq!(conn.state(), State::Final);
}

#[tokio::test]
async fn test_cancel_after_timeout_preserves_timeout() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::SlowAttentionAck(Duration::from_millis(300)))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| {
        c.request_timeout(Duration::from_millis(50))
            .cancel_timeout(Duration::from_secs(5))
    })
    .await;
    let handle = conn.cancel_handle();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        for _ in 0..20 {
            if handle.cancel() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    });

    let err = conn.exec_sql_batch(HANGING_QUERY).await.unwrap_err();
    assert!(canceller.await.unwrap());
    assert_eq!(request_code(&err), "ETIMEOUT");
    assert!(err.to_string().contains("50ms"));
    assert_eq!(conn.state(), State::LoggedIn);
    assert_eq!(server.log().attentions, 1);
}

#[tokio::test]
async fn test_server_disconnect_fails_request() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Disconnect)
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let err = conn.exec_sql_batch("SELECT 1").await.unwrap_err();
    assert_eq!(request_code(&err), "ESOCKET");
    assert_eq!(conn.state(), State::Final);

    let err = conn.exec_sql_batch("SELECT 1").await.unwrap_err();
    assert_eq!(request_code(&err), "EINVALIDSTATE");
}

#[tokio::test]
async fn test_request_after_close_is_invalid_state() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut conn = connect(&server, |c| c).await;
    conn.close().await;
    assert!(conn.is_closed());

    let err = conn.exec_sql_batch("SELECT 1").await.unwrap_err();
    assert_eq!(request_code(&err), "EINVALIDSTATE");
}

// =============================================================================
// Streamed parameters
// =============================================================================

#[tokio::test]
async fn test_streamed_parameter_sent_in_chunks() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let mut conn = connect(&server, |c| c).await;

    let chunks: Vec<Result<Bytes, SourceError>> = vec![
        Ok(Bytes::from(vec![0xAB; 3000])),
        Ok(Bytes::from(vec![0xCD; 3000])),
    ];
    let request = Request::procedure(
        "dbo.store_blob",
        vec![RpcParam::streamed("@data", SqlType::VarBinary(TypeLength::Max)).unwrap()],
    )
    .with_stream("@data", futures_util::stream::iter(chunks));
    conn.execute(request).await.unwrap();

    let log = server.log();
    assert_eq!(log.rpcs[0].procedure, "dbo.store_blob");
    assert!(log.rpcs[0].payload.len() > 6000);
    assert_eq!(log.ignored_messages, 0);
}

#[tokio::test]
async fn test_failing_stream_cancels_message() {
    let server = MockTdsServer::builder()
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let mut conn = connect(&server, |c| c).await;

    let chunks: Vec<Result<Bytes, SourceError>> = vec![
        Ok(Bytes::from(vec![0x01; 5000])),
        Err("disk read failed".into()),
    ];
    let request = Request::procedure(
        "dbo.store_blob",
        vec![RpcParam::streamed("@data", SqlType::VarBinary(TypeLength::Max)).unwrap()],
    )
    .with_stream("@data", futures_util::stream::iter(chunks));
    let err = conn.execute(request).await.unwrap_err();
    assert_eq!(request_code(&err), "EREQUEST");
    assert!(err.to_string().contains("disk read failed"));
    assert_eq!(conn.state(), State::LoggedIn);

    let log = server.log();
    assert_eq!(log.ignored_messages, 1);
    assert!(log.rpcs.is_empty());
    assert_eq!(log.attentions, 1);

    conn.exec_sql_batch("SELECT 1").await.unwrap();
}
