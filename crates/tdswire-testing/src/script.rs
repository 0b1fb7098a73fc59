//! Scripted server behavior.
//!
//! A [`LoginBehavior`] decides how the server answers a LOGIN7, a
//! [`MockResponse`] how it answers a SQL batch or RPC call.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tdswire_protocol::{
    Collation, Column, ColumnMetadata, ColumnFlags, Done, DoneStatus, ReturnValue, Row,
    ServerMessage, SqlType, TokenType,
};
use tdswire_types::SqlValue;

use crate::mock_server::MockServerError;

/// How the server answers a LOGIN7.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoginBehavior {
    /// Acknowledge the login.
    #[default]
    Accept,
    /// Answer with an ERROR token and no LOGINACK.
    Reject {
        /// Error number, e.g. 18456 or a transient number such as 40613.
        number: i32,
        /// Error text.
        message: String,
    },
    /// Acknowledge the login, then redirect the client.
    Route {
        /// Host to route to.
        host: String,
        /// Port to route to.
        port: u16,
    },
    /// Send an NTLM CHALLENGE and accept whatever AUTHENTICATE comes back.
    Ntlm,
    /// Send FEDAUTHINFO, wait for a FEDAUTH_TOKEN message, then accept with
    /// a FEATUREEXTACK.
    FedAuth {
        /// Token service URL announced to the client.
        sts_url: String,
        /// Service principal name announced to the client.
        spn: String,
    },
    /// Acknowledge the login without a FEATUREEXTACK.
    NoFeatureAck,
    /// Read the login and never answer.
    Hang,
}

impl LoginBehavior {
    /// Rejection with login-failed number 18456.
    #[must_use]
    pub fn reject(message: impl Into<String>) -> Self {
        Self::Reject {
            number: 18456,
            message: message.into(),
        }
    }

    /// Rejection with a transient error number.
    #[must_use]
    pub fn transient(number: i32) -> Self {
        Self::Reject {
            number,
            message: format!("transient failure {number}"),
        }
    }
}

/// How the server answers a request.
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    /// One result set.
    Rows {
        /// Result set shape.
        columns: Vec<Column>,
        /// Row values, one `Vec` per row.
        rows: Vec<Vec<SqlValue>>,
    },
    /// DONE with a row count.
    RowsAffected(u64),
    /// ERROR followed by DONE with the error bit.
    Error {
        /// Error number.
        number: i32,
        /// Error text.
        message: String,
        /// Severity class.
        class: u8,
    },
    /// Output parameters and a return status, ending in DONEPROC.
    Procedure {
        /// Value of RETURNSTATUS.
        return_status: i32,
        /// Output parameter names and values.
        outputs: Vec<(String, SqlValue)>,
    },
    /// Wait, then answer. An ATTENTION during the wait is acknowledged
    /// instead.
    Delay(Duration, Box<MockResponse>),
    /// Never answer; acknowledge an ATTENTION when one arrives.
    Hang,
    /// Never answer and never acknowledge an ATTENTION.
    IgnoreAttention,
    /// Never answer; acknowledge an ATTENTION only after the pause.
    SlowAttentionAck(Duration),
    /// Close the connection without answering.
    Disconnect,
    /// Send these token bytes verbatim as the response message.
    Raw(Bytes),
}

impl MockResponse {
    /// Single `INT` column with one row.
    #[must_use]
    pub fn scalar_int(value: i32) -> Self {
        Self::single("", SqlValue::Int(value))
    }

    /// Single `NVARCHAR` column with one row.
    #[must_use]
    pub fn scalar_string(value: impl Into<String>) -> Self {
        Self::single("", SqlValue::String(value.into()))
    }

    /// Single column named `name` holding `value`, typed from the value.
    #[must_use]
    pub fn single(name: &str, value: SqlValue) -> Self {
        let column = Column::new(name, SqlType::infer(&value).type_info(Collation::default()));
        Self::Rows {
            columns: vec![column],
            rows: vec![vec![value]],
        }
    }

    /// DONE without a row count.
    #[must_use]
    pub fn empty() -> Self {
        Self::Raw(Bytes::new())
    }

    /// DONE with `count` rows affected.
    #[must_use]
    pub fn affected(count: u64) -> Self {
        Self::RowsAffected(count)
    }

    /// Class-16 error.
    #[must_use]
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            message: message.into(),
            class: 16,
        }
    }

    /// Wait `delay` before answering with `self`.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        Self::Delay(delay, Box::new(self))
    }

    /// Encode the token stream of an immediate response.
    ///
    /// Control responses such as `Delay` and `Hang` are handled by the
    /// connection loop and encode to nothing.
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), MockServerError> {
        match self {
            Self::Rows { columns, rows } => {
                let metadata = ColumnMetadata {
                    columns: columns.clone(),
                };
                metadata.encode(dst)?;
                for row in rows {
                    Row::encode(&metadata, row, dst)?;
                }
                done(TokenType::Done, DoneStatus::COUNT, rows.len() as u64, dst);
            }
            Self::RowsAffected(count) => done(TokenType::Done, DoneStatus::COUNT, *count, dst),
            Self::Error {
                number,
                message,
                class,
            } => {
                server_message(*number, *class, message).encode(TokenType::Error, dst)?;
                done(TokenType::Done, DoneStatus::ERROR, 0, dst);
            }
            Self::Procedure {
                return_status,
                outputs,
            } => {
                for (ordinal, (name, value)) in outputs.iter().enumerate() {
                    ReturnValue {
                        ordinal: ordinal as u16,
                        name: name.clone(),
                        status: 0x01,
                        user_type: 0,
                        flags: ColumnFlags::from_bits(ColumnFlags::NULLABLE),
                        type_info: SqlType::infer(value).type_info(Collation::default()),
                        value: value.clone(),
                    }
                    .encode(dst)?;
                }
                dst.put_u8(TokenType::ReturnStatus as u8);
                dst.put_i32_le(*return_status);
                done(TokenType::DoneProc, DoneStatus::empty(), 0, dst);
            }
            Self::Raw(bytes) if bytes.is_empty() => done(TokenType::Done, DoneStatus::empty(), 0, dst),
            Self::Raw(bytes) => dst.put_slice(bytes),
            Self::Delay(..)
            | Self::Hang
            | Self::IgnoreAttention
            | Self::SlowAttentionAck(_)
            | Self::Disconnect => {}
        }
        Ok(())
    }
}

/// Write a DONE-family token.
pub(crate) fn done(token: TokenType, status: DoneStatus, row_count: u64, dst: &mut BytesMut) {
    Done {
        status,
        cur_cmd: 0,
        row_count,
    }
    .encode(token, dst);
}

/// Build an ERROR or INFO body from the mock server.
pub(crate) fn server_message(number: i32, class: u8, message: &str) -> ServerMessage {
    ServerMessage {
        number,
        state: 1,
        class,
        message: message.to_string(),
        server: "mock".to_string(),
        procedure: String::new(),
        line: 1,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tdswire_protocol::stream::TokenStreamParser;
    use tdswire_protocol::{TdsVersion, Token};

    fn tokens(response: &MockResponse) -> Vec<Token> {
        let mut buf = BytesMut::new();
        response.encode(&mut buf).unwrap();
        let mut parser = TokenStreamParser::new(TdsVersion::V7_4);
        parser.push(&buf);
        let mut out = Vec::new();
        while let Some(token) = parser.next_token().unwrap() {
            out.push(token);
        }
        out
    }

    #[test]
    fn test_scalar_int_tokens() {
        let tokens = tokens(&MockResponse::scalar_int(42));
        assert!(matches!(tokens[0], Token::ColMetadata(_)));
        match &tokens[1] {
            Token::Row(row) => assert_eq!(row.get(0), Some(&SqlValue::Int(42))),
            other => panic!("expected row, got {other:?}"),
        }
        match &tokens[2] {
            Token::Done(done) => assert_eq!(done.rows_affected(), Some(1)),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn test_error_sets_done_error_bit() {
        let tokens = tokens(&MockResponse::error(208, "Invalid object name 'missing'."));
        match &tokens[0] {
            Token::Error(msg) => {
                assert_eq!(msg.number, 208);
                assert_eq!(msg.class, 16);
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(&tokens[1], Token::Done(done) if done.has_error()));
    }

    #[test]
    fn test_procedure_tokens() {
        let response = MockResponse::Procedure {
            return_status: 7,
            outputs: vec![("@total".into(), SqlValue::Int(99))],
        };
        let tokens = tokens(&response);
        assert!(matches!(&tokens[0], Token::ReturnValue(rv) if rv.name == "@total"));
        assert!(matches!(tokens[1], Token::ReturnStatus(7)));
        assert!(matches!(tokens[2], Token::DoneProc(_)));
    }

    #[test]
    fn test_control_responses_encode_nothing() {
        for response in [
            MockResponse::Hang,
            MockResponse::IgnoreAttention,
            MockResponse::SlowAttentionAck(Duration::from_millis(10)),
            MockResponse::Disconnect,
        ] {
            let mut buf = BytesMut::new();
            response.encode(&mut buf).unwrap();
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_transient_reject() {
        assert_eq!(
            LoginBehavior::transient(40613),
            LoginBehavior::Reject {
                number: 40613,
                message: "transient failure 40613".into()
            }
        );
    }
}
