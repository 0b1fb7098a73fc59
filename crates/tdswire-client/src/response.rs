//! Collected request results.

use std::sync::Arc;

use tdswire_protocol::{ColumnMetadata, Done, DoneStatus, Row, ServerMessage, Token};
use tdswire_types::SqlValue;

use crate::error::{RequestError, ServerError};

/// Rows of one result set.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Column descriptions.
    pub columns: Arc<ColumnMetadata>,
    /// Rows in arrival order.
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the result set has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// An output parameter from a stored procedure call.
#[derive(Debug, Clone)]
pub struct OutputParam {
    /// Parameter name including the `@`.
    pub name: String,
    /// Parameter value.
    pub value: SqlValue,
}

/// Everything a request produced.
#[derive(Debug, Clone, Default)]
pub struct Response {
    /// Result sets in order.
    pub result_sets: Vec<ResultSet>,
    /// Row counts from DONE tokens that carried one.
    pub row_counts: Vec<u64>,
    /// Procedure return status.
    pub return_status: Option<i32>,
    /// Output parameters.
    pub output_params: Vec<OutputParam>,
    /// Informational messages.
    pub messages: Vec<ServerMessage>,
}

impl Response {
    /// Total rows affected across statements.
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.row_counts.iter().sum()
    }

    /// First result set, if any.
    #[must_use]
    pub fn first(&self) -> Option<&ResultSet> {
        self.result_sets.first()
    }

    /// Get an output parameter by name. The `@` is optional.
    #[must_use]
    pub fn get_output(&self, name: &str) -> Option<&OutputParam> {
        let name = name.trim_start_matches('@');
        self.output_params
            .iter()
            .find(|p| p.name.trim_start_matches('@').eq_ignore_ascii_case(name))
    }
}

/// Folds response tokens into a [`Response`].
#[derive(Debug, Default)]
pub(crate) struct ResponseBuilder {
    response: Response,
    errors: Vec<ServerError>,
}

impl ResponseBuilder {
    /// Absorb a token. Tokens that concern the session rather than the
    /// response are handed back.
    pub(crate) fn push(&mut self, token: Token) -> Option<Token> {
        match token {
            Token::ColMetadata(columns) => {
                if !columns.is_empty() {
                    self.response.result_sets.push(ResultSet {
                        columns,
                        rows: Vec::new(),
                    });
                }
            }
            Token::Row(row) => match self.response.result_sets.last_mut() {
                Some(set) => set.rows.push(row),
                None => tracing::debug!("row without column metadata dropped"),
            },
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => self.done(done),
            Token::ReturnStatus(status) => self.response.return_status = Some(status),
            Token::ReturnValue(rv) => self.response.output_params.push(OutputParam {
                name: rv.name,
                value: rv.value,
            }),
            Token::Error(msg) => {
                tracing::debug!(number = msg.number, class = msg.class, message = %msg.message, "server error");
                self.errors.push(msg.into());
            }
            Token::Info(msg) => {
                tracing::info!(number = msg.number, message = %msg.message, "server message");
                self.response.messages.push(msg);
            }
            Token::Order(_) => {}
            other => return Some(other),
        }
        None
    }

    fn done(&mut self, done: Done) {
        if done.status.contains(DoneStatus::COUNT) {
            self.response.row_counts.push(done.row_count);
        }
    }

    /// Finish the response. The first server error fails the request.
    pub(crate) fn finish(self) -> Result<Response, RequestError> {
        match self.errors.into_iter().next() {
            Some(first) => Err(RequestError::from_server(first)),
            None => Ok(self.response),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tdswire_protocol::{Collation, Column, ColumnFlags, ReturnValue, SqlType};

    use crate::error::RequestErrorCode;

    fn metadata() -> Arc<ColumnMetadata> {
        let ti = SqlType::Int.type_info(Collation::default());
        Arc::new(ColumnMetadata {
            columns: vec![Column::new("id", ti)],
        })
    }

    fn row(md: &Arc<ColumnMetadata>, v: i32) -> Token {
        Token::Row(Row {
            metadata: Arc::clone(md),
            values: vec![SqlValue::Int(v)],
        })
    }

    fn done(count: u64) -> Done {
        Done {
            status: DoneStatus::COUNT,
            cur_cmd: 0xC1,
            row_count: count,
        }
    }

    #[test]
    fn test_rows_grouped_by_result_set() {
        let md = metadata();
        let mut builder = ResponseBuilder::default();
        for token in [
            Token::ColMetadata(Arc::clone(&md)),
            row(&md, 1),
            row(&md, 2),
            Token::DoneInProc(done(2)),
            Token::ColMetadata(Arc::clone(&md)),
            row(&md, 3),
            Token::Done(done(1)),
        ] {
            assert!(builder.push(token).is_none());
        }
        let response = builder.finish().unwrap();
        assert_eq!(response.result_sets.len(), 2);
        assert_eq!(response.result_sets[0].len(), 2);
        assert_eq!(response.first().unwrap().rows[1].get(0), Some(&SqlValue::Int(2)));
        assert_eq!(response.rows_affected(), 3);
    }

    #[test]
    fn test_procedure_outputs() {
        let mut builder = ResponseBuilder::default();
        builder.push(Token::ReturnValue(ReturnValue {
            ordinal: 1,
            name: "@Total".into(),
            status: 1,
            user_type: 0,
            flags: ColumnFlags::from_bits(ColumnFlags::NULLABLE),
            type_info: SqlType::BigInt.type_info(Collation::default()),
            value: SqlValue::BigInt(42),
        }));
        builder.push(Token::ReturnStatus(0));
        builder.push(Token::DoneProc(Done::default()));
        let response = builder.finish().unwrap();
        assert_eq!(response.return_status, Some(0));
        assert_eq!(response.get_output("total").unwrap().value, SqlValue::BigInt(42));
        assert_eq!(response.get_output("@TOTAL").unwrap().name, "@Total");
        assert!(response.get_output("missing").is_none());
    }

    #[test]
    fn test_first_error_fails_request() {
        let mut builder = ResponseBuilder::default();
        for number in [547, 3621] {
            builder.push(Token::Error(ServerMessage {
                number,
                class: 16,
                message: format!("error {number}"),
                ..ServerMessage::default()
            }));
        }
        assert_eq!(builder.errors.len(), 2);
        let err = builder.finish().unwrap_err();
        assert_eq!(err.code, RequestErrorCode::Request);
        assert_eq!(err.server.unwrap().number, 547);
    }

    #[test]
    fn test_session_tokens_returned() {
        let mut builder = ResponseBuilder::default();
        let token = Token::Sspi(bytes::Bytes::from_static(b"x"));
        assert!(builder.push(token).is_some());
    }
}
