//! Incremental token stream parsing.
//!
//! Message bytes arrive in packet-sized pieces that rarely line up with
//! token boundaries. [`TokenStreamParser`] buffers them and yields whole
//! tokens; when the buffer ends inside a token it returns `Ok(None)` and
//! resumes from the same offset once more bytes are pushed.

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::cursor::Cursor;
use crate::error::{DecodeError, ProtocolError};
use crate::metadata::ColumnMetadata;
use crate::token::{Token, decode_token};
use crate::version::TdsVersion;

/// Buffering token parser for one connection.
#[derive(Debug)]
pub struct TokenStreamParser {
    buf: BytesMut,
    version: TdsVersion,
    metadata: Option<Arc<ColumnMetadata>>,
    /// Buffer length required before the next attempt can make progress.
    required: usize,
}

impl TokenStreamParser {
    /// Create a parser for the given protocol version.
    #[must_use]
    pub fn new(version: TdsVersion) -> Self {
        Self {
            buf: BytesMut::new(),
            version,
            metadata: None,
            required: 0,
        }
    }

    /// Switch to the version acknowledged at login.
    pub fn set_version(&mut self, version: TdsVersion) {
        self.version = version;
    }

    /// Negotiated protocol version.
    #[must_use]
    pub const fn version(&self) -> TdsVersion {
        self.version
    }

    /// Shape of the current result set.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<ColumnMetadata>> {
        self.metadata.as_ref()
    }

    /// Bytes received but not yet consumed.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append message bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next token.
    ///
    /// `Ok(None)` means the buffer holds no complete token; nothing was
    /// consumed.
    pub fn next_token(&mut self) -> Result<Option<Token>, ProtocolError> {
        loop {
            if self.buf.is_empty() || self.buf.len() < self.required {
                return Ok(None);
            }
            let mut cur = Cursor::new(&self.buf);
            match decode_token(&mut cur, self.version, self.metadata.as_ref()) {
                Ok(token) => {
                    let consumed = cur.position();
                    self.buf.advance(consumed);
                    self.required = 0;
                    match token {
                        Some(token) => {
                            if let Token::ColMetadata(md) = &token {
                                self.metadata = Some(Arc::clone(md));
                            }
                            tracing::trace!(consumed, token = token_name(&token), "decoded token");
                            return Ok(Some(token));
                        }
                        None => tracing::trace!(consumed, "skipped token"),
                    }
                }
                Err(DecodeError::NeedMoreData { required }) => {
                    self.required = required;
                    return Ok(None);
                }
                Err(DecodeError::Protocol(e)) => return Err(e),
            }
        }
    }

    /// Check that the message ended on a token boundary.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            let left = self.buf.len();
            self.clear_buffer();
            Err(ProtocolError::TruncatedTokenStream(left))
        }
    }

    /// Drop buffered bytes and the current result-set shape.
    pub fn reset(&mut self) {
        self.clear_buffer();
        self.metadata = None;
    }

    fn clear_buffer(&mut self) {
        self.buf.clear();
        self.required = 0;
    }
}

fn token_name(token: &Token) -> &'static str {
    match token {
        Token::ColMetadata(_) => "COLMETADATA",
        Token::Row(_) => "ROW",
        Token::Done(_) => "DONE",
        Token::DoneProc(_) => "DONEPROC",
        Token::DoneInProc(_) => "DONEINPROC",
        Token::ReturnStatus(_) => "RETURNSTATUS",
        Token::ReturnValue(_) => "RETURNVALUE",
        Token::Error(_) => "ERROR",
        Token::Info(_) => "INFO",
        Token::LoginAck(_) => "LOGINACK",
        Token::EnvChange(_) => "ENVCHANGE",
        Token::Order(_) => "ORDER",
        Token::FeatureExtAck(_) => "FEATUREEXTACK",
        Token::Sspi(_) => "SSPI",
        Token::FedAuthInfo(_) => "FEDAUTHINFO",
    }
}
