//! Client requests.
//!
//! A [`Request`] is a SQL batch or an RPC call. RPC parameters may be
//! streamed: the parameter is declared with [`RpcParam::streamed`] and its
//! bytes are supplied with [`Request::with_stream`]. Streamed values go out
//! as unknown-length PLP bodies while the rest of the request is already on
//! the wire.

use std::pin::Pin;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use tdswire_codec::SourceError;
use tdswire_protocol::value::plp::{write_plp_chunk, write_plp_terminator, write_plp_unknown_header};
use tdswire_protocol::{
    Collation, PacketType, ParamData, RpcParam, RpcPart, RpcRequest, encode_sql_batch,
};

use crate::error::{RequestError, RequestErrorCode};

/// Byte source for a streamed parameter.
pub type ParamStream = Pin<Box<dyn Stream<Item = Result<Bytes, SourceError>> + Send>>;

/// Payload source for the streaming send path.
pub(crate) type PayloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, SourceError>> + Send>>;

#[derive(Debug)]
enum RequestKind {
    Batch(String),
    Rpc(RpcRequest),
}

/// A request to run on a logged-in connection.
pub struct Request {
    kind: RequestKind,
    streams: Vec<(String, ParamStream)>,
    timeout: Option<Duration>,
    reset_connection: bool,
}

/// Encoded request, ready for the transport.
pub(crate) enum Payload {
    /// Whole message in one buffer.
    Buffered(PacketType, Bytes),
    /// Message produced while sending.
    Streamed(PacketType, PayloadStream),
}

impl Request {
    fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            streams: Vec::new(),
            timeout: None,
            reset_connection: false,
        }
    }

    /// SQL batch.
    #[must_use]
    pub fn batch(sql: impl Into<String>) -> Self {
        Self::new(RequestKind::Batch(sql.into()))
    }

    /// Parameterized SQL run through `sp_executesql`.
    #[must_use]
    pub fn execute_sql(sql: &str, params: Vec<RpcParam>) -> Self {
        Self::new(RequestKind::Rpc(RpcRequest::execute_sql(sql, params)))
    }

    /// Stored procedure call.
    #[must_use]
    pub fn procedure(name: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self::new(RequestKind::Rpc(RpcRequest::procedure(name, params)))
    }

    /// Override the connection's request timeout. Zero disables it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Supply the bytes of a streamed parameter.
    #[must_use]
    pub fn with_stream<St>(mut self, param: impl Into<String>, source: St) -> Self
    where
        St: Stream<Item = Result<Bytes, SourceError>> + Send + 'static,
    {
        self.streams.push((param.into(), Box::pin(source)));
        self
    }

    /// Set the reset-connection bit on the first packet.
    #[must_use]
    pub fn reset_connection(mut self, reset: bool) -> Self {
        self.reset_connection = reset;
        self
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn resets_connection(&self) -> bool {
        self.reset_connection
    }

    /// Validate parameters and match streams to streamed parameters.
    ///
    /// Runs before any byte is written, so a failure leaves the connection
    /// idle.
    pub(crate) fn prepare(&mut self, collation: Collation) -> Result<(), RequestError> {
        let rpc = match &mut self.kind {
            RequestKind::Batch(_) => {
                if let Some((name, _)) = self.streams.first() {
                    return Err(param_error(format!(
                        "stream supplied for {name} but a SQL batch has no parameters"
                    )));
                }
                return Ok(());
            }
            RequestKind::Rpc(rpc) => rpc,
        };

        for param in rpc.params_mut() {
            param
                .coerce(collation)
                .map_err(|e| param_error(format!("parameter {}: {e}", display_name(&param.name))).with_source(e))?;
        }

        for param in rpc.params().iter().filter(|p| p.data == ParamData::Stream) {
            if !self.streams.iter().any(|(name, _)| same_param(name, &param.name)) {
                return Err(param_error(format!(
                    "no stream supplied for parameter {}",
                    display_name(&param.name)
                )));
            }
        }
        for (name, _) in &self.streams {
            let declared = rpc
                .params()
                .iter()
                .any(|p| p.data == ParamData::Stream && same_param(name, &p.name));
            if !declared {
                return Err(param_error(format!(
                    "stream supplied for {name}, which is not a streamed parameter"
                )));
            }
        }
        Ok(())
    }

    /// Encode for the wire.
    pub(crate) fn into_payload(
        self,
        transaction_descriptor: u64,
        collation: Collation,
    ) -> Result<Payload, RequestError> {
        let rpc = match self.kind {
            RequestKind::Batch(sql) => {
                return Ok(Payload::Buffered(
                    PacketType::SqlBatch,
                    encode_sql_batch(&sql, transaction_descriptor),
                ));
            }
            RequestKind::Rpc(rpc) => rpc,
        };

        let parts = rpc
            .encode_parts(transaction_descriptor, collation)
            .map_err(|e| param_error(e.to_string()).with_source(e))?;

        if !rpc.has_streams() {
            let mut out = BytesMut::new();
            for part in parts {
                if let RpcPart::Bytes(b) = part {
                    out.extend_from_slice(&b);
                }
            }
            return Ok(Payload::Buffered(PacketType::Rpc, out.freeze()));
        }

        let mut streams = self.streams;
        let mut pieces: Vec<PayloadStream> = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                RpcPart::Bytes(b) => pieces.push(Box::pin(stream::once(async move { Ok(b) }))),
                RpcPart::Stream(index) => {
                    let name = &rpc.params()[index].name;
                    let at = streams
                        .iter()
                        .position(|(n, _)| same_param(n, name))
                        .ok_or_else(|| param_error(format!("no stream supplied for parameter {name}")))?;
                    let (_, source) = streams.swap_remove(at);
                    pieces.push(plp_body(source));
                }
            }
        }
        Ok(Payload::Streamed(PacketType::Rpc, Box::pin(stream::iter(pieces).flatten())))
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("streams", &self.streams.len())
            .field("timeout", &self.timeout)
            .field("reset_connection", &self.reset_connection)
            .finish()
    }
}

/// Frame a caller stream as an unknown-length PLP body.
fn plp_body(source: ParamStream) -> PayloadStream {
    let mut header = BytesMut::with_capacity(8);
    write_plp_unknown_header(&mut header);
    let mut terminator = BytesMut::with_capacity(4);
    write_plp_terminator(&mut terminator);

    let chunks = source
        .try_filter(|chunk| std::future::ready(!chunk.is_empty()))
        .map_ok(|chunk| {
            let mut framed = BytesMut::with_capacity(chunk.len() + 4);
            write_plp_chunk(&mut framed, &chunk);
            framed.freeze()
        });

    let header = header.freeze();
    let terminator = terminator.freeze();
    Box::pin(
        stream::once(async move { Ok(header) })
            .chain(chunks)
            .chain(stream::once(async move { Ok(terminator) })),
    )
}

fn same_param(a: &str, b: &str) -> bool {
    a.trim_start_matches('@')
        .eq_ignore_ascii_case(b.trim_start_matches('@'))
}

fn display_name(name: &str) -> &str {
    if name.is_empty() { "(positional)" } else { name }
}

fn param_error(message: String) -> RequestError {
    RequestError::new(RequestErrorCode::Param, message)
}
