//! Codec error types.

use std::io;

use tdswire_protocol::{PacketType, ProtocolError};
use thiserror::Error;

/// Boxed error from a caller-supplied message source.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by framing and transport operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Socket read or write failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed packet header or payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A packet of another type arrived while a message was open.
    #[error("{actual:?} packet inside an open {expected:?} message")]
    UnexpectedPacketType {
        /// Type of the open message.
        expected: PacketType,
        /// Type of the offending packet.
        actual: PacketType,
    },

    /// The peer closed the stream in the middle of a message.
    #[error("connection closed mid-message")]
    ConnectionClosed,

    /// A streamed message source failed. The partial message was sent with
    /// the IGNORE bit, so the connection is still usable.
    #[error("message source failed: {0}")]
    Source(#[source] SourceError),

    /// The raw stream cannot be taken back while unread bytes are buffered.
    #[error("{0} unread bytes buffered at stream hand-off")]
    BufferedData(usize),

    /// The transport is not in the mode the operation needs.
    #[error("transport is {0}")]
    InvalidMode(&'static str),
}

impl CodecError {
    /// Whether the connection can keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Source(_))
    }
}
