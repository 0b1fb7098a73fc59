//! Protocol-level error types.

use tdswire_types::TypeError;
use thiserror::Error;

/// Errors raised while encoding or decoding TDS structures.
///
/// Every variant means the byte stream can no longer be trusted; callers
/// treat these as fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Unknown packet type in a packet header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Status byte carries bits outside the defined set.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Declared packet length is shorter than the packet header.
    #[error("invalid packet length {0}: shorter than the 8-byte header")]
    InvalidPacketLength(u16),

    /// Packet exceeds the negotiated packet size.
    #[error("packet too large: {length} bytes (max {max})")]
    PacketTooLarge {
        /// Declared length.
        length: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// Packet size outside the range the server accepts.
    #[error("invalid packet size {0}: must be between 512 and 32767")]
    InvalidPacketSize(usize),

    /// Unknown token type in a token stream.
    #[error("unknown token type: 0x{0:02X}")]
    UnknownToken(u8),

    /// Unknown data type identifier in metadata.
    #[error("unknown data type: 0x{0:02X}")]
    UnknownType(u8),

    /// A value's length byte does not match any width of its type.
    #[error("invalid length {length} for {type_name} value")]
    InvalidValueLength {
        /// Type being decoded.
        type_name: &'static str,
        /// Length found on the wire.
        length: usize,
    },

    /// A known-length PLP stream delivered a different number of bytes.
    #[error("PLP length mismatch: declared {expected} bytes, received {actual}")]
    PlpLengthMismatch {
        /// Declared total length.
        expected: u64,
        /// Sum of chunk lengths.
        actual: u64,
    },

    /// A ROW token arrived before any COLMETADATA.
    #[error("row received without column metadata")]
    MissingMetadata,

    /// The message ended in the middle of a token.
    #[error("token stream ended with {0} unparsed bytes")]
    TruncatedTokenStream(usize),

    /// Malformed field inside a structure.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// Structure field.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// UTF-16 data was not valid.
    #[error("invalid UTF-16 string")]
    InvalidUtf16,

    /// A value exceeds what its wire field can carry.
    #[error("{field} too long: {length} exceeds {max}")]
    TooLong {
        /// Field being written.
        field: &'static str,
        /// Actual length.
        length: usize,
        /// Field maximum.
        max: usize,
    },

    /// Value conversion failure.
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// A parameter value that cannot be sent as its declared type.
///
/// Raised before any bytes are written, so the connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParamError {
    /// Value is incompatible with or out of range for the declared type.
    #[error(transparent)]
    Type(#[from] TypeError),

    /// String or binary value longer than the declared length.
    #[error("value length {length} exceeds declared length {max}")]
    TooLong {
        /// Length of the value, in characters or bytes.
        length: usize,
        /// Declared length.
        max: u32,
    },

    /// Fractional-second scale above 7.
    #[error("invalid scale {0}: must be between 0 and 7")]
    InvalidScale(u8),

    /// Decimal precision outside 1..=38 or scale above precision.
    #[error("invalid precision {precision} and scale {scale}")]
    InvalidPrecision {
        /// Declared precision.
        precision: u8,
        /// Declared scale.
        scale: u8,
    },

    /// Character not representable in the target code page.
    #[error("string not representable in code page {0}")]
    Unrepresentable(u16),
}

/// Outcome of a decode step that could not produce a value.
///
/// [`DecodeError::NeedMoreData`] is control flow, not a failure: the caller
/// appends bytes and retries the same decode from the same starting offset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ends before the structure does.
    #[error("need more data: {required} bytes required")]
    NeedMoreData {
        /// Minimum buffer length, from the decode start, before a retry
        /// can make progress.
        required: usize,
    },

    /// The bytes are malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl DecodeError {
    /// Whether this is the incomplete-input signal.
    #[must_use]
    pub const fn is_incomplete(&self) -> bool {
        matches!(self, Self::NeedMoreData { .. })
    }
}

impl From<TypeError> for DecodeError {
    fn from(e: TypeError) -> Self {
        Self::Protocol(ProtocolError::Type(e))
    }
}

/// Shorthand for fallible decode steps.
pub type DecodeResult<T> = Result<T, DecodeError>;
