//! # tdswire-codec
//!
//! Async framing between a byte stream and TDS messages.
//!
//! ```text
//! byte stream → PacketCodec → MessageAssembler → caller
//! caller → packetize / PacketFramer → PacketCodec → byte stream
//! ```
//!
//! [`Transport`] drives both directions over any `AsyncRead + AsyncWrite`
//! stream. Messages can be sent whole or streamed from an async source;
//! a failing source ends the message with the IGNORE bit so the server
//! drops it and the connection stays usable.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod message;
pub mod packet_codec;
pub mod transport;

pub use error::{CodecError, SourceError};
pub use message::{Message, MessageAssembler, PacketFramer};
pub use packet_codec::PacketCodec;
pub use transport::{PacketSizeListener, Transport};
