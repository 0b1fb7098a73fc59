//! # tdswire-protocol
//!
//! IO-free implementation of the TDS wire format.
//!
//! This crate knows how bytes are laid out and nothing about sockets,
//! timers or TLS. It covers:
//!
//! - packet headers and message packetization ([`packet`])
//! - PRELOGIN and LOGIN7 payloads ([`prelogin`], [`login7`])
//! - TYPE_INFO and COLMETADATA ([`metadata`]) with collations
//!   ([`collation`])
//! - per-type value decode and encode, including PLP streams ([`value`])
//! - the token stream, token by token ([`token`]) or incrementally over
//!   arbitrary chunk boundaries ([`stream`])
//! - SQL batch, RPC and FEDAUTH_TOKEN request payloads
//!
//! ## Incomplete input
//!
//! Decoders read through a [`Cursor`]. Running out of bytes is reported as
//! [`DecodeError::NeedMoreData`], never as a failure: the caller appends
//! bytes and retries from the same offset. Everything in
//! [`ProtocolError`] is fatal for the connection.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod collation;
pub mod cursor;
pub mod error;
pub mod fedauth;
pub mod login7;
pub mod metadata;
pub mod packet;
pub mod prelogin;
pub mod rpc;
pub mod sql_batch;
pub mod stream;
pub mod token;
pub mod types;
pub mod value;
pub mod version;

pub use collation::Collation;
pub use cursor::Cursor;
pub use error::{DecodeError, DecodeResult, ParamError, ProtocolError};
pub use fedauth::encode_fedauth_token;
pub use login7::{FeatureExtension, FeatureId, FedAuthWorkflow, Login7};
pub use metadata::{Column, ColumnMetadata, TypeInfo};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, Packet, PacketHeader,
    PacketStatus, PacketType, packetize, validate_packet_size,
};
pub use prelogin::{EncryptionLevel, PreLogin};
pub use rpc::{ParamData, ParamStatus, RpcParam, RpcPart, RpcRequest};
pub use sql_batch::encode_sql_batch;
pub use stream::TokenStreamParser;
pub use token::{
    Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue, FeatureExtAck, FedAuthInfo, LoginAck,
    ReturnValue, Row, ServerMessage, Token, TokenType,
};
pub use types::{ColumnFlags, TypeId};
pub use value::{SqlType, TypeLength};
pub use version::{ServerVersion, TdsVersion};
