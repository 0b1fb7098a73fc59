//! # tdswire-client
//!
//! Async TDS client connection built on the lower tdswire crates.
//!
//! ## Features
//!
//! - **Explicit state machine**: every connection is in exactly one
//!   [`State`], and transitions outside the state graph are rejected
//! - **Login flows**: SQL login, NTLM, access tokens and token providers
//! - **In-protocol TLS**: encryption negotiated in PRELOGIN
//! - **Routing and retry**: routed logins reconnect, transient login
//!   failures are retried
//! - **Cancellation**: timeouts and [`CancelHandle::cancel`] send ATTENTION
//!   and wait for the server to acknowledge it
//! - **Streamed parameters**: large values are sent as PLP chunks while
//!   they are produced
//!
//! ## Example
//!
//! ```rust,ignore
//! use tdswire_client::{Config, Connection, RpcParam};
//! use tdswire_types::SqlValue;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_connection_string(
//!         "Server=localhost,1433;Database=test;User Id=sa;Password=Password123;",
//!     )?;
//!     let mut conn = Connection::connect(config).await?;
//!
//!     let response = conn
//!         .execute_sql(
//!             "SELECT name FROM users WHERE id = @id",
//!             vec![RpcParam::infer("@id", SqlValue::Int(1))],
//!         )
//!         .await?;
//!     for row in &response.first().map(|set| set.rows.clone()).unwrap_or_default() {
//!         println!("{:?}", row.get(0));
//!     }
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod request;
pub mod resolve;
pub mod response;
pub mod state;

pub use cancel::CancelHandle;
pub use config::{Config, IsolationLevel, SessionOptions};
pub use connection::Connection;
pub use error::{
    ConnectionError, ConnectionErrorCode, Error, RequestError, RequestErrorCode, Result, ServerError,
};
pub use request::{ParamStream, Request};
pub use response::{OutputParam, Response, ResultSet};
pub use state::State;
pub use tdswire_auth::{Authentication, FedAuthContext, FedAuthTokenProvider, StaticTokenProvider};
pub use tdswire_protocol::{RpcParam, SqlType, TypeLength};
pub use tdswire_tls::TlsConfig;
