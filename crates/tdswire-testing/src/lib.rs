//! # tdswire-testing
//!
//! Test infrastructure for tdswire: a mock TDS server that runs the real
//! handshake over loopback TCP.
//!
//! ## Features
//!
//! - PRELOGIN with a scripted encryption level, and TLS inside PRELOGIN
//!   packets using a generated self-signed certificate
//! - Scripted login outcomes per connection: accept, reject, route, NTLM
//!   challenge, federated-auth token exchange, hang
//! - Scripted responses for SQL batches and RPC calls, including delays,
//!   hangs and ignored attention signals
//! - A log of everything the client sent
//!
//! ## Example
//!
//! ```rust,ignore
//! use tdswire_testing::{LoginBehavior, MockResponse, MockTdsServer};
//!
//! #[tokio::test]
//! async fn test_route_then_login() {
//!     let target = MockTdsServer::builder().build().await.unwrap();
//!     let gateway = MockTdsServer::builder()
//!         .with_login(LoginBehavior::Route {
//!             host: target.host(),
//!             port: target.port(),
//!         })
//!         .build()
//!         .await
//!         .unwrap();
//!     // Connect the client to gateway.addr()...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod login;
pub mod mock_server;
pub mod script;

pub use login::RecordedLogin;
pub use mock_server::{MockLog, MockServerBuilder, MockServerError, MockTdsServer, RecordedBatch, RecordedRpc};
pub use script::{LoginBehavior, MockResponse};
