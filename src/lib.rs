//! # Handshake Protocol
//!
//! Connection establishment for real-time UDP client/server games.
//!
//! A client proves it holds an encrypted connect token issued by a
//! matchmaker, echoes a server challenge to prove it owns its source address,
//! and is then assigned one of a fixed number of session slots. Every inbound
//! datagram crosses a bit-exact, fail-closed decoder first.
//!
//! ## Layout
//! - [`core`]: bit streams, packet catalogue, tag registry, datagram codec
//! - [`protocol`]: token boundary, client and server state machines
//! - [`transport`]: Tokio UDP driver
//! - [`utils`]: replay cache, metrics, logging, clock
//! - [`config`]: wire constants and runtime configuration
//! - [`error`]: [`ProtocolError`] and the reply policy
//!
//! ## Example
//! ```no_run
//! use handshake_protocol::config::{ServerConfig, USER_DATA_BYTES};
//! use handshake_protocol::protocol::token::{generate_connect_token, generate_key, ChaChaTokenCodec};
//! use handshake_protocol::transport::udp::start_server;
//! use handshake_protocol::utils::time::expire_after;
//!
//! # async fn run() -> handshake_protocol::Result<()> {
//! let key = generate_key()?;
//! // Matchmaker side
//! let _token = generate_connect_token(&key, 42, &[0; USER_DATA_BYTES], expire_after(30)?)?;
//! // Server side
//! start_server(ServerConfig::default(), ChaChaTokenCodec::new(key)?).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
