//! # Handshake Protocol
//!
//! Client and server state machines plus the token boundary they share.
//!
//! ## Flow
//! ```text
//! client                                   server
//!   | -- ConnectionRequest(connect token) -> |  expiry, replay, decrypt, capacity
//!   | <- Challenge(challenge token) -------- |  pending (addr, nonce)
//!   | -- ChallengeResponse(echo) ----------> |  byte-exact match
//!   | <- KeepAlive(client_index) ----------- |  slot assigned
//!   | <- Connection / KeepAlive -----------> |  session
//! ```

pub mod client;
pub mod server;
pub mod token;

pub use client::{Client, ClientState, DisconnectReason};
pub use server::{Server, ServerEvent, SlotState};
pub use token::{ChaChaTokenCodec, ChallengeToken, ClientPrivateInfo, ConnectToken, TokenCodec};

#[cfg(test)]
mod tests;
