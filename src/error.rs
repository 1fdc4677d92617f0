//! # Error Types
//!
//! Error handling for the handshake protocol.
//!
//! Every error in this layer is recoverable: it is scoped to one packet or one
//! slot and never takes the process down.
//!
//! ## Error Categories
//! - **Wire Errors**: Invalid packet type, truncated or over-length buffers, version mismatch
//! - **Token Errors**: Expired, invalid or replayed connect tokens
//! - **Handshake Errors**: Challenge mismatch, exhausted slots, timeouts
//! - **Ambient Errors**: I/O, configuration, cryptographic failures
//!
//! ## Reply Policy
//! Only errors raised *after* a sender has proved possession of a readable
//! token warrant an explicit `ConnectionDenied` reply. Everything else is
//! dropped without a reply so that an unauthenticated sender cannot tell an
//! "almost right" packet from a wrong one. See [`ProtocolError::warrants_denial`].
//!
//! ## Example Usage
//! ```rust
//! use handshake_protocol::error::{ProtocolError, Result};
//! use tracing::{debug, info};
//!
//! fn check_tag(tag: u32) -> Result<u32> {
//!     if tag > 7 {
//!         return Err(ProtocolError::InvalidPacketType(tag));
//!     }
//!     Ok(tag)
//! }
//!
//! match check_tag(42) {
//!     Ok(tag) => info!(tag, "valid tag"),
//!     Err(e) if !e.warrants_denial() => debug!(error = %e, "dropping silently"),
//!     Err(e) => info!(error = %e, "denying"),
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::protocol::client::DisconnectReason;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Wire validation errors
    pub const ERR_TRUNCATED: &str = "Buffer ended before all fields were read";
    pub const ERR_TRAILING_BYTES: &str = "Unexpected bytes after end of packet";
    pub const ERR_NONZERO_PADDING: &str = "Non-zero alignment padding";
    pub const ERR_EMPTY_DATAGRAM: &str = "Empty datagram";

    /// Clock errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";

    /// Token errors
    pub const ERR_TOKEN_AUTH: &str = "Connect token failed authentication";
    pub const ERR_TOKEN_SEAL: &str = "Failed to seal token";
    pub const ERR_RANDOM_SOURCE: &str = "Operating system random source unavailable";

    /// Session errors
    pub const ERR_CLIENT_NOT_CONNECTED: &str = "Client is not connected";

    /// Configuration errors
    pub const ERR_MAX_CLIENTS: &str = "max_clients must be within 1..=MAX_CLIENTS";
    pub const ERR_INSECURE_UNAVAILABLE: &str =
        "insecure_connect_enabled requires the `insecure-connect` cargo feature";
}

/// Primary error type for all handshake operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u32),

    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Value {value} outside of [{min}, {max}]")]
    ValueOutOfRange { value: u64, min: u64, max: u64 },

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Connect token expired at {0}")]
    TokenExpired(u64),

    #[error("Connect token invalid")]
    TokenInvalid,

    #[error("Connect token nonce already used")]
    TokenReplayed,

    #[error("Challenge response does not match the issued challenge")]
    ChallengeMismatch,

    #[error("All client slots are in use")]
    SlotsExhausted,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Keepalive timed out")]
    KeepaliveTimeout,

    #[error("Client slot {0} is not connected")]
    ClientNotConnected(usize),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(DisconnectReason),

    #[error("Encryption failed: {0}")]
    EncryptionFailure(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether the server should answer this failure with `ConnectionDenied`.
    ///
    /// True only for rejections of a sender that produced a well-formed,
    /// non-replayed request: expired or invalid tokens and a full server.
    pub fn warrants_denial(&self) -> bool {
        matches!(
            self,
            ProtocolError::TokenExpired(_) | ProtocolError::TokenInvalid | ProtocolError::SlotsExhausted
        )
    }

    /// Whether the failure came from decoding an untrusted buffer.
    pub fn is_wire_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPacketType(_)
                | ProtocolError::MalformedPacket(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::ValueOutOfRange { .. }
                | ProtocolError::OversizedPacket(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_authenticated_rejections_are_denied() {
        assert!(ProtocolError::TokenExpired(10).warrants_denial());
        assert!(ProtocolError::TokenInvalid.warrants_denial());
        assert!(ProtocolError::SlotsExhausted.warrants_denial());

        assert!(!ProtocolError::TokenReplayed.warrants_denial());
        assert!(!ProtocolError::ChallengeMismatch.warrants_denial());
        assert!(!ProtocolError::InvalidPacketType(99).warrants_denial());
        assert!(!ProtocolError::MalformedPacket(constants::ERR_TRUNCATED).warrants_denial());
    }

    #[test]
    fn test_wire_error_classification() {
        assert!(ProtocolError::InvalidPacketType(12).is_wire_error());
        assert!(ProtocolError::UnsupportedVersion(9).is_wire_error());
        assert!(!ProtocolError::TokenInvalid.is_wire_error());
    }
}
