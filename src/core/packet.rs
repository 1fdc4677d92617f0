//! # Packet Catalogue
//!
//! The closed set of handshake packets. Each variant is a plain struct with a
//! single generic `serialize` routine; [`Packet`] is the tagged union the rest
//! of the crate passes around.
//!
//! ## Wire Tags
//! | Tag | Packet |
//! |-----|--------|
//! | 0 | ConnectionRequest |
//! | 1 | ConnectionDenied |
//! | 2 | Challenge |
//! | 3 | ChallengeResponse |
//! | 4 | KeepAlive |
//! | 5 | Disconnect |
//! | 6 | InsecureConnect (`insecure-connect` builds only) |
//! | 6 / 7 | Connection |

use crate::config::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, MAX_CLIENTS, MAX_PAYLOAD_BYTES, NONCE_BYTES,
};
use crate::core::stream::Stream;
use crate::error::Result;
use crate::protocol::token::{ChallengeToken, ConnectToken};

/// Wire tag of each packet variant, in tag order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest,
    ConnectionDenied,
    Challenge,
    ChallengeResponse,
    KeepAlive,
    Disconnect,
    #[cfg(feature = "insecure-connect")]
    InsecureConnect,
    Connection,
}

impl PacketType {
    /// Every packet type, indexed by wire tag
    pub const ALL: &'static [PacketType] = &[
        PacketType::ConnectionRequest,
        PacketType::ConnectionDenied,
        PacketType::Challenge,
        PacketType::ChallengeResponse,
        PacketType::KeepAlive,
        PacketType::Disconnect,
        #[cfg(feature = "insecure-connect")]
        PacketType::InsecureConnect,
        PacketType::Connection,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::ConnectionRequest => "CONNECTION_REQUEST",
            PacketType::ConnectionDenied => "CONNECTION_DENIED",
            PacketType::Challenge => "CHALLENGE",
            PacketType::ChallengeResponse => "CHALLENGE_RESPONSE",
            PacketType::KeepAlive => "KEEPALIVE",
            PacketType::Disconnect => "DISCONNECT",
            #[cfg(feature = "insecure-connect")]
            PacketType::InsecureConnect => "INSECURE_CONNECT",
            PacketType::Connection => "CONNECTION",
        }
    }
}

/// Number of packet types on the wire
pub const NUM_PACKET_TYPES: usize = PacketType::ALL.len();

/// Client's proof of possession of a matchmaker-issued connect token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestPacket {
    /// Absolute expiry, unix seconds
    pub expire_timestamp: u64,
    /// Encrypted connect token generated by the matchmaker
    pub token_data: [u8; CONNECT_TOKEN_BYTES],
    /// Nonce required to decrypt the connect token on the server
    pub token_nonce: [u8; NONCE_BYTES],
}

impl Default for ConnectionRequestPacket {
    fn default() -> Self {
        Self {
            expire_timestamp: 0,
            token_data: [0; CONNECT_TOKEN_BYTES],
            token_nonce: [0; NONCE_BYTES],
        }
    }
}

impl ConnectionRequestPacket {
    pub fn from_token(token: &ConnectToken) -> Self {
        Self {
            expire_timestamp: token.expire_timestamp,
            token_data: token.data,
            token_nonce: token.nonce,
        }
    }

    pub fn to_token(&self) -> ConnectToken {
        ConnectToken {
            expire_timestamp: self.expire_timestamp,
            data: self.token_data,
            nonce: self.token_nonce,
        }
    }

    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        stream.serialize_u64(&mut self.expire_timestamp)?;
        stream.serialize_bytes(&mut self.token_data)?;
        stream.serialize_bytes(&mut self.token_nonce)
    }
}

/// Server refuses the request; deliberately carries no reason
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionDeniedPacket;

impl ConnectionDeniedPacket {
    pub fn serialize<S: Stream>(&mut self, _stream: &mut S) -> Result<()> {
        Ok(())
    }
}

/// Encrypted challenge token, opaque to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePacket {
    pub token_data: [u8; CHALLENGE_TOKEN_BYTES],
    pub token_nonce: [u8; NONCE_BYTES],
}

impl Default for ChallengePacket {
    fn default() -> Self {
        Self {
            token_data: [0; CHALLENGE_TOKEN_BYTES],
            token_nonce: [0; NONCE_BYTES],
        }
    }
}

impl ChallengePacket {
    pub fn from_token(token: &ChallengeToken) -> Self {
        Self {
            token_data: token.data,
            token_nonce: token.nonce,
        }
    }

    pub fn to_token(&self) -> ChallengeToken {
        ChallengeToken {
            data: self.token_data,
            nonce: self.token_nonce,
        }
    }

    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        serialize_challenge(stream, &mut self.token_data, &mut self.token_nonce)
    }
}

/// The client's verbatim echo of a [`ChallengePacket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponsePacket {
    pub token_data: [u8; CHALLENGE_TOKEN_BYTES],
    pub token_nonce: [u8; NONCE_BYTES],
}

impl Default for ChallengeResponsePacket {
    fn default() -> Self {
        Self {
            token_data: [0; CHALLENGE_TOKEN_BYTES],
            token_nonce: [0; NONCE_BYTES],
        }
    }
}

impl ChallengeResponsePacket {
    pub fn echo(challenge: &ChallengePacket) -> Self {
        Self {
            token_data: challenge.token_data,
            token_nonce: challenge.token_nonce,
        }
    }

    pub fn to_token(&self) -> ChallengeToken {
        ChallengeToken {
            data: self.token_data,
            nonce: self.token_nonce,
        }
    }

    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        serialize_challenge(stream, &mut self.token_data, &mut self.token_nonce)
    }
}

fn serialize_challenge<S: Stream>(
    stream: &mut S,
    data: &mut [u8; CHALLENGE_TOKEN_BYTES],
    nonce: &mut [u8; NONCE_BYTES],
) -> Result<()> {
    stream.serialize_bytes(data)?;
    stream.serialize_bytes(nonce)
}

/// Liveness ping naming the server-assigned slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAlivePacket {
    pub client_index: usize,
}

impl KeepAlivePacket {
    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        stream.serialize_index(&mut self.client_index, MAX_CLIENTS)
    }
}

/// Courtesy close notification; better than a timeout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectPacket;

impl DisconnectPacket {
    pub fn serialize<S: Stream>(&mut self, _stream: &mut S) -> Result<()> {
        Ok(())
    }
}

/// Development-only request that skips connect tokens entirely
#[cfg(feature = "insecure-connect")]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsecureConnectPacket {
    pub client_salt: u64,
}

#[cfg(feature = "insecure-connect")]
impl InsecureConnectPacket {
    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        stream.serialize_u64(&mut self.client_salt)
    }
}

/// Opaque in-session payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionPacket {
    pub payload: Vec<u8>,
}

impl ConnectionPacket {
    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        let mut len = self.payload.len();
        stream.serialize_index(&mut len, MAX_PAYLOAD_BYTES + 1)?;
        if S::IS_READING {
            self.payload.resize(len, 0);
        }
        stream.serialize_bytes(&mut self.payload)
    }
}

/// Tagged union over the packet catalogue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest(Box<ConnectionRequestPacket>),
    ConnectionDenied(ConnectionDeniedPacket),
    Challenge(Box<ChallengePacket>),
    ChallengeResponse(Box<ChallengeResponsePacket>),
    KeepAlive(KeepAlivePacket),
    Disconnect(DisconnectPacket),
    #[cfg(feature = "insecure-connect")]
    InsecureConnect(InsecureConnectPacket),
    Connection(ConnectionPacket),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnectionRequest(_) => PacketType::ConnectionRequest,
            Packet::ConnectionDenied(_) => PacketType::ConnectionDenied,
            Packet::Challenge(_) => PacketType::Challenge,
            Packet::ChallengeResponse(_) => PacketType::ChallengeResponse,
            Packet::KeepAlive(_) => PacketType::KeepAlive,
            Packet::Disconnect(_) => PacketType::Disconnect,
            #[cfg(feature = "insecure-connect")]
            Packet::InsecureConnect(_) => PacketType::InsecureConnect,
            Packet::Connection(_) => PacketType::Connection,
        }
    }

    /// Serialize the variant's fields (not its tag) against `stream`
    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<()> {
        match self {
            Packet::ConnectionRequest(p) => p.serialize(stream),
            Packet::ConnectionDenied(p) => p.serialize(stream),
            Packet::Challenge(p) => p.serialize(stream),
            Packet::ChallengeResponse(p) => p.serialize(stream),
            Packet::KeepAlive(p) => p.serialize(stream),
            Packet::Disconnect(p) => p.serialize(stream),
            #[cfg(feature = "insecure-connect")]
            Packet::InsecureConnect(p) => p.serialize(stream),
            Packet::Connection(p) => p.serialize(stream),
        }
    }

    pub fn connection_request(token: &ConnectToken) -> Self {
        Packet::ConnectionRequest(Box::new(ConnectionRequestPacket::from_token(token)))
    }

    pub fn challenge(token: &ChallengeToken) -> Self {
        Packet::Challenge(Box::new(ChallengePacket::from_token(token)))
    }

    pub fn keep_alive(client_index: usize) -> Self {
        Packet::KeepAlive(KeepAlivePacket { client_index })
    }

    pub fn denied() -> Self {
        Packet::ConnectionDenied(ConnectionDeniedPacket)
    }

    pub fn disconnect() -> Self {
        Packet::Disconnect(DisconnectPacket)
    }

    pub fn connection(payload: Vec<u8>) -> Self {
        Packet::Connection(ConnectionPacket { payload })
    }
}
