//! # Client Handshake State Machine
//!
//! ```text
//! Disconnected --connect--> SendingConnectionRequest --Challenge--> SendingChallengeResponse
//!                                  |                                     |
//!                          Denied / timeout                   KeepAlive or Connection
//!                                  v                                     v
//!                            Disconnected(reason) <--timeout/Disconnect-- Connected
//! ```
//!
//! The client is sampled: the host calls [`Client::update`] with the current
//! time, sends whatever packet it returns, and feeds inbound datagrams to
//! [`Client::process_datagram`]. Nothing here touches a socket or a clock.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use tracing::{debug, info, instrument};

use crate::config::{ClientConfig, MAX_PAYLOAD_BYTES};
use crate::core::codec::PacketCodec;
use crate::core::packet::{ChallengePacket, ChallengeResponsePacket, Packet};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::token::ConnectToken;

#[cfg(feature = "insecure-connect")]
use crate::core::packet::InsecureConnectPacket;

/// Why a client ended up disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionRequestTimedOut,
    ChallengeResponseTimedOut,
    ConnectionDenied,
    KeepaliveTimedOut,
    DisconnectedByServer,
    DisconnectedByClient,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::ConnectionRequestTimedOut => "connection request timed out",
            DisconnectReason::ChallengeResponseTimedOut => "challenge response timed out",
            DisconnectReason::ConnectionDenied => "connection denied",
            DisconnectReason::KeepaliveTimedOut => "keepalive timed out",
            DisconnectReason::DisconnectedByServer => "disconnected by server",
            DisconnectReason::DisconnectedByClient => "disconnected by client",
        };
        f.write_str(text)
    }
}

/// Client handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Idle; carries the reason if a previous attempt or session ended
    Disconnected(Option<DisconnectReason>),
    SendingConnectionRequest,
    SendingChallengeResponse,
    #[cfg(feature = "insecure-connect")]
    SendingInsecureConnect,
    Connected,
}

/// Handshake client
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    state: ClientState,
    connect_token: Option<ConnectToken>,
    challenge: Option<Box<ChallengePacket>>,
    #[cfg(feature = "insecure-connect")]
    client_salt: u64,
    client_index: Option<usize>,
    time: f64,
    state_entered_at: f64,
    last_packet_sent: f64,
    last_packet_received: f64,
    received: VecDeque<Vec<u8>>,
    codec: PacketCodec,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected(None),
            connect_token: None,
            challenge: None,
            #[cfg(feature = "insecure-connect")]
            client_salt: 0,
            client_index: None,
            time: 0.0,
            state_entered_at: 0.0,
            last_packet_sent: f64::NEG_INFINITY,
            last_packet_received: 0.0,
            received: VecDeque::new(),
            codec: PacketCodec::new(),
        }
    }

    /// Begin a handshake with a connect token from the matchmaker.
    /// Any current session is abandoned without notifying the server.
    #[instrument(skip(self, token), fields(expire = token.expire_timestamp))]
    pub fn connect(&mut self, token: ConnectToken, time: f64) {
        self.reset(time);
        self.connect_token = Some(token);
        self.enter(ClientState::SendingConnectionRequest);
        debug!("client sending connection requests");
    }

    /// Begin a token-less handshake. Only servers with insecure connect enabled answer.
    #[cfg(feature = "insecure-connect")]
    pub fn insecure_connect(&mut self, client_salt: u64, time: f64) {
        self.reset(time);
        self.client_salt = client_salt;
        self.enter(ClientState::SendingInsecureConnect);
        tracing::warn!("client using insecure connect");
    }

    fn reset(&mut self, time: f64) {
        self.time = time;
        self.connect_token = None;
        self.challenge = None;
        self.client_index = None;
        self.last_packet_received = time;
        self.received.clear();
    }

    fn enter(&mut self, state: ClientState) {
        self.state = state;
        self.state_entered_at = self.time;
        // Handshake stages send on their first update
        self.last_packet_sent = f64::NEG_INFINITY;
    }

    fn disconnect_with(&mut self, reason: DisconnectReason) {
        info!(%reason, "client disconnected");
        self.state = ClientState::Disconnected(Some(reason));
        self.connect_token = None;
        self.challenge = None;
        self.client_index = None;
    }

    /// Advance timers to `time` and return the packet due for sending, if any
    pub fn update(&mut self, time: f64) -> Option<Packet> {
        self.time = time;
        let handshake_timeout = self.config.handshake_timeout.as_secs_f64();

        match self.state {
            ClientState::Disconnected(_) => None,
            ClientState::SendingConnectionRequest => {
                if time - self.state_entered_at >= handshake_timeout {
                    self.disconnect_with(DisconnectReason::ConnectionRequestTimedOut);
                    return None;
                }
                if !self.resend_due(self.config.resend_interval()) {
                    return None;
                }
                self.connect_token.as_ref().map(Packet::connection_request)
            }
            ClientState::SendingChallengeResponse => {
                if time - self.state_entered_at >= handshake_timeout {
                    self.disconnect_with(DisconnectReason::ChallengeResponseTimedOut);
                    return None;
                }
                if !self.resend_due(self.config.resend_interval()) {
                    return None;
                }
                self.challenge.as_deref().map(|challenge| {
                    Packet::ChallengeResponse(Box::new(ChallengeResponsePacket::echo(challenge)))
                })
            }
            #[cfg(feature = "insecure-connect")]
            ClientState::SendingInsecureConnect => {
                if time - self.state_entered_at >= handshake_timeout {
                    self.disconnect_with(DisconnectReason::ConnectionRequestTimedOut);
                    return None;
                }
                let client_salt = self.client_salt;
                self.resend_due(self.config.resend_interval())
                    .then(|| Packet::InsecureConnect(InsecureConnectPacket { client_salt }))
            }
            ClientState::Connected => {
                if time - self.last_packet_received >= self.config.keepalive_timeout.as_secs_f64() {
                    self.disconnect_with(DisconnectReason::KeepaliveTimedOut);
                    return None;
                }
                // Keepalives carry our slot, so wait until the server has told us it
                let index = self.client_index?;
                self.resend_due(self.config.keepalive_interval())
                    .then(|| Packet::keep_alive(index))
            }
        }
    }

    /// True (and the send time recorded) when `interval` has passed since the last send
    fn resend_due(&mut self, interval: f64) -> bool {
        if self.time - self.last_packet_sent >= interval {
            self.last_packet_sent = self.time;
            true
        } else {
            false
        }
    }

    /// Apply a decoded packet from the server. Packets that make no sense in
    /// the current state are dropped.
    pub fn process_packet(&mut self, packet: Packet) {
        let packet_type = packet.packet_type();
        match (self.state, packet) {
            (ClientState::SendingConnectionRequest, Packet::Challenge(challenge)) => {
                debug!("challenge received");
                self.challenge = Some(challenge);
                self.last_packet_received = self.time;
                self.enter(ClientState::SendingChallengeResponse);
            }
            (ClientState::SendingConnectionRequest, Packet::ConnectionDenied(_))
            | (ClientState::SendingChallengeResponse, Packet::ConnectionDenied(_)) => {
                self.disconnect_with(DisconnectReason::ConnectionDenied);
            }
            #[cfg(feature = "insecure-connect")]
            (ClientState::SendingInsecureConnect, Packet::ConnectionDenied(_)) => {
                self.disconnect_with(DisconnectReason::ConnectionDenied);
            }
            (ClientState::SendingChallengeResponse, Packet::KeepAlive(keep_alive)) => {
                self.establish(Some(keep_alive.client_index));
            }
            #[cfg(feature = "insecure-connect")]
            (ClientState::SendingInsecureConnect, Packet::KeepAlive(keep_alive)) => {
                self.establish(Some(keep_alive.client_index));
            }
            (ClientState::SendingChallengeResponse, Packet::Connection(connection)) => {
                self.establish(None);
                self.received.push_back(connection.payload);
            }
            (ClientState::Connected, Packet::KeepAlive(keep_alive)) => {
                self.last_packet_received = self.time;
                if self.client_index.is_none() {
                    self.client_index = Some(keep_alive.client_index);
                }
            }
            (ClientState::Connected, Packet::Connection(connection)) => {
                self.last_packet_received = self.time;
                self.received.push_back(connection.payload);
            }
            (ClientState::Connected, Packet::Disconnect(_)) => {
                self.disconnect_with(DisconnectReason::DisconnectedByServer);
            }
            (state, _) => {
                debug!(?state, packet = packet_type.name(), "ignoring packet");
            }
        }
    }

    fn establish(&mut self, client_index: Option<usize>) {
        info!(?client_index, "client connected");
        self.client_index = client_index;
        self.challenge = None;
        self.connect_token = None;
        self.last_packet_received = self.time;
        self.state = ClientState::Connected;
        self.state_entered_at = self.time;
        // Nothing to send until the keepalive interval elapses
        self.last_packet_sent = self.time;
    }

    /// Decode and apply a datagram; undecodable input is dropped silently
    pub fn process_datagram(&mut self, data: &[u8]) {
        match self.codec.read_packet(data) {
            Ok(packet) => self.process_packet(packet),
            Err(e) => debug!(error = %e, len = data.len(), "dropping undecodable datagram"),
        }
    }

    /// Wrap `payload` in a Connection packet for the server
    pub fn send_payload(&mut self, payload: Vec<u8>) -> Result<Packet> {
        if self.state != ClientState::Connected {
            return Err(match self.state {
                ClientState::Disconnected(Some(reason)) => ProtocolError::HandshakeFailed(reason),
                _ => ProtocolError::Custom(constants::ERR_CLIENT_NOT_CONNECTED.to_string()),
            });
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        self.last_packet_sent = self.time;
        Ok(Packet::connection(payload))
    }

    /// Next payload delivered by the server, oldest first
    pub fn receive_payload(&mut self) -> Option<Vec<u8>> {
        self.received.pop_front()
    }

    /// Leave the session. Returns a courtesy Disconnect if the server
    /// considers this client connected.
    pub fn disconnect(&mut self) -> Option<Packet> {
        let was_connected = self.state == ClientState::Connected;
        if !matches!(self.state, ClientState::Disconnected(_)) {
            self.disconnect_with(DisconnectReason::DisconnectedByClient);
        }
        was_connected.then(Packet::disconnect)
    }

    /// Encode a packet returned by this client for the wire
    pub fn encode(packet: Packet) -> Result<Bytes> {
        PacketCodec::write_packet(packet)
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Slot index assigned by the server, once a KeepAlive has named it
    pub fn client_index(&self) -> Option<usize> {
        self.client_index
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
