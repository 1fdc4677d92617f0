//! # Server Handshake State Machine
//!
//! The server owns a fixed arena of `max_clients` session slots, a set of
//! pending handshakes and the replay cache. Every inbound packet is run
//! through [`Server::process_packet`], which returns the reply (if any) to
//! send back to the sender.
//!
//! ## Reply Policy
//! Only rejections of a well-formed, non-replayed request earn a
//! `ConnectionDenied`: expired tokens, tokens that fail authentication, and
//! requests that arrive while the server is full. Everything else is dropped
//! without a reply so that spoofed traffic is never amplified.
//!
//! ## Capacity
//! Pending handshakes count against `max_clients` together with connected
//! sessions. A completed handshake takes the lowest free slot index.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::config::{ServerConfig, MAX_PAYLOAD_BYTES, NONCE_BYTES};
use crate::core::codec::PacketCodec;
use crate::core::packet::{ChallengeResponsePacket, ConnectionRequestPacket, Packet};
use crate::error::{ProtocolError, Result};
use crate::protocol::client::DisconnectReason;
use crate::protocol::token::{ChallengeToken, TokenCodec};
use crate::utils::metrics::Metrics;
use crate::utils::replay_cache::ReplayCache;
use crate::utils::time::unix_timestamp;

#[cfg(feature = "insecure-connect")]
use crate::core::packet::InsecureConnectPacket;

/// Where a sender stands with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Challenge issued, waiting for the echo
    AwaitingChallengeResponse,
    Connected,
}

/// Session lifecycle notifications for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        client_index: usize,
        address: SocketAddr,
        client_id: u64,
    },
    ClientDisconnected {
        client_index: usize,
        address: SocketAddr,
        reason: DisconnectReason,
    },
    PayloadReceived {
        client_index: usize,
        payload: Vec<u8>,
    },
}

/// Pending handshakes are keyed by sender and connect token nonce
type PendingKey = (SocketAddr, [u8; NONCE_BYTES]);

#[derive(Debug)]
struct PendingConnection {
    client_id: u64,
    challenge: ChallengeToken,
    created_at: f64,
}

#[derive(Debug)]
struct ConnectedSlot {
    address: SocketAddr,
    client_id: u64,
    last_packet_received: f64,
    last_packet_sent: f64,
}

/// Handshake server over a [`TokenCodec`]
#[derive(Debug)]
pub struct Server<T: TokenCodec> {
    config: ServerConfig,
    tokens: T,
    replay_cache: ReplayCache,
    pending: HashMap<PendingKey, PendingConnection>,
    slots: Vec<Option<ConnectedSlot>>,
    free_list: BTreeSet<usize>,
    addresses: HashMap<SocketAddr, usize>,
    events: VecDeque<ServerEvent>,
    codec: PacketCodec,
    metrics: Arc<Metrics>,
    time: f64,
}

impl<T: TokenCodec> Server<T> {
    /// Create a server. Fails if `config` does not validate.
    pub fn new(config: ServerConfig, tokens: T) -> Result<Self> {
        Self::with_metrics(config, tokens, Arc::new(Metrics::new()))
    }

    /// Create a server that records into shared `metrics`
    pub fn with_metrics(config: ServerConfig, tokens: T, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate_strict()?;

        let max_clients = config.max_clients;
        info!(max_clients, address = %config.address, "handshake server created");
        Ok(Self {
            replay_cache: ReplayCache::with_capacity(config.replay_cache_capacity),
            pending: HashMap::with_capacity(max_clients),
            slots: (0..max_clients).map(|_| None).collect(),
            free_list: (0..max_clients).collect(),
            addresses: HashMap::with_capacity(max_clients),
            events: VecDeque::new(),
            codec: PacketCodec::with_metrics(Arc::clone(&metrics)),
            metrics,
            time: 0.0,
            config,
            tokens,
        })
    }

    /// Decode a datagram from `from`, apply it, and return the encoded reply
    pub fn receive_datagram(&mut self, from: SocketAddr, data: &[u8]) -> Option<Bytes> {
        self.metrics.packet_received(data.len() as u64);
        let packet = match self.codec.read_packet(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%from, error = %e, "dropping undecodable datagram");
                self.codec.record_drop(&e);
                return None;
            }
        };

        let reply = self.process_packet(from, packet)?;
        self.encode(reply)
    }

    /// Encode an outbound packet, counting it as sent
    pub fn encode(&self, packet: Packet) -> Option<Bytes> {
        match PacketCodec::write_packet(packet) {
            Ok(bytes) => {
                self.metrics.packet_sent(bytes.len() as u64);
                Some(bytes)
            }
            Err(e) => {
                warn!(error = %e, "failed to encode outbound packet");
                None
            }
        }
    }

    /// Apply a decoded packet from `from` and return the reply, if one is warranted
    pub fn process_packet(&mut self, from: SocketAddr, packet: Packet) -> Option<Packet> {
        let result = match packet {
            Packet::ConnectionRequest(request) => self.process_connection_request(from, &request),
            Packet::ChallengeResponse(response) => self.process_challenge_response(from, &response),
            Packet::KeepAlive(_) => {
                self.touch(from);
                Ok(None)
            }
            Packet::Connection(connection) => {
                if let Some(client_index) = self.touch(from) {
                    self.events.push_back(ServerEvent::PayloadReceived {
                        client_index,
                        payload: connection.payload,
                    });
                }
                Ok(None)
            }
            Packet::Disconnect(_) => {
                if let Some(&client_index) = self.addresses.get(&from) {
                    self.free_slot(client_index, DisconnectReason::DisconnectedByClient);
                }
                Ok(None)
            }
            #[cfg(feature = "insecure-connect")]
            Packet::InsecureConnect(request) => self.process_insecure_connect(from, &request),
            Packet::Challenge(_) | Packet::ConnectionDenied(_) => {
                debug!(%from, "ignoring client-bound packet");
                Ok(None)
            }
        };

        match result {
            Ok(reply) => reply,
            Err(e) if e.warrants_denial() => {
                debug!(%from, error = %e, "denying connection");
                self.metrics.connection_denied();
                Some(Packet::denied())
            }
            Err(e) => {
                debug!(%from, error = %e, "dropping packet");
                None
            }
        }
    }

    #[instrument(level = "debug", skip(self, request), fields(expire = request.expire_timestamp))]
    fn process_connection_request(
        &mut self,
        from: SocketAddr,
        request: &ConnectionRequestPacket,
    ) -> Result<Option<Packet>> {
        self.metrics.connection_request();
        let now = unix_timestamp()?;

        if request.expire_timestamp < now {
            return Err(ProtocolError::TokenExpired(request.expire_timestamp));
        }

        // A resend of a request we already answered gets the same challenge
        if let Some(pending) = self.pending.get(&(from, request.token_nonce)) {
            return Ok(Some(Packet::challenge(&pending.challenge)));
        }

        if self.addresses.contains_key(&from) {
            debug!("sender already connected");
            return Ok(None);
        }

        if self.replay_cache.contains(&request.token_nonce, now) {
            self.metrics.replay_detected();
            return Err(ProtocolError::TokenReplayed);
        }

        let info = self.tokens.decrypt_connect_token(&request.to_token(), now)?;
        // Only authenticated nonces occupy the cache
        self.replay_cache
            .record_until(&request.token_nonce, request.expire_timestamp);

        if !self.has_capacity() {
            return Err(ProtocolError::SlotsExhausted);
        }

        let challenge = self.tokens.issue_challenge_token(&info)?;
        self.metrics.challenge_issued();
        debug!(client_id = info.client_id, "challenge issued");

        let reply = Packet::challenge(&challenge);
        self.pending.insert(
            (from, request.token_nonce),
            PendingConnection {
                client_id: info.client_id,
                challenge,
                created_at: self.time,
            },
        );
        Ok(Some(reply))
    }

    fn process_challenge_response(
        &mut self,
        from: SocketAddr,
        response: &ChallengeResponsePacket,
    ) -> Result<Option<Packet>> {
        // Repeat of a response we already accepted; the KeepAlive was lost
        if let Some(&client_index) = self.addresses.get(&from) {
            return Ok(Some(Packet::keep_alive(client_index)));
        }

        let received = response.to_token();
        let matched = self
            .pending
            .iter()
            .find(|((address, _), pending)| {
                *address == from
                    && self
                        .tokens
                        .verify_challenge_response(&pending.challenge, &received)
            })
            .map(|(key, _)| *key);

        let Some(key) = matched else {
            self.metrics.challenge_mismatch();
            warn!(%from, "challenge response does not match any issued challenge");
            return Err(ProtocolError::ChallengeMismatch);
        };

        let client_id = self
            .pending
            .remove(&key)
            .map(|pending| pending.client_id)
            .unwrap_or_default();
        let client_index = self.connect_client(from, client_id)?;
        Ok(Some(Packet::keep_alive(client_index)))
    }

    #[cfg(feature = "insecure-connect")]
    fn process_insecure_connect(
        &mut self,
        from: SocketAddr,
        request: &InsecureConnectPacket,
    ) -> Result<Option<Packet>> {
        if !self.config.insecure_connect_enabled {
            debug!(%from, "insecure connect disabled");
            return Ok(None);
        }
        if let Some(&client_index) = self.addresses.get(&from) {
            return Ok(Some(Packet::keep_alive(client_index)));
        }
        if !self.has_capacity() {
            return Err(ProtocolError::SlotsExhausted);
        }

        warn!(%from, "accepting insecure connect");
        let client_index = self.connect_client(from, request.client_salt)?;
        Ok(Some(Packet::keep_alive(client_index)))
    }

    fn has_capacity(&self) -> bool {
        self.addresses.len() + self.pending.len() < self.config.max_clients
    }

    fn connect_client(&mut self, address: SocketAddr, client_id: u64) -> Result<usize> {
        let client_index = self
            .free_list
            .pop_first()
            .ok_or(ProtocolError::SlotsExhausted)?;

        self.slots[client_index] = Some(ConnectedSlot {
            address,
            client_id,
            last_packet_received: self.time,
            last_packet_sent: self.time,
        });
        self.addresses.insert(address, client_index);
        self.pending.retain(|(pending_address, _), _| *pending_address != address);

        self.metrics.connection_established();
        info!(client_index, client_id, %address, "client connected");
        self.events.push_back(ServerEvent::ClientConnected {
            client_index,
            address,
            client_id,
        });
        Ok(client_index)
    }

    fn free_slot(&mut self, client_index: usize, reason: DisconnectReason) -> Option<SocketAddr> {
        let slot = self.slots.get_mut(client_index)?.take()?;
        self.addresses.remove(&slot.address);
        self.free_list.insert(client_index);

        self.metrics.connection_closed();
        info!(client_index, address = %slot.address, %reason, "client disconnected");
        self.events.push_back(ServerEvent::ClientDisconnected {
            client_index,
            address: slot.address,
            reason,
        });
        Some(slot.address)
    }

    /// Record traffic from a connected sender; returns its slot index
    fn touch(&mut self, from: SocketAddr) -> Option<usize> {
        let client_index = *self.addresses.get(&from)?;
        if let Some(slot) = self.slots[client_index].as_mut() {
            slot.last_packet_received = self.time;
        }
        Some(client_index)
    }

    /// Advance to `time`: expire stale handshakes and silent clients, and
    /// return the keepalives now due
    pub fn update(&mut self, time: f64) -> Vec<(SocketAddr, Packet)> {
        self.time = time;

        let handshake_timeout = self.config.handshake_timeout.as_secs_f64();
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| time - pending.created_at < handshake_timeout);
        for _ in self.pending.len()..before {
            self.metrics.handshake_timeout();
        }
        if before > self.pending.len() {
            debug!(expired = before - self.pending.len(), "pending handshakes timed out");
        }

        let keepalive_timeout = self.config.keepalive_timeout.as_secs_f64();
        let keepalive_interval = self.config.keepalive_interval();
        let mut outgoing = Vec::new();

        for client_index in 0..self.slots.len() {
            let Some(slot) = self.slots[client_index].as_mut() else {
                continue;
            };
            if time - slot.last_packet_received >= keepalive_timeout {
                self.metrics.keepalive_timeout();
                self.free_slot(client_index, DisconnectReason::KeepaliveTimedOut);
            } else if time - slot.last_packet_sent >= keepalive_interval {
                slot.last_packet_sent = time;
                outgoing.push((slot.address, Packet::keep_alive(client_index)));
            }
        }
        outgoing
    }

    /// Wrap `payload` for the client in `client_index`
    pub fn send_payload(
        &mut self,
        client_index: usize,
        payload: Vec<u8>,
    ) -> Result<(SocketAddr, Packet)> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ProtocolError::OversizedPacket(payload.len()));
        }
        let slot = self
            .slots
            .get_mut(client_index)
            .and_then(Option::as_mut)
            .ok_or(ProtocolError::ClientNotConnected(client_index))?;
        slot.last_packet_sent = self.time;
        Ok((slot.address, Packet::connection(payload)))
    }

    /// Drop the client in `client_index`, returning a courtesy Disconnect for it
    pub fn disconnect_client(&mut self, client_index: usize) -> Result<(SocketAddr, Packet)> {
        let address = self
            .free_slot(client_index, DisconnectReason::DisconnectedByServer)
            .ok_or(ProtocolError::ClientNotConnected(client_index))?;
        Ok((address, Packet::disconnect()))
    }

    /// Drop every client and abandon pending handshakes
    pub fn disconnect_all(&mut self) -> Vec<(SocketAddr, Packet)> {
        self.pending.clear();
        (0..self.slots.len())
            .filter_map(|client_index| self.disconnect_client(client_index).ok())
            .collect()
    }

    /// Next session event, oldest first
    pub fn poll_event(&mut self) -> Option<ServerEvent> {
        self.events.pop_front()
    }

    pub fn num_connected_clients(&self) -> usize {
        self.addresses.len()
    }

    /// Handshakes waiting on a challenge response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Where `address` stands, if the server knows it at all
    pub fn slot_state(&self, address: SocketAddr) -> Option<SlotState> {
        if self.addresses.contains_key(&address) {
            Some(SlotState::Connected)
        } else if self.pending.keys().any(|(pending, _)| *pending == address) {
            Some(SlotState::AwaitingChallengeResponse)
        } else {
            None
        }
    }

    pub fn is_client_connected(&self, client_index: usize) -> bool {
        matches!(self.slots.get(client_index), Some(Some(_)))
    }

    pub fn client_index(&self, address: SocketAddr) -> Option<usize> {
        self.addresses.get(&address).copied()
    }

    pub fn client_address(&self, client_index: usize) -> Option<SocketAddr> {
        self.slots.get(client_index)?.as_ref().map(|slot| slot.address)
    }

    pub fn client_id(&self, client_index: usize) -> Option<u64> {
        self.slots.get(client_index)?.as_ref().map(|slot| slot.client_id)
    }

    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn replay_cache(&self) -> &ReplayCache {
        &self.replay_cache
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::{KEY_BYTES, USER_DATA_BYTES};
    use crate::core::packet::PacketType;
    use crate::protocol::token::{generate_connect_token, ChaChaTokenCodec, ConnectToken};
    use crate::utils::time::expire_after;

    const KEY: [u8; KEY_BYTES] = [0x11; KEY_BYTES];

    fn server(max_clients: usize) -> Server<ChaChaTokenCodec> {
        let config = ServerConfig {
            max_clients,
            ..ServerConfig::default()
        };
        Server::new(config, ChaChaTokenCodec::new(KEY).unwrap()).unwrap()
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn token(client_id: u64) -> ConnectToken {
        generate_connect_token(&KEY, client_id, &[0; USER_DATA_BYTES], expire_after(60).unwrap())
            .unwrap()
    }

    fn echo(reply: Option<Packet>) -> Packet {
        match reply {
            Some(Packet::Challenge(challenge)) => {
                Packet::ChallengeResponse(Box::new(ChallengeResponsePacket::echo(&challenge)))
            }
            other => panic!("expected a challenge, got {other:?}"),
        }
    }

    fn connect(server: &mut Server<ChaChaTokenCodec>, from: SocketAddr, client_id: u64) -> usize {
        let challenge = server.process_packet(from, Packet::connection_request(&token(client_id)));
        match server.process_packet(from, echo(challenge)) {
            Some(Packet::KeepAlive(k)) => k.client_index,
            other => panic!("expected a keepalive, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ServerConfig {
            max_clients: 0,
            ..ServerConfig::default()
        };
        assert!(Server::new(config, ChaChaTokenCodec::new(KEY).unwrap()).is_err());
    }

    #[test]
    fn test_lowest_free_index_is_assigned() {
        let mut server = server(4);
        assert_eq!(connect(&mut server, addr(1), 1), 0);
        assert_eq!(connect(&mut server, addr(2), 2), 1);
        assert_eq!(connect(&mut server, addr(3), 3), 2);

        server.disconnect_client(1).unwrap();
        assert_eq!(connect(&mut server, addr(4), 4), 1);
        assert_eq!(server.client_id(1), Some(4));
    }

    #[test]
    fn test_connected_events() {
        let mut server = server(4);
        let index = connect(&mut server, addr(9), 99);
        assert_eq!(
            server.poll_event(),
            Some(ServerEvent::ClientConnected {
                client_index: index,
                address: addr(9),
                client_id: 99,
            })
        );
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_pending_counts_against_capacity() {
        let mut server = server(1);
        let first = server.process_packet(addr(1), Packet::connection_request(&token(1)));
        assert!(matches!(first, Some(Packet::Challenge(_))));

        let second = server.process_packet(addr(2), Packet::connection_request(&token(2)));
        assert!(matches!(second, Some(Packet::ConnectionDenied(_))));
        assert_eq!(server.pending_count(), 1);
    }

    #[test]
    fn test_pending_expires() {
        let mut server = server(1);
        server.process_packet(addr(1), Packet::connection_request(&token(1)));
        assert_eq!(
            server.slot_state(addr(1)),
            Some(SlotState::AwaitingChallengeResponse)
        );

        server.update(4.9);
        assert_eq!(server.pending_count(), 1);
        server.update(5.0);
        assert_eq!(server.pending_count(), 0);
        assert_eq!(server.slot_state(addr(1)), None);
        assert_eq!(server.metrics().snapshot().handshake_timeouts, 1);

        // Capacity is available again
        let reply = server.process_packet(addr(2), Packet::connection_request(&token(2)));
        assert!(matches!(reply, Some(Packet::Challenge(_))));
    }

    #[test]
    fn test_keepalive_timeout_frees_slot() {
        let mut server = server(2);
        let index = connect(&mut server, addr(1), 1);
        server.poll_event();

        let outgoing = server.update(1.0);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].0, addr(1));
        assert_eq!(outgoing[0].1.packet_type(), PacketType::KeepAlive);

        server.update(5.0);
        assert!(!server.is_client_connected(index));
        assert_eq!(
            server.poll_event(),
            Some(ServerEvent::ClientDisconnected {
                client_index: index,
                address: addr(1),
                reason: DisconnectReason::KeepaliveTimedOut,
            })
        );
    }

    #[test]
    fn test_traffic_keeps_client_alive() {
        let mut server = server(2);
        let index = connect(&mut server, addr(1), 1);
        server.update(4.0);
        server.process_packet(addr(1), Packet::keep_alive(index));
        server.update(8.0);
        assert!(server.is_client_connected(index));
    }

    #[test]
    fn test_client_disconnect_frees_slot() {
        let mut server = server(2);
        let index = connect(&mut server, addr(1), 1);
        assert!(server.process_packet(addr(1), Packet::disconnect()).is_none());
        assert!(!server.is_client_connected(index));
        assert_eq!(server.num_connected_clients(), 0);
        assert_eq!(server.metrics().snapshot().connections_active, 0);
    }

    #[test]
    fn test_payload_events() {
        let mut server = server(2);
        let index = connect(&mut server, addr(1), 1);
        server.poll_event();

        server.process_packet(addr(1), Packet::connection(vec![1, 2, 3]));
        assert_eq!(
            server.poll_event(),
            Some(ServerEvent::PayloadReceived {
                client_index: index,
                payload: vec![1, 2, 3],
            })
        );

        // Payloads from strangers are ignored
        server.process_packet(addr(7), Packet::connection(vec![4]));
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_send_payload() {
        let mut server = server(2);
        let index = connect(&mut server, addr(1), 1);

        let (to, packet) = server.send_payload(index, vec![5; 10]).unwrap();
        assert_eq!(to, addr(1));
        assert_eq!(packet, Packet::connection(vec![5; 10]));

        assert!(matches!(
            server.send_payload(1, vec![]),
            Err(ProtocolError::ClientNotConnected(1))
        ));
        assert!(matches!(
            server.send_payload(index, vec![0; MAX_PAYLOAD_BYTES + 1]),
            Err(ProtocolError::OversizedPacket(_))
        ));
    }

    #[test]
    fn test_disconnect_all() {
        let mut server = server(4);
        connect(&mut server, addr(1), 1);
        connect(&mut server, addr(2), 2);
        server.process_packet(addr(3), Packet::connection_request(&token(3)));

        let farewells = server.disconnect_all();
        assert_eq!(farewells.len(), 2);
        assert!(farewells
            .iter()
            .all(|(_, p)| p.packet_type() == PacketType::Disconnect));
        assert_eq!(server.num_connected_clients(), 0);
        assert_eq!(server.pending_count(), 0);
    }

    #[test]
    fn test_lost_keepalive_is_resent() {
        let mut server = server(2);
        let from = addr(1);
        let challenge = server.process_packet(from, Packet::connection_request(&token(1)));
        let response = echo(challenge);

        let first = server.process_packet(from, response.clone());
        let again = server.process_packet(from, response);
        assert_eq!(first, again);
        assert_eq!(server.num_connected_clients(), 1);
    }

    #[test]
    fn test_client_bound_packets_are_ignored() {
        let mut server = server(2);
        assert!(server.process_packet(addr(1), Packet::denied()).is_none());
        assert!(server.process_packet(addr(1), Packet::keep_alive(0)).is_none());
        assert_eq!(server.slot_state(addr(1)), None);
    }

    #[test]
    fn test_receive_datagram_drops_garbage() {
        let mut server = server(2);
        assert!(server.receive_datagram(addr(1), &[0xff; 40]).is_none());
        assert!(server.receive_datagram(addr(1), &[]).is_none());

        let snap = server.metrics().snapshot();
        assert_eq!(snap.packets_received, 2);
        assert_eq!(snap.packets_sent, 0);
        assert_eq!(snap.malformed_packets + snap.invalid_packet_types, 2);
    }
}
