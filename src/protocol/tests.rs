// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;

use crate::config::{
    ClientConfig, ServerConfig, CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, NONCE_BYTES,
};
use crate::core::codec::PacketCodec;
use crate::core::packet::{ChallengeResponsePacket, Packet};
use crate::error::{ProtocolError, Result};
use crate::protocol::client::{Client, ClientState, DisconnectReason};
use crate::protocol::server::{Server, ServerEvent, SlotState};
use crate::protocol::token::{ChallengeToken, ClientPrivateInfo, ConnectToken, TokenCodec};

const VALID: u8 = 0xA5;
const FUTURE: u64 = u64::MAX;

/// Accepts any token whose first byte is `VALID`; client id in bytes 1..9
#[derive(Debug, Default)]
struct FakeTokens {
    issued: u64,
}

impl TokenCodec for FakeTokens {
    fn decrypt_connect_token(&self, token: &ConnectToken, now: u64) -> Result<ClientPrivateInfo> {
        if token.expire_timestamp < now {
            return Err(ProtocolError::TokenExpired(token.expire_timestamp));
        }
        if token.data[0] != VALID {
            return Err(ProtocolError::TokenInvalid);
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&token.data[1..9]);
        Ok(ClientPrivateInfo::new(u64::from_le_bytes(id)))
    }

    fn issue_challenge_token(&mut self, info: &ClientPrivateInfo) -> Result<ChallengeToken> {
        self.issued += 1;
        let mut token = ChallengeToken {
            data: [0; CHALLENGE_TOKEN_BYTES],
            nonce: [0; NONCE_BYTES],
        };
        token.nonce[..8].copy_from_slice(&self.issued.to_le_bytes());
        token.data[..8].copy_from_slice(&info.client_id.to_le_bytes());
        Ok(token)
    }
}

fn fake_token(client_id: u64, nonce: u8) -> ConnectToken {
    let mut data = [0u8; CONNECT_TOKEN_BYTES];
    data[0] = VALID;
    data[1..9].copy_from_slice(&client_id.to_le_bytes());
    ConnectToken {
        expire_timestamp: FUTURE,
        data,
        nonce: [nonce; NONCE_BYTES],
    }
}

fn server(max_clients: usize) -> Server<FakeTokens> {
    let config = ServerConfig {
        max_clients,
        ..ServerConfig::default()
    };
    Server::new(config, FakeTokens::default()).unwrap()
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

/// Shuttle packets between one client and the server over encoded bytes
fn pump(client: &mut Client, server: &mut Server<FakeTokens>, from: SocketAddr, time: f64) {
    server.update(time);
    if let Some(packet) = client.update(time) {
        let bytes = PacketCodec::write_packet(packet).unwrap();
        if let Some(reply) = server.receive_datagram(from, &bytes) {
            client.process_datagram(&reply);
        }
    }
}

#[test]
fn test_full_handshake_over_bytes() {
    let mut server = server(4);
    let mut client = Client::new(ClientConfig::default());
    client.connect(fake_token(42, 1), 0.0);

    pump(&mut client, &mut server, addr(1), 0.0);
    assert_eq!(client.state(), ClientState::SendingChallengeResponse);
    assert_eq!(server.slot_state(addr(1)), Some(SlotState::AwaitingChallengeResponse));

    pump(&mut client, &mut server, addr(1), 0.1);
    assert!(client.is_connected());
    assert_eq!(client.client_index(), Some(0));
    assert_eq!(server.slot_state(addr(1)), Some(SlotState::Connected));
    assert_eq!(server.client_id(0), Some(42));
    assert!(matches!(
        server.poll_event(),
        Some(ServerEvent::ClientConnected { client_index: 0, client_id: 42, .. })
    ));
}

#[test]
fn test_invalid_token_is_denied() {
    let mut server = server(4);
    let mut token = fake_token(1, 1);
    token.data[0] = 0;

    let reply = server.process_packet(addr(1), Packet::connection_request(&token));
    assert_eq!(reply, Some(Packet::denied()));
    assert_eq!(server.pending_count(), 0);
    // Only tokens that open are remembered
    assert!(server.replay_cache().is_empty());
}

#[test]
fn test_expired_token_is_denied_before_anything_else() {
    let mut server = server(4);
    let mut token = fake_token(1, 1);
    token.expire_timestamp = 1;

    let reply = server.process_packet(addr(1), Packet::connection_request(&token));
    assert_eq!(reply, Some(Packet::denied()));
    // An expired request never consumes its nonce
    assert!(server.replay_cache().is_empty());
}

#[test]
fn test_replayed_nonce_from_another_address_is_dropped() {
    let mut server = server(4);
    let token = fake_token(1, 9);

    let first = server.process_packet(addr(1), Packet::connection_request(&token));
    assert!(matches!(first, Some(Packet::Challenge(_))));

    let replay = server.process_packet(addr(2), Packet::connection_request(&token));
    assert_eq!(replay, None);
    assert_eq!(server.pending_count(), 1);
    assert_eq!(server.metrics().snapshot().replays_detected, 1);
}

#[test]
fn test_request_resend_gets_same_challenge() {
    let mut server = server(4);
    let token = fake_token(1, 3);

    let first = server.process_packet(addr(1), Packet::connection_request(&token));
    let second = server.process_packet(addr(1), Packet::connection_request(&token));
    assert!(first.is_some());
    assert_eq!(first, second);
    assert_eq!(server.pending_count(), 1);
    assert_eq!(server.metrics().snapshot().challenges_issued, 1);
}

#[test]
fn test_tampered_challenge_response_is_dropped() {
    let mut server = server(4);
    let reply = server.process_packet(addr(1), Packet::connection_request(&fake_token(1, 1)));
    let Some(Packet::Challenge(challenge)) = reply else {
        panic!("expected a challenge");
    };

    let mut response = ChallengeResponsePacket::echo(&challenge);
    response.token_data[0] ^= 0xFF;
    let reply = server.process_packet(addr(1), Packet::ChallengeResponse(Box::new(response)));
    assert_eq!(reply, None);
    assert_eq!(server.num_connected_clients(), 0);
    assert_eq!(server.pending_count(), 1);
}

#[test]
fn test_challenge_response_from_wrong_address_is_dropped() {
    let mut server = server(4);
    let reply = server.process_packet(addr(1), Packet::connection_request(&fake_token(1, 1)));
    let Some(Packet::Challenge(challenge)) = reply else {
        panic!("expected a challenge");
    };

    let response = Packet::ChallengeResponse(Box::new(ChallengeResponsePacket::echo(&challenge)));
    assert_eq!(server.process_packet(addr(2), response), None);
    assert_eq!(server.num_connected_clients(), 0);
}

#[test]
fn test_connected_address_is_not_rechallenged() {
    let mut server = server(4);
    let mut client = Client::new(ClientConfig::default());
    client.connect(fake_token(5, 1), 0.0);
    pump(&mut client, &mut server, addr(1), 0.0);
    pump(&mut client, &mut server, addr(1), 0.1);
    assert!(client.is_connected());

    let reply = server.process_packet(addr(1), Packet::connection_request(&fake_token(5, 2)));
    assert_eq!(reply, None);
}

#[test]
fn test_full_server_denies_then_recovers() {
    let mut server = server(2);
    let mut clients = Vec::new();
    for port in 1..=2u16 {
        let mut client = Client::new(ClientConfig::default());
        client.connect(fake_token(u64::from(port), port as u8), 0.0);
        pump(&mut client, &mut server, addr(port), 0.0);
        pump(&mut client, &mut server, addr(port), 0.1);
        assert!(client.is_connected());
        clients.push(client);
    }

    let mut late = Client::new(ClientConfig::default());
    late.connect(fake_token(3, 3), 0.2);
    pump(&mut late, &mut server, addr(3), 0.2);
    assert_eq!(
        late.state(),
        ClientState::Disconnected(Some(DisconnectReason::ConnectionDenied))
    );

    // Client 0 leaves; the next client gets index 0 back
    let farewell = clients[0].disconnect().unwrap();
    assert!(server.process_packet(addr(1), farewell).is_none());

    let mut next = Client::new(ClientConfig::default());
    next.connect(fake_token(4, 4), 0.3);
    pump(&mut next, &mut server, addr(4), 0.3);
    pump(&mut next, &mut server, addr(4), 0.4);
    assert_eq!(next.client_index(), Some(0));
}

#[test]
fn test_session_payloads_both_ways() {
    let mut server = server(4);
    let mut client = Client::new(ClientConfig::default());
    client.connect(fake_token(8, 1), 0.0);
    pump(&mut client, &mut server, addr(1), 0.0);
    pump(&mut client, &mut server, addr(1), 0.1);
    server.poll_event();

    let packet = client.send_payload(b"hello".to_vec()).unwrap();
    let bytes = PacketCodec::write_packet(packet).unwrap();
    assert!(server.receive_datagram(addr(1), &bytes).is_none());
    assert_eq!(
        server.poll_event(),
        Some(ServerEvent::PayloadReceived {
            client_index: 0,
            payload: b"hello".to_vec(),
        })
    );

    let (to, packet) = server.send_payload(0, b"world".to_vec()).unwrap();
    assert_eq!(to, addr(1));
    client.process_datagram(&PacketCodec::write_packet(packet).unwrap());
    assert_eq!(client.receive_payload(), Some(b"world".to_vec()));
}

#[test]
fn test_both_sides_time_out_silently() {
    let mut server = server(4);
    let mut client = Client::new(ClientConfig::default());
    client.connect(fake_token(8, 1), 0.0);
    pump(&mut client, &mut server, addr(1), 0.0);
    pump(&mut client, &mut server, addr(1), 0.1);

    // No traffic delivered either way from here on
    server.update(10.0);
    client.update(10.0);
    assert_eq!(server.num_connected_clients(), 0);
    assert_eq!(
        client.state(),
        ClientState::Disconnected(Some(DisconnectReason::KeepaliveTimedOut))
    );
    assert_eq!(server.metrics().snapshot().keepalive_timeouts, 1);
}

#[test]
fn test_server_only_replies_to_handshake_packets() {
    let mut server = server(4);
    for packet in [
        Packet::keep_alive(0),
        Packet::disconnect(),
        Packet::connection(vec![1]),
        Packet::denied(),
    ] {
        let packet_type = packet.packet_type();
        assert!(
            server.process_packet(addr(1), packet).is_none(),
            "unexpected reply to {packet_type:?}"
        );
    }
}

#[cfg(feature = "insecure-connect")]
mod insecure {
    use super::*;
    use crate::core::packet::InsecureConnectPacket;

    fn insecure(salt: u64) -> Packet {
        Packet::InsecureConnect(InsecureConnectPacket { client_salt: salt })
    }

    #[test]
    fn test_disabled_at_runtime_is_silent() {
        let mut server = server(4);
        assert_eq!(server.process_packet(addr(1), insecure(7)), None);
        assert_eq!(server.num_connected_clients(), 0);
    }

    #[test]
    fn test_enabled_connects_directly() {
        let config = ServerConfig {
            insecure_connect_enabled: true,
            ..ServerConfig::default()
        };
        let mut server = Server::new(config, FakeTokens::default()).unwrap();
        let mut client = Client::new(ClientConfig::default());
        client.insecure_connect(77, 0.0);
        pump(&mut client, &mut server, addr(1), 0.0);

        assert!(client.is_connected());
        assert_eq!(client.client_index(), Some(0));
        assert_eq!(server.client_id(0), Some(77));
    }
}
