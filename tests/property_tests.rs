//! Property-based tests using proptest
//!
//! These tests validate wire invariants across randomly generated packets and
//! arbitrary untrusted input.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use handshake_protocol::config::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, MAX_CLIENTS, MAX_PACKET_BYTES, MAX_PAYLOAD_BYTES,
    NONCE_BYTES,
};
use handshake_protocol::core::codec::PacketCodec;
#[cfg(feature = "insecure-connect")]
use handshake_protocol::core::packet::InsecureConnectPacket;
use handshake_protocol::core::packet::{ChallengeResponsePacket, Packet};
use handshake_protocol::core::stream::{bits_required, ReadStream, Stream, WriteStream};
use handshake_protocol::error::ProtocolError;
use handshake_protocol::protocol::token::{ChallengeToken, ConnectToken};
use proptest::prelude::*;

fn byte_array<const N: usize>() -> impl Strategy<Value = [u8; N]> {
    prop::collection::vec(any::<u8>(), N).prop_map(|v| {
        let mut out = [0u8; N];
        out.copy_from_slice(&v);
        out
    })
}

fn arb_packet() -> BoxedStrategy<Packet> {
    let base = prop_oneof![
        (any::<u64>(), byte_array::<CONNECT_TOKEN_BYTES>(), byte_array::<NONCE_BYTES>()).prop_map(
            |(expire_timestamp, data, nonce)| Packet::connection_request(&ConnectToken {
                expire_timestamp,
                data,
                nonce,
            })
        ),
        (byte_array::<CHALLENGE_TOKEN_BYTES>(), byte_array::<NONCE_BYTES>())
            .prop_map(|(data, nonce)| Packet::challenge(&ChallengeToken { data, nonce })),
        (byte_array::<CHALLENGE_TOKEN_BYTES>(), byte_array::<NONCE_BYTES>()).prop_map(
            |(token_data, token_nonce)| Packet::ChallengeResponse(Box::new(
                ChallengeResponsePacket {
                    token_data,
                    token_nonce,
                }
            ))
        ),
        (0..MAX_CLIENTS).prop_map(Packet::keep_alive),
        prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_BYTES).prop_map(Packet::connection),
        Just(Packet::denied()),
        Just(Packet::disconnect()),
    ];

    #[cfg(feature = "insecure-connect")]
    let base = prop_oneof![
        7 => base,
        1 => any::<u64>()
            .prop_map(|client_salt| Packet::InsecureConnect(InsecureConnectPacket { client_salt })),
    ];

    base.boxed()
}

// Property: every valid packet survives the wire unchanged, at its measured size
proptest! {
    #[test]
    fn prop_packet_roundtrip(packet in arb_packet()) {
        let mut measured = packet.clone();
        let size = PacketCodec::measure_packet(&mut measured).expect("measure should not fail");

        let bytes = PacketCodec::write_packet(packet.clone()).expect("write should not fail");
        prop_assert_eq!(bytes.len(), size);
        prop_assert!(bytes.len() <= MAX_PACKET_BYTES);

        let mut codec = PacketCodec::new();
        let decoded = codec.read_packet(&bytes).expect("read should not fail");
        prop_assert_eq!(decoded, packet);
        prop_assert_eq!(codec.factory().num_allocated(), 0);
    }
}

// Property: arbitrary input never panics and never leaks a packet
proptest! {
    #[test]
    fn prop_arbitrary_bytes_fail_closed(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut codec = PacketCodec::new();
        let _ = codec.read_packet(&data);
        prop_assert_eq!(codec.factory().num_allocated(), 0);
    }
}

// Property: appending any byte to a valid packet makes it invalid
proptest! {
    #[test]
    fn prop_trailing_bytes_rejected(packet in arb_packet(), extra in any::<u8>()) {
        let mut bytes = PacketCodec::write_packet(packet).unwrap().to_vec();
        bytes.push(extra);
        let result = PacketCodec::new().read_packet(&bytes);
        prop_assert!(result.is_err());
    }
}

// Property: truncating a valid packet makes it invalid
proptest! {
    #[test]
    fn prop_truncation_rejected(packet in arb_packet(), cut in 1usize..64) {
        let bytes = PacketCodec::write_packet(packet).unwrap();
        let keep = bytes.len().saturating_sub(cut);
        prop_assume!(keep < bytes.len());
        let result = PacketCodec::new().read_packet(&bytes[..keep]);
        prop_assert!(result.is_err());
    }
}

// Property: bounded ints use exactly the minimal width and round-trip
proptest! {
    #[test]
    fn prop_bounded_int_roundtrip(min in 0u32..1000, span in 0u32..100_000, offset in 0u32..100_000) {
        let max = min + span;
        let mut value = min + offset % (span + 1);
        let expected = value;

        let mut writer = WriteStream::new();
        writer.serialize_int(&mut value, min, max).unwrap();
        prop_assert_eq!(writer.bits_processed() as u32, bits_required(min, max));
        let bytes = writer.finish();

        let mut reader = ReadStream::new(&bytes);
        let mut decoded = 0u32;
        reader.serialize_int(&mut decoded, min, max).unwrap();
        reader.finish().unwrap();
        prop_assert_eq!(decoded, expected);
    }
}

// Property: out-of-range client indices are rejected on write, never wrapped
proptest! {
    #[test]
    fn prop_client_index_out_of_range(index in MAX_CLIENTS..MAX_CLIENTS * 4) {
        let result = PacketCodec::write_packet(Packet::keep_alive(index));
        let is_out_of_range = matches!(result, Err(ProtocolError::ValueOutOfRange { .. }));
        prop_assert!(is_out_of_range);
    }
}
