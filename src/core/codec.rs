//! # Datagram Codec
//!
//! Turns a whole datagram into a validated [`Packet`] and back.
//!
//! ## Wire Format
//! ```text
//! [version: 8 bits] [tag: ceil(log2(NUM_PACKET_TYPES)) bits] [fields...] [zero pad to byte]
//! ```
//! There is no length prefix; the transport delivers whole datagrams and
//! any byte left over after the fields is an error.
//!
//! The codec also implements the Tokio `Encoder`/`Decoder` pair so it can be
//! mounted under `tokio_util::udp::UdpFramed`. The `Decoder` swallows
//! undecodable datagrams: an attacker never gets an error surfaced, a reply,
//! or a log line above `debug`.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::config::{MAX_PACKET_BYTES, PROTOCOL_VERSION};
use crate::core::factory::PacketFactory;
use crate::core::packet::{Packet, NUM_PACKET_TYPES};
use crate::core::stream::{bits_required, MeasureStream, ReadStream, Stream, WriteStream};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::Metrics;

/// Bit width of the packet tag on the wire
pub const PACKET_TAG_BITS: u32 = bits_required(0, NUM_PACKET_TYPES as u32 - 1);

/// Encodes and decodes handshake datagrams
#[derive(Debug, Default)]
pub struct PacketCodec {
    factory: PacketFactory,
    metrics: Option<Arc<Metrics>>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count decode failures in `metrics`
    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            factory: PacketFactory::new(),
            metrics: Some(metrics),
        }
    }

    pub fn factory(&self) -> &PacketFactory {
        &self.factory
    }

    /// Serialize `packet` into a datagram. The packet is consumed.
    pub fn write_packet(mut packet: Packet) -> Result<Bytes> {
        let mut stream = WriteStream::new();
        serialize_header(&mut stream, &mut packet.packet_type().tag())?;
        packet.serialize(&mut stream)?;
        Ok(stream.finish())
    }

    /// Exact encoded size of `packet` in bytes
    pub fn measure_packet(packet: &mut Packet) -> Result<usize> {
        let mut stream = MeasureStream::new();
        serialize_header(&mut stream, &mut packet.packet_type().tag())?;
        packet.serialize(&mut stream)?;
        Ok(stream.bytes_required())
    }

    /// Parse an untrusted datagram
    pub fn read_packet(&mut self, data: &[u8]) -> Result<Packet> {
        if data.is_empty() {
            return Err(ProtocolError::MalformedPacket(constants::ERR_EMPTY_DATAGRAM));
        }
        if data.len() > MAX_PACKET_BYTES {
            return Err(ProtocolError::OversizedPacket(data.len()));
        }

        let mut stream = ReadStream::new(data);
        let mut tag = 0u32;
        serialize_header(&mut stream, &mut tag)?;

        let mut packet = self.factory.create(tag)?;
        let parsed = packet.serialize(&mut stream).and_then(|_| stream.finish());
        match parsed {
            Ok(()) => Ok(self.factory.detach(packet)),
            Err(e) => {
                self.factory.destroy(packet);
                Err(e)
            }
        }
    }

    /// Count a dropped datagram against the attached metrics
    pub(crate) fn record_drop(&self, err: &ProtocolError) {
        if let Some(metrics) = &self.metrics {
            match err {
                ProtocolError::InvalidPacketType(_) => metrics.invalid_packet_type(),
                _ => metrics.malformed_packet(),
            }
        }
    }
}

fn serialize_header<S: Stream>(stream: &mut S, tag: &mut u32) -> Result<()> {
    let mut version = u32::from(PROTOCOL_VERSION);
    stream.serialize_bits(&mut version, 8)?;
    if S::IS_READING && version != u32::from(PROTOCOL_VERSION) {
        return Err(ProtocolError::UnsupportedVersion(version as u8));
    }
    // Raw bits on read so an unknown tag reaches the factory and fails as
    // InvalidPacketType rather than as a range error.
    if !S::IS_READING && *tag as usize >= NUM_PACKET_TYPES {
        return Err(ProtocolError::InvalidPacketType(*tag));
    }
    stream.serialize_bits(tag, PACKET_TAG_BITS)
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let bytes = Self::write_packet(item)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        match self.read_packet(&datagram) {
            Ok(packet) => Ok(Some(packet)),
            Err(e) => {
                debug!(error = %e, len = datagram.len(), "dropping undecodable datagram");
                self.record_drop(&e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{CONNECT_TOKEN_BYTES, MAX_PAYLOAD_BYTES, NONCE_BYTES};
    use crate::core::packet::PacketType;
    use crate::protocol::token::ConnectToken;

    #[test]
    fn test_tag_width() {
        // 7 types, or 8 with insecure connect: three bits either way
        assert_eq!(PACKET_TAG_BITS, 3);
    }

    #[test]
    fn test_header_only_packets_are_two_bytes() {
        let bytes = PacketCodec::write_packet(Packet::denied()).unwrap();
        assert_eq!(bytes.len(), 2);
        assert_eq!(bytes[0], PROTOCOL_VERSION);

        let mut codec = PacketCodec::new();
        assert_eq!(codec.read_packet(&bytes).unwrap(), Packet::denied());
    }

    #[test]
    fn test_measure_matches_write() {
        let token = ConnectToken {
            expire_timestamp: 1_900_000_000,
            data: [0x42; CONNECT_TOKEN_BYTES],
            nonce: [7; NONCE_BYTES],
        };
        for packet in [
            Packet::connection_request(&token),
            Packet::keep_alive(63),
            Packet::connection(vec![9; MAX_PAYLOAD_BYTES]),
            Packet::disconnect(),
        ] {
            let mut measured = packet.clone();
            let size = PacketCodec::measure_packet(&mut measured).unwrap();
            assert_eq!(PacketCodec::write_packet(packet).unwrap().len(), size);
        }
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = PacketCodec::write_packet(Packet::disconnect()).unwrap().to_vec();
        bytes[0] = PROTOCOL_VERSION + 1;
        let mut codec = PacketCodec::new();
        assert!(matches!(
            codec.read_packet(&bytes),
            Err(ProtocolError::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn test_unknown_tag_is_invalid_packet_type() {
        let mut codec = PacketCodec::new();
        // Largest tag that fits in the tag field
        let tag = (1u8 << PACKET_TAG_BITS) - 1;
        if (tag as usize) < NUM_PACKET_TYPES {
            return;
        }
        let bytes = [PROTOCOL_VERSION, tag];
        assert!(matches!(
            codec.read_packet(&bytes),
            Err(ProtocolError::InvalidPacketType(t)) if t == u32::from(tag)
        ));
        assert_eq!(codec.factory().num_allocated(), 0);
    }

    #[test]
    fn test_truncated_request_is_released() {
        let token = ConnectToken {
            expire_timestamp: 5,
            data: [1; CONNECT_TOKEN_BYTES],
            nonce: [2; NONCE_BYTES],
        };
        let bytes = PacketCodec::write_packet(Packet::connection_request(&token)).unwrap();
        let mut codec = PacketCodec::new();
        assert!(matches!(
            codec.read_packet(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        assert_eq!(codec.factory().num_allocated(), 0);
    }

    #[test]
    fn test_decoder_swallows_garbage() {
        let mut codec = PacketCodec::with_metrics(Arc::new(Metrics::new()));
        let mut src = BytesMut::from(&[PROTOCOL_VERSION, 0xFF, 0xFF][..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.is_empty());

        let mut src = BytesMut::new();
        codec.encode(Packet::keep_alive(3), &mut src).unwrap();
        let packet = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(packet.packet_type(), PacketType::KeepAlive);
    }
}
