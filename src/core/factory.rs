//! # Packet Factory
//!
//! Static registry from wire tag to packet constructor. The tag is attacker
//! controlled on every inbound datagram, so lookup fails closed: an unknown
//! tag yields [`ProtocolError::InvalidPacketType`] before anything is
//! allocated.

use tracing::trace;

use crate::core::packet::{
    ChallengePacket, ChallengeResponsePacket, ConnectionDeniedPacket, ConnectionPacket,
    ConnectionRequestPacket, DisconnectPacket, KeepAlivePacket, Packet, PacketType,
    NUM_PACKET_TYPES,
};
use crate::error::{ProtocolError, Result};

#[cfg(feature = "insecure-connect")]
use crate::core::packet::InsecureConnectPacket;

/// One registry row
#[derive(Debug, Clone, Copy)]
pub struct PacketEntry {
    pub packet_type: PacketType,
    pub create: fn() -> Packet,
}

/// Registry indexed by wire tag. Exhaustive over the catalogue.
pub static REGISTRY: [PacketEntry; NUM_PACKET_TYPES] = [
    PacketEntry {
        packet_type: PacketType::ConnectionRequest,
        create: || Packet::ConnectionRequest(Box::<ConnectionRequestPacket>::default()),
    },
    PacketEntry {
        packet_type: PacketType::ConnectionDenied,
        create: || Packet::ConnectionDenied(ConnectionDeniedPacket),
    },
    PacketEntry {
        packet_type: PacketType::Challenge,
        create: || Packet::Challenge(Box::<ChallengePacket>::default()),
    },
    PacketEntry {
        packet_type: PacketType::ChallengeResponse,
        create: || Packet::ChallengeResponse(Box::<ChallengeResponsePacket>::default()),
    },
    PacketEntry {
        packet_type: PacketType::KeepAlive,
        create: || Packet::KeepAlive(KeepAlivePacket::default()),
    },
    PacketEntry {
        packet_type: PacketType::Disconnect,
        create: || Packet::Disconnect(DisconnectPacket),
    },
    #[cfg(feature = "insecure-connect")]
    PacketEntry {
        packet_type: PacketType::InsecureConnect,
        create: || Packet::InsecureConnect(InsecureConnectPacket::default()),
    },
    PacketEntry {
        packet_type: PacketType::Connection,
        create: || Packet::Connection(ConnectionPacket::default()),
    },
];

/// Creates zero-initialised packets by tag and tracks how many are alive
#[derive(Debug, Default)]
pub struct PacketFactory {
    num_allocated: usize,
}

impl PacketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zero-initialised packet for `tag`
    pub fn create(&mut self, tag: u32) -> Result<Packet> {
        let entry = REGISTRY
            .get(tag as usize)
            .ok_or(ProtocolError::InvalidPacketType(tag))?;
        debug_assert_eq!(entry.packet_type.tag(), tag);

        self.num_allocated += 1;
        trace!(packet = entry.packet_type.name(), "packet created");
        Ok((entry.create)())
    }

    /// Release a packet obtained from [`PacketFactory::create`]
    pub fn destroy(&mut self, packet: Packet) {
        self.num_allocated = self.num_allocated.saturating_sub(1);
        trace!(packet = packet.packet_type().name(), "packet destroyed");
        drop(packet);
    }

    /// Hand a packet over to the caller; it is no longer tracked here
    pub fn detach(&mut self, packet: Packet) -> Packet {
        self.num_allocated = self.num_allocated.saturating_sub(1);
        packet
    }

    /// Packets created and not yet destroyed or detached
    pub fn num_allocated(&self) -> usize {
        self.num_allocated
    }
}
