//! # Core Protocol Components
//!
//! Bit streams, the packet catalogue, the tag registry and the datagram codec.
//!
//! ## Components
//! - **Stream**: one `serialize` routine per packet runs in measure, write and read modes
//! - **Packet**: typed handshake packets
//! - **Factory**: static tag registry with allocation accounting
//! - **Codec**: whole-datagram encode/decode and Tokio `Encoder`/`Decoder`
//!
//! ## Wire Format
//! ```text
//! [Version(8 bits)] [Tag(3 bits)] [Fields...] [Zero pad to byte]
//! ```
//!
//! ## Security
//! - Maximum datagram size: 1200 bytes
//! - Unknown tags fail before any packet is allocated
//! - Trailing bytes and non-zero padding are rejected

pub mod codec;
pub mod factory;
pub mod packet;
pub mod stream;
