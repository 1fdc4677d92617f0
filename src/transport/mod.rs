//! # Transport Layer
//!
//! Socket drivers for the handshake state machines.

pub mod udp;
