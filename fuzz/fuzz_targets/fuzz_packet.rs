#![no_main]

use std::net::SocketAddr;

use handshake_protocol::config::ServerConfig;
use handshake_protocol::core::codec::PacketCodec;
use handshake_protocol::protocol::server::Server;
use handshake_protocol::protocol::token::ChaChaTokenCodec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut codec = PacketCodec::new();
    if let Ok(packet) = codec.read_packet(data) {
        // Anything accepted must re-encode to the same bytes
        let bytes = PacketCodec::write_packet(packet).expect("accepted packet must re-encode");
        assert_eq!(&bytes[..], data);
    }
    assert_eq!(codec.factory().num_allocated(), 0);

    let Ok(tokens) = ChaChaTokenCodec::new([7u8; 32]) else {
        return;
    };
    let Ok(mut server) = Server::new(ServerConfig::default(), tokens) else {
        return;
    };
    let from = SocketAddr::from(([10, 0, 0, 1], 40000));
    let _ = server.receive_datagram(from, data);
    assert_eq!(server.num_connected_clients(), 0);
});
