//! # UDP Transport
//!
//! Drives the sampled handshake state machines from a Tokio runtime.
//!
//! The server loop owns a [`Server`] on a single task: it feeds every
//! datagram through [`Server::receive_datagram`], ticks [`Server::update`]
//! on a fixed interval, and sends whatever they return. The client side wraps
//! a [`Client`] and a `UdpFramed<PacketCodec>` in a [`ClientConnection`].
//!
//! ## Responsibilities
//! - Bind sockets and translate wall time into the state machines' clock
//! - Deliver session events to the host application
//! - Graceful shutdown with courtesy Disconnects

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, instrument, warn};

use crate::config::{ServerConfig, MAX_PACKET_BYTES};
use crate::core::codec::PacketCodec;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::client::{Client, ClientState, DisconnectReason};
use crate::protocol::server::{Server, ServerEvent};
use crate::protocol::token::{ConnectToken, TokenCodec};

/// How often the state machines are sampled
pub const TICK_INTERVAL: Duration = Duration::from_millis(10);

fn ticker() -> Interval {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Bind `config.address` and serve until CTRL+C
#[instrument(skip(config, tokens), fields(address = %config.address))]
pub async fn start_server<T: TokenCodec>(config: ServerConfig, tokens: T) -> Result<()> {
    let socket = UdpSocket::bind(&config.address).await?;
    let server = Server::new(config, tokens)?;

    // Create internal shutdown channel
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("Received CTRL+C signal, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    start_server_with_shutdown(socket, server, None, shutdown_rx).await
}

/// Serve on `socket` until `shutdown_rx` fires.
///
/// Session events are forwarded to `events` when given, otherwise logged.
#[instrument(skip_all)]
pub async fn start_server_with_shutdown<T: TokenCodec>(
    socket: UdpSocket,
    mut server: Server<T>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    info!(address = ?socket.local_addr().ok(), "Listening for handshakes");

    let epoch = Instant::now();
    let mut tick = ticker();
    // One spare byte so oversized datagrams are seen as oversized, not truncated
    let mut buf = vec![0u8; MAX_PACKET_BYTES + 1];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(clients = server.num_connected_clients(), "Shutting down server");
                for (to, packet) in server.disconnect_all() {
                    send_packet(&socket, &server, to, packet).await;
                }
                forward_events(&mut server, events.as_ref());
                server.metrics().log_metrics();
                return Ok(());
            }

            _ = tick.tick() => {
                for (to, packet) in server.update(epoch.elapsed().as_secs_f64()) {
                    send_packet(&socket, &server, to, packet).await;
                }
                forward_events(&mut server, events.as_ref());
            }

            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        if let Some(reply) = server.receive_datagram(from, &buf[..len]) {
                            if let Err(e) = socket.send_to(&reply, from).await {
                                warn!(error = %e, %from, "Failed to send reply");
                            }
                        }
                        forward_events(&mut server, events.as_ref());
                    }
                    // ICMP unreachable surfaces here on some platforms; not fatal
                    Err(e) => debug!(error = %e, "recv_from failed"),
                }
            }
        }
    }
}

async fn send_packet<T: TokenCodec>(
    socket: &UdpSocket,
    server: &Server<T>,
    to: SocketAddr,
    packet: Packet,
) {
    if let Some(bytes) = server.encode(packet) {
        if let Err(e) = socket.send_to(&bytes, to).await {
            warn!(error = %e, %to, "Failed to send packet");
        }
    }
}

fn forward_events<T: TokenCodec>(
    server: &mut Server<T>,
    events: Option<&mpsc::UnboundedSender<ServerEvent>>,
) {
    while let Some(event) = server.poll_event() {
        match events {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!(?event, "server event"),
        }
    }
}

/// Client session over UDP
#[derive(Debug)]
pub struct ClientConnection {
    framed: UdpFramed<PacketCodec>,
    client: Client,
    server_addr: SocketAddr,
    epoch: Instant,
    tick: Interval,
}

impl ClientConnection {
    /// Handshake with `server_addr` using `token`. Resolves once connected,
    /// or fails with [`ProtocolError::HandshakeFailed`].
    #[instrument(skip(client, token))]
    pub async fn connect(server_addr: SocketAddr, client: Client, token: ConnectToken) -> Result<Self> {
        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;

        let mut conn = Self {
            framed: UdpFramed::new(socket, PacketCodec::new()),
            client,
            server_addr,
            epoch: Instant::now(),
            tick: ticker(),
        };
        conn.client.connect(token, 0.0);

        while !conn.client.is_connected() {
            if let ClientState::Disconnected(Some(reason)) = conn.client.state() {
                return Err(ProtocolError::HandshakeFailed(reason));
            }
            conn.step().await?;
        }

        info!(client_index = ?conn.client.client_index(), "Connected to server");
        Ok(conn)
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Wait for one datagram or one tick and apply it
    async fn step(&mut self) -> Result<()> {
        tokio::select! {
            frame = self.framed.next() => match frame {
                Some(Ok((packet, from))) if from == self.server_addr => {
                    // Bring the clock forward first so the packet is stamped correctly
                    if let Some(due) = self.client.update(self.now()) {
                        self.framed.send((due, self.server_addr)).await?;
                    }
                    self.client.process_packet(packet);
                }
                Some(Ok((_, from))) => debug!(%from, "ignoring packet from unknown sender"),
                Some(Err(e)) => debug!(error = %e, "receive failed"),
                None => return Err(ProtocolError::Custom("UDP stream closed".to_string())),
            },

            _ = self.tick.tick() => {
                if let Some(packet) = self.client.update(self.now()) {
                    self.framed.send((packet, self.server_addr)).await?;
                }
            }
        }
        Ok(())
    }

    /// Send an opaque payload to the server
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        let packet = self.client.send_payload(payload)?;
        self.framed.send((packet, self.server_addr)).await
    }

    /// Wait for the next payload from the server, keeping the session alive meanwhile
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.client.receive_payload() {
                return Ok(payload);
            }
            if let ClientState::Disconnected(reason) = self.client.state() {
                return Err(ProtocolError::HandshakeFailed(
                    reason.unwrap_or(DisconnectReason::DisconnectedByClient),
                ));
            }
            self.step().await?;
        }
    }

    /// Leave the session, notifying the server
    pub async fn disconnect(mut self) -> Result<()> {
        if let Some(packet) = self.client.disconnect() {
            self.framed.send((packet, self.server_addr)).await?;
        }
        Ok(())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.framed.get_ref().local_addr()?)
    }
}
