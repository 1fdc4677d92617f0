//! Observability and Metrics
//!
//! Counters for the handshake trust boundary: what arrived, what was dropped
//! and why, and how many sessions are live.
//!
//! Uses atomic counters for thread-safe metrics collection. A `Server` owns an
//! `Arc<Metrics>`; the UDP driver shares it with its codec.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for handshake operations
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams received
    pub packets_received: AtomicU64,
    /// Datagrams sent
    pub packets_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Datagrams dropped for failing to parse
    pub malformed_packets: AtomicU64,
    /// Datagrams dropped for carrying an unknown packet tag
    pub invalid_packet_types: AtomicU64,
    /// ConnectionRequest packets processed
    pub connection_requests: AtomicU64,
    /// Challenge tokens minted
    pub challenges_issued: AtomicU64,
    /// ConnectionDenied replies sent
    pub connections_denied: AtomicU64,
    /// Connect token nonces seen twice
    pub replays_detected: AtomicU64,
    /// ChallengeResponse packets that did not match what was issued
    pub challenge_mismatches: AtomicU64,
    /// Pending connections that never answered their challenge
    pub handshake_timeouts: AtomicU64,
    /// Connected clients that went silent
    pub keepalive_timeouts: AtomicU64,
    /// Handshakes completed
    pub connections_total: AtomicU64,
    /// Currently connected clients
    pub connections_active: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            malformed_packets: AtomicU64::new(0),
            invalid_packet_types: AtomicU64::new(0),
            connection_requests: AtomicU64::new(0),
            challenges_issued: AtomicU64::new(0),
            connections_denied: AtomicU64::new(0),
            replays_detected: AtomicU64::new(0),
            challenge_mismatches: AtomicU64::new(0),
            handshake_timeouts: AtomicU64::new(0),
            keepalive_timeouts: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an inbound datagram
    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record an outbound datagram
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn malformed_packet(&self) {
        self.malformed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_packet_type(&self) {
        self.invalid_packet_types.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_request(&self) {
        self.connection_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn challenge_issued(&self) {
        self.challenges_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_denied(&self) {
        self.connections_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_detected(&self) {
        self.replays_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn challenge_mismatch(&self) {
        self.challenge_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_timeout(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn keepalive_timeout(&self) {
        self.keepalive_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed handshake
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session ending, for any reason
    pub fn connection_closed(&self) {
        // Saturate rather than wrap if a close is ever double counted
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            invalid_packet_types: self.invalid_packet_types.load(Ordering::Relaxed),
            connection_requests: self.connection_requests.load(Ordering::Relaxed),
            challenges_issued: self.challenges_issued.load(Ordering::Relaxed),
            connections_denied: self.connections_denied.load(Ordering::Relaxed),
            replays_detected: self.replays_detected.load(Ordering::Relaxed),
            challenge_mismatches: self.challenge_mismatches.load(Ordering::Relaxed),
            handshake_timeouts: self.handshake_timeouts.load(Ordering::Relaxed),
            keepalive_timeouts: self.keepalive_timeouts.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_received = snapshot.packets_received,
            packets_sent = snapshot.packets_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            malformed_packets = snapshot.malformed_packets,
            invalid_packet_types = snapshot.invalid_packet_types,
            connection_requests = snapshot.connection_requests,
            challenges_issued = snapshot.challenges_issued,
            connections_denied = snapshot.connections_denied,
            replays_detected = snapshot.replays_detected,
            challenge_mismatches = snapshot.challenge_mismatches,
            handshake_timeouts = snapshot.handshake_timeouts,
            keepalive_timeouts = snapshot.keepalive_timeouts,
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            uptime_seconds = snapshot.uptime_seconds,
            "Handshake metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub malformed_packets: u64,
    pub invalid_packet_types: u64,
    pub connection_requests: u64,
    pub challenges_issued: u64,
    pub connections_denied: u64,
    pub replays_detected: u64,
    pub challenge_mismatches: u64,
    pub handshake_timeouts: u64,
    pub keepalive_timeouts: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub uptime_seconds: u64,
}
