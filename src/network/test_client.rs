//! Packet inspection client
//!
//! Wraps a [`PacketTransport`] and queues every packet it delivers so a test
//! (or a diagnostic tool) can wait for, and check, the next datagram.
//! Waits advance the transport's [`Clock`](crate::clock::Clock) in 1 ms
//! steps, so the same loop runs against the wall clock or a simulated one.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TestClientConfig;
use crate::constants::POLL_STEP_MS;
use crate::error::TransportError;
use crate::network::packet_transport::{PacketOptions, PacketTransport};
use crate::signal::Connection;

/// A received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub addr: SocketAddr,
    pub data: Bytes,
    /// Receive time in microseconds, -1 when unknown
    pub packet_time_us: i64,
}

impl Packet {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

struct PacketQueue {
    packets: Mutex<VecDeque<Packet>>,
    capacity: usize,
    overflowed: AtomicUsize,
}

impl PacketQueue {
    fn push(&self, packet: Packet) {
        let mut packets = self.packets.lock();
        if packets.len() >= self.capacity {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(capacity = self.capacity, "Packet queue full, dropping packet");
            return;
        }
        packets.push_back(packet);
    }

    fn pop(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }
}

/// Queue-backed inspection client over one transport
pub struct TestClient {
    transport: Arc<PacketTransport>,
    queue: Arc<PacketQueue>,
    ready_to_send_count: Arc<AtomicUsize>,
    prev_packet_timestamp: Option<i64>,
    timeout: Duration,
    no_packet_timeout: Duration,
    _connections: Vec<Connection>,
}

impl TestClient {
    /// Attach to `transport` with default timeouts
    pub fn new(transport: Arc<PacketTransport>) -> Self {
        Self::with_config(transport, &TestClientConfig::default())
    }

    pub fn with_config(transport: Arc<PacketTransport>, config: &TestClientConfig) -> Self {
        let queue = Arc::new(PacketQueue {
            packets: Mutex::new(VecDeque::new()),
            capacity: config.queue_capacity,
            overflowed: AtomicUsize::new(0),
        });
        let ready_to_send_count = Arc::new(AtomicUsize::new(0));

        let q = queue.clone();
        let on_packet = transport.signals().read_packet.connect(move |packet| {
            q.push(Packet {
                addr: packet.from,
                data: packet.data.clone(),
                packet_time_us: packet.packet_time_us,
            });
        });

        let count = ready_to_send_count.clone();
        let on_ready = transport.signals().ready_to_send.connect(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });

        Self {
            transport,
            queue,
            ready_to_send_count,
            prev_packet_timestamp: None,
            timeout: Duration::from_millis(config.timeout_ms),
            no_packet_timeout: Duration::from_millis(config.no_packet_timeout_ms),
            _connections: vec![on_packet, on_ready],
        }
    }

    pub fn transport(&self) -> &Arc<PacketTransport> {
        &self.transport
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.transport.local_address()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.transport.remote_address()
    }

    /// Send to the transport's remote address
    pub fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.transport.send_packet(data, PacketOptions::default())
    }

    /// Send to an explicit address
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        self.transport
            .send_packet_to(data, addr, PacketOptions::default())
    }

    /// Wait up to `timeout_ms` for the oldest queued packet and remove it
    pub fn next_packet(&self, timeout_ms: u64) -> Option<Packet> {
        let clock = self.transport.clock().clone();
        let deadline = clock.now_us() + (timeout_ms as i64) * 1000;
        let step = Duration::from_millis(POLL_STEP_MS);

        loop {
            if let Some(packet) = self.queue.pop() {
                return Some(packet);
            }
            if clock.now_us() >= deadline {
                return None;
            }
            // Polling on the transport's own context would starve the
            // deliveries we are waiting for.
            self.transport.context().process_pending();
            clock.step(step);
        }
    }

    /// Check that the next packet matches `expected` exactly and is not
    /// older than the previously checked one.
    ///
    /// `addr` receives the sender's address whenever a packet was present.
    pub fn check_next_packet(&mut self, expected: &[u8], addr: Option<&mut SocketAddr>) -> bool {
        let Some(packet) = self.next_packet(self.timeout.as_millis() as u64) else {
            return false;
        };

        let timestamp_ok = self.check_timestamp(packet.packet_time_us);
        let content_ok = packet.size() == expected.len() && packet.data.as_ref() == expected;

        if let Some(addr) = addr {
            *addr = packet.addr;
        }
        content_ok && timestamp_ok
    }

    /// Verify that no packet arrives within the no-packet timeout
    pub fn check_no_packet(&self) -> bool {
        self.next_packet(self.no_packet_timeout.as_millis() as u64)
            .is_none()
    }

    // Watermark moves on every observed packet, even when the check fails.
    fn check_timestamp(&mut self, packet_timestamp: i64) -> bool {
        let mut ok = packet_timestamp != -1;
        if let Some(prev) = self.prev_packet_timestamp {
            if packet_timestamp < prev {
                ok = false;
            }
        }
        self.prev_packet_timestamp = Some(packet_timestamp);
        ok
    }

    /// How many times the socket layer has signalled it can send
    pub fn ready_to_send_count(&self) -> usize {
        self.ready_to_send_count.load(Ordering::SeqCst)
    }

    /// Packets dropped because the queue was full
    pub fn overflow_count(&self) -> usize {
        self.queue.overflowed.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.queue.packets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, RealClock, SimulatedClock};
    use crate::thread::{Context, ContextKind};
    use std::time::Instant;

    fn bound_client(ctx: &Context) -> TestClient {
        let transport = PacketTransport::new("test", ctx.handle(), RealClock::shared());
        transport.create_client("127.0.0.1:0".parse().unwrap()).unwrap();
        transport.set_writable(true);
        transport.set_receiving(true);
        TestClient::new(transport)
    }

    fn sim_client(ctx: &Context, clock: Arc<SimulatedClock>) -> TestClient {
        let transport = PacketTransport::new("sim", ctx.handle(), clock);
        transport.set_receiving(true);
        TestClient::new(transport)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5004".parse().unwrap()
    }

    #[test]
    fn test_packet_round_trip_to_self() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let mut client = bound_client(&ctx);
        let local = client.address().unwrap();

        assert_eq!(client.send_to(b"foo", local).unwrap(), 3);

        let mut addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        assert!(client.check_next_packet(b"foo", Some(&mut addr)));
        assert_eq!(addr, local);
    }

    #[test]
    fn test_round_trip_needs_only_a_bound_socket() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let transport = PacketTransport::new("plain", ctx.handle(), RealClock::shared());
        let local = transport.create_client("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut client = TestClient::new(transport.clone());

        assert_eq!(client.send_to(b"foo", local).unwrap(), 3);
        assert!(client.check_next_packet(b"foo", None));
        assert!(!transport.is_writable());
        assert!(!transport.is_receiving());
    }

    #[test]
    fn test_no_packet_when_nothing_sent() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(0);
        let client = sim_client(&ctx, clock.clone());

        let wall = Instant::now();
        assert!(client.check_no_packet());
        assert!(clock.now_ms() >= DEFAULT_NO_PACKET_MS);
        assert!(wall.elapsed() < Duration::from_millis(DEFAULT_NO_PACKET_MS as u64));
    }

    const DEFAULT_NO_PACKET_MS: i64 = crate::constants::DEFAULT_NO_PACKET_TIMEOUT_MS as i64;

    #[test]
    fn test_check_rejects_mismatch() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(0);
        let mut client = sim_client(&ctx, clock);

        client
            .transport()
            .on_read_packet(Bytes::from_static(b"bar"), peer(), 10);
        assert!(!client.check_next_packet(b"foo", None));

        client
            .transport()
            .on_read_packet(Bytes::from_static(b"foo!"), peer(), 20);
        assert!(!client.check_next_packet(b"foo", None));
    }

    #[test]
    fn test_timestamps_must_not_go_backwards() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(0);
        let mut client = sim_client(&ctx, clock);
        let transport = client.transport().clone();

        transport.on_read_packet(Bytes::from_static(b"a"), peer(), 100);
        transport.on_read_packet(Bytes::from_static(b"b"), peer(), 100);
        transport.on_read_packet(Bytes::from_static(b"c"), peer(), 50);

        assert!(client.check_next_packet(b"a", None));
        assert!(client.check_next_packet(b"b", None));
        assert!(!client.check_next_packet(b"c", None));
    }

    #[test]
    fn test_watermark_moves_on_mismatch() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(0);
        let mut client = sim_client(&ctx, clock);
        let transport = client.transport().clone();

        transport.on_read_packet(Bytes::from_static(b"wrong"), peer(), 500);
        transport.on_read_packet(Bytes::from_static(b"right"), peer(), 400);

        assert!(!client.check_next_packet(b"right", None));
        // Content matches, but 400 is older than the mismatched packet at 500.
        assert!(!client.check_next_packet(b"right", None));
    }

    #[test]
    fn test_invalid_timestamp_fails() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(0);
        let mut client = sim_client(&ctx, clock);

        client
            .transport()
            .on_read_packet(Bytes::from_static(b"foo"), peer(), -1);
        assert!(!client.check_next_packet(b"foo", None));
    }

    #[test]
    fn test_next_packet_times_out_on_simulated_clock() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(1_000_000);
        let client = sim_client(&ctx, clock.clone());

        assert!(client.next_packet(250).is_none());
        assert_eq!(clock.now_us(), 1_250_000);
    }

    #[test]
    fn test_next_packet_returns_oldest_first() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let clock = SimulatedClock::shared(0);
        let client = sim_client(&ctx, clock);
        let transport = client.transport().clone();

        transport.on_read_packet(Bytes::from_static(b"1"), peer(), 1);
        transport.on_read_packet(Bytes::from_static(b"2"), peer(), 2);

        assert_eq!(client.next_packet(0).unwrap().data.as_ref(), b"1");
        assert_eq!(client.next_packet(0).unwrap().data.as_ref(), b"2");
        assert_eq!(client.queued(), 0);
    }

    #[test]
    fn test_queue_capacity_is_bounded() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let transport = PacketTransport::new("sim", ctx.handle(), SimulatedClock::shared(0));
        transport.set_receiving(true);
        let config = TestClientConfig {
            queue_capacity: 2,
            ..TestClientConfig::default()
        };
        let client = TestClient::with_config(transport.clone(), &config);

        for i in 0..3 {
            transport.on_read_packet(Bytes::from_static(b"x"), peer(), i);
        }
        assert_eq!(client.queued(), 2);
        assert_eq!(client.overflow_count(), 1);
    }

    #[test]
    fn test_ready_to_send_counts_binds() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let transport = PacketTransport::new("rts", ctx.handle(), RealClock::shared());
        let client = TestClient::new(transport.clone());
        assert_eq!(client.ready_to_send_count(), 0);

        transport.create_client("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(client.ready_to_send_count(), 1);

        transport.create_client("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(client.ready_to_send_count(), 2);
    }

    #[test]
    fn test_polling_on_owning_context_delivers() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let transport = PacketTransport::new("own", ctx.handle(), RealClock::shared());

        let ok = ctx
            .invoke(move || {
                let local = transport.create_client("127.0.0.1:0".parse().unwrap()).unwrap();
                transport.set_writable(true);
                transport.set_receiving(true);
                let mut client = TestClient::new(transport);
                client.send_to(b"ping", local).unwrap();
                client.check_next_packet(b"ping", None)
            })
            .unwrap();

        assert!(ok);
    }
}
