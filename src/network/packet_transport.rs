//! UDP-backed packet transport
//!
//! A [`PacketTransport`] is one RTP or RTCP endpoint. It owns a UDP socket
//! once bound, tracks the writable / receiving readiness flags and publishes
//! every state change through [`TransportSignals`].
//!
//! Lifecycle: `Created -> Bound -> Writable -> Closed`. Writable and
//! receiving are readiness flags reported to observers. Neither one gates
//! the socket: a bound transport sends whatever it is asked to and forwards
//! every datagram it reads. Channels decide what to do with inbound media.
//!
//! Datagrams are read on a dedicated socket thread and handed to the owning
//! network context, so `read_packet` observers always run there.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::SharedClock;
use crate::constants::{MAX_DATAGRAM_SIZE, SOCKET_READ_TIMEOUT_MS};
use crate::error::TransportError;
use crate::network::udp::{self, SocketOption};
use crate::signal::Signal;
use crate::thread::ContextHandle;

/// Per-packet send options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketOptions {
    /// Caller supplied id echoed in the sent notification, -1 if unset
    pub packet_id: i64,
    /// Per-packet DSCP override
    pub dscp: Option<i32>,
}

impl Default for PacketOptions {
    fn default() -> Self {
        Self {
            packet_id: -1,
            dscp: None,
        }
    }
}

/// Payload of the `sent_packet` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentPacket {
    pub packet_id: i64,
    pub send_time_ms: i64,
}

/// Payload of the `read_packet` notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub data: Bytes,
    pub from: SocketAddr,
    /// Receive timestamp in microseconds, -1 when unknown
    pub packet_time_us: i64,
}

/// Route the transport is currently using
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkRoute {
    pub connected: bool,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub packet_overhead: usize,
}

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportState {
    Created,
    Bound,
    Writable,
    Closed,
}

/// Observers of a transport
#[derive(Default)]
pub struct TransportSignals {
    pub writable_state: Signal<bool>,
    pub receiving_state: Signal<bool>,
    pub ready_to_send: Signal<()>,
    pub read_packet: Signal<ReceivedPacket>,
    pub sent_packet: Signal<SentPacket>,
    pub network_route_changed: Signal<Option<NetworkRoute>>,
}

/// Transport counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
}

struct State {
    writable: bool,
    receiving: bool,
    closed: bool,
    /// A send hit WouldBlock; the next successful send signals ready-to-send
    blocked: bool,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    options: HashMap<SocketOption, i32>,
    error: Option<i32>,
    async_send: bool,
    async_delay: Duration,
    last_sent: Option<Bytes>,
    network_route: Option<NetworkRoute>,
}

/// One UDP packet endpoint
pub struct PacketTransport {
    name: String,
    context: ContextHandle,
    clock: SharedClock,
    state: Mutex<State>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_running: Arc<AtomicBool>,
    counters: Counters,
    signals: TransportSignals,
}

impl PacketTransport {
    /// Create an unbound transport owned by `context`
    pub fn new(name: impl Into<String>, context: ContextHandle, clock: SharedClock) -> Arc<Self> {
        let name = name.into();
        tracing::debug!(transport = %name, "Packet transport created");
        Arc::new(Self {
            name,
            context,
            clock,
            state: Mutex::new(State {
                writable: false,
                receiving: false,
                closed: false,
                blocked: false,
                local: None,
                remote: None,
                options: HashMap::new(),
                error: None,
                async_send: false,
                async_delay: Duration::ZERO,
                last_sent: None,
                network_route: None,
            }),
            socket: Mutex::new(None),
            reader: Mutex::new(None),
            reader_running: Arc::new(AtomicBool::new(false)),
            counters: Counters::default(),
            signals: TransportSignals::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn signals(&self) -> &TransportSignals {
        &self.signals
    }

    pub fn state(&self) -> TransportState {
        let state = self.state.lock();
        if state.closed {
            TransportState::Closed
        } else if state.writable {
            TransportState::Writable
        } else if state.local.is_some() {
            TransportState::Bound
        } else {
            TransportState::Created
        }
    }

    /// Bind a UDP socket at `local` and start reading from it.
    ///
    /// Previously set options are replayed onto the new socket. On bind
    /// failure the error is logged and returned; the transport stays usable
    /// for another attempt.
    pub fn create_client(self: &Arc<Self>, local: SocketAddr) -> Result<SocketAddr, TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed(self.name.clone()));
        }
        self.stop_reader();

        let socket = match udp::create_socket(local, Duration::from_millis(SOCKET_READ_TIMEOUT_MS)) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!(transport = %self.name, %local, "Failed to bind socket: {}", e);
                self.state.lock().error = e.raw_os_error();
                return Err(TransportError::BindFailed { addr: local, source: e });
            }
        };

        let options: Vec<(SocketOption, i32)> = self
            .state
            .lock()
            .options
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        for (option, value) in options {
            if let Err(e) = udp::apply_option(&socket, option, value) {
                tracing::warn!(transport = %self.name, ?option, value, "Failed to replay socket option: {}", e);
            }
        }

        let bound = socket.local_addr().map_err(|e| TransportError::BindFailed {
            addr: local,
            source: e,
        })?;
        let socket = Arc::new(socket);

        {
            let mut state = self.state.lock();
            state.local = Some(bound);
            state.error = None;
        }
        *self.socket.lock() = Some(socket.clone());
        self.start_reader(socket)?;

        tracing::info!(transport = %self.name, %bound, "Transport bound");
        self.signals.ready_to_send.emit(&());
        Ok(bound)
    }

    fn start_reader(self: &Arc<Self>, socket: Arc<UdpSocket>) -> Result<(), TransportError> {
        let running = self.reader_running.clone();
        running.store(true, Ordering::SeqCst);
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = thread::Builder::new()
            .name(format!("udp-rx-{}", self.name))
            .spawn(move || read_loop(socket, weak, running))
            .map_err(|e| {
                self.reader_running.store(false, Ordering::SeqCst);
                TransportError::BindFailed {
                    addr: self.local_address().unwrap_or_else(|| ([0, 0, 0, 0], 0).into()),
                    source: e,
                }
            })?;

        *self.reader.lock() = Some(handle);
        Ok(())
    }

    fn stop_reader(&self) {
        self.reader_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            // The last handle may be released on the reader thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Called by the socket layer for every inbound datagram
    pub fn on_read_packet(&self, data: Bytes, from: SocketAddr, packet_time_us: i64) {
        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        tracing::trace!(transport = %self.name, %from, len = data.len(), "Packet received");

        self.signals.read_packet.emit(&ReceivedPacket {
            data,
            from,
            packet_time_us,
        });
    }

    /// Send to the configured remote address
    pub fn send_packet(self: &Arc<Self>, data: &[u8], options: PacketOptions) -> Result<usize, TransportError> {
        let remote = self.state.lock().remote;
        self.send_packet_inner(data, remote, options)
    }

    /// Send to an explicit destination, ignoring the configured remote
    pub fn send_packet_to(
        self: &Arc<Self>,
        data: &[u8],
        dest: SocketAddr,
        options: PacketOptions,
    ) -> Result<usize, TransportError> {
        self.send_packet_inner(data, Some(dest), options)
    }

    fn send_packet_inner(
        self: &Arc<Self>,
        data: &[u8],
        dest: Option<SocketAddr>,
        options: PacketOptions,
    ) -> Result<usize, TransportError> {
        let payload = Bytes::copy_from_slice(data);

        let (async_send, delay) = {
            let mut state = self.state.lock();
            state.last_sent = Some(payload.clone());
            if state.closed {
                return Err(TransportError::Closed(self.name.clone()));
            }
            (state.async_send, state.async_delay)
        };
        let dest = dest.ok_or_else(|| TransportError::NotConnected(self.name.clone()))?;

        if async_send {
            let len = payload.len();
            let this = Arc::clone(self);
            let scheduled = self.context.post_delayed(delay, move || {
                if let Err(e) = this.send_now(&payload, dest, options) {
                    tracing::warn!(transport = %this.name, "Async send failed: {}", e);
                }
            });
            if !scheduled {
                return Err(TransportError::Closed(self.name.clone()));
            }
            return Ok(len);
        }

        self.send_now(&payload, dest, options)
    }

    fn send_now(&self, payload: &[u8], dest: SocketAddr, options: PacketOptions) -> Result<usize, TransportError> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| TransportError::NotBound(self.name.clone()))?;

        if let Some(dscp) = options.dscp {
            if let Err(e) = udp::apply_option(&socket, SocketOption::Dscp, dscp) {
                tracing::debug!(transport = %self.name, "Per-packet DSCP not applied: {}", e);
            }
        }

        match socket.send_to(payload, dest) {
            Ok(sent) => {
                let was_blocked = {
                    let mut state = self.state.lock();
                    std::mem::replace(&mut state.blocked, false)
                };
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                tracing::trace!(transport = %self.name, %dest, len = sent, "Packet sent");

                if was_blocked {
                    self.signals.ready_to_send.emit(&());
                }
                self.signals.sent_packet.emit(&SentPacket {
                    packet_id: options.packet_id,
                    send_time_ms: self.clock.now_ms(),
                });
                Ok(sent)
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.error = e.raw_os_error();
                    if e.kind() == io::ErrorKind::WouldBlock {
                        state.blocked = true;
                    }
                }
                tracing::warn!(transport = %self.name, %dest, "Send failed: {}", e);
                Err(TransportError::SendFailed(e))
            }
        }
    }

    /// Update the writable flag. Notifies only on change; returns whether it changed.
    pub fn set_writable(&self, writable: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.writable == writable || (writable && state.closed) {
                return false;
            }
            state.writable = writable;
        }
        tracing::debug!(transport = %self.name, writable, "Writable state changed");
        self.signals.writable_state.emit(&writable);
        true
    }

    /// Update the receiving flag. Notifies only on change; returns whether it changed.
    pub fn set_receiving(&self, receiving: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.receiving == receiving || (receiving && state.closed) {
                return false;
            }
            state.receiving = receiving;
        }
        tracing::debug!(transport = %self.name, receiving, "Receiving state changed");
        self.signals.receiving_state.emit(&receiving);
        true
    }

    pub fn is_writable(&self) -> bool {
        self.state.lock().writable
    }

    pub fn is_receiving(&self) -> bool {
        self.state.lock().receiving
    }

    /// Defer sends by `delay` onto the owning context
    pub fn set_async(&self, enabled: bool, delay: Duration) {
        let mut state = self.state.lock();
        state.async_send = enabled;
        state.async_delay = delay;
    }

    pub fn is_async(&self) -> bool {
        self.state.lock().async_send
    }

    /// Store an option, applying it immediately when a socket is bound
    pub fn set_option(&self, option: SocketOption, value: i32) -> Result<(), TransportError> {
        self.state.lock().options.insert(option, value);

        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            udp::apply_option(&socket, option, value).map_err(|e| {
                self.state.lock().error = e.raw_os_error();
                TransportError::SocketOption(e)
            })?;
        }
        Ok(())
    }

    /// Stored option value; `None` for options never set
    pub fn get_option(&self, option: SocketOption) -> Option<i32> {
        self.state.lock().options.get(&option).copied()
    }

    pub fn set_remote_address(&self, remote: SocketAddr) {
        self.state.lock().remote = Some(remote);
        tracing::debug!(transport = %self.name, %remote, "Remote address set");
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.state.lock().remote
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.state.lock().local
    }

    /// Replace the network route, notifying observers only on change
    pub fn set_network_route(&self, route: Option<NetworkRoute>) {
        {
            let mut state = self.state.lock();
            if state.network_route == route {
                return;
            }
            state.network_route = route;
        }
        self.signals.network_route_changed.emit(&route);
    }

    pub fn network_route(&self) -> Option<NetworkRoute> {
        self.state.lock().network_route
    }

    /// Copy of the most recent payload handed to `send_packet`
    pub fn last_sent_packet(&self) -> Option<Bytes> {
        self.state.lock().last_sent.clone()
    }

    /// Last OS error code observed on the socket
    pub fn error(&self) -> Option<i32> {
        self.state.lock().error
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Stop reading, release the socket and clear readiness flags
    pub fn close(&self) {
        if std::mem::replace(&mut self.state.lock().closed, true) {
            return;
        }
        self.set_writable_on_close();
        self.stop_reader();
        self.socket.lock().take();
        tracing::info!(transport = %self.name, "Transport closed");
    }

    fn set_writable_on_close(&self) {
        let (was_writable, was_receiving) = {
            let mut state = self.state.lock();
            (
                std::mem::replace(&mut state.writable, false),
                std::mem::replace(&mut state.receiving, false),
            )
        };
        if was_writable {
            self.signals.writable_state.emit(&false);
        }
        if was_receiving {
            self.signals.receiving_state.emit(&false);
        }
    }
}

impl Drop for PacketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Socket thread: read datagrams and hand them to the owning context
fn read_loop(socket: Arc<UdpSocket>, transport: Weak<PacketTransport>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                let packet_time_us = transport.clock.now_us();
                let data = Bytes::copy_from_slice(&buf[..len]);
                let context = transport.context.clone();
                if !context.post(move || transport.on_read_packet(data, from, packet_time_us)) {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::error!("Socket read failed: {}", e);
                }
                break;
            }
        }
    }
}
