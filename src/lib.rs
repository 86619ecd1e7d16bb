//! # RTC Session Engine
//!
//! Thread-affine media-session engine: audio/video channels carried over
//! RTP/RTCP UDP transport pairs, driven from three dedicated execution
//! contexts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           SessionEngine (engine)                             │
//! │                                                                             │
//! │   caller thread ──► Dispatcher::run_on(kind, f)  (inline if already there)  │
//! │                                                                             │
//! │  ┌────────────────────┐   ┌────────────────────┐   ┌────────────────────┐   │
//! │  │ Signaling context  │   │   Worker context   │   │  Network context   │   │
//! │  │  ctx-signaling     │   │   ctx-worker       │   │   ctx-network      │   │
//! │  │                    │   │                    │   │                    │   │
//! │  │  TransceiverList   │──►│  ChannelRegistry   │──►│ TransportController│   │
//! │  │  add_transceiver   │   │  SsrcGenerator     │   │  DtlsSrtpTransport │   │
//! │  │                    │   │  Call / EventLog   │   │   ├─ RTP  endpoint │   │
//! │  │                    │   │  negotiation       │   │   └─ RTCP endpoint │   │
//! │  └────────────────────┘   └────────────────────┘   └─────────┬──────────┘   │
//! │                                                              │              │
//! └──────────────────────────────────────────────────────────────┼──────────────┘
//!                                                                │
//!                     ┌──────────────────────────────────────────┴───────┐
//!                     │ PacketTransport (network::packet_transport)      │
//!                     │   socket2 UDP socket + udp-rx-<name> thread      │
//!                     │   writable / receiving / ready-to-send signals   │
//!                     │   sync or delayed (post_delayed) sends           │
//!                     └──────────────────────────────────────────────────┘
//!                                         │ UDP
//!                                         ▼
//!                     ┌──────────────────────────────────────────────────┐
//!                     │ TestClient: FIFO of received packets, polled in  │
//!                     │ 1 ms clock steps (wall clock or SimulatedClock)  │
//!                     └──────────────────────────────────────────────────┘
//! ```
//!
//! Every public [`SessionEngine`](engine::SessionEngine) operation returns a
//! [`Result`]; [`StatusCode`] gives the flat integer view of the outcome.

pub mod call;
pub mod channel;
pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod network;
pub mod signal;
pub mod thread;
pub mod transceiver;

pub use engine::{EngineStats, SessionEngine};
pub use error::{Error, Result, StatusCode};

/// Application-wide constants
pub mod constants {
    /// Delay applied to sends when a transport runs in async mode
    pub const DEFAULT_ASYNC_SEND_DELAY_MS: u64 = 1;

    /// How long a test client waits for an expected packet
    pub const DEFAULT_PACKET_TIMEOUT_MS: u64 = 5_000;

    /// How long a test client waits before declaring "no packet"
    pub const DEFAULT_NO_PACKET_TIMEOUT_MS: u64 = 1_000;

    /// Packets a test client queues before dropping new ones
    pub const MAX_QUEUED_PACKETS: usize = 1024;

    /// Clock step used by packet polling loops
    pub const POLL_STEP_MS: u64 = 1;

    /// Largest datagram a transport reads
    pub const MAX_DATAGRAM_SIZE: usize = 65_536;

    /// Socket read timeout; bounds how long a reader thread takes to notice shutdown
    pub const SOCKET_READ_TIMEOUT_MS: u64 = 20;

    /// Local address the demo binary binds to
    pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
}
