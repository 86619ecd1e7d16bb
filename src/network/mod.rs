//! Network subsystem: UDP packet transports for RTP and RTCP

pub mod packet_transport;
pub mod test_client;
pub mod transport;
pub mod udp;

pub use packet_transport::{
    NetworkRoute, PacketOptions, PacketTransport, ReceivedPacket, SentPacket, TransportSignals,
    TransportState, TransportStats,
};
pub use test_client::{Packet, TestClient};
pub use transport::{Component, DtlsSrtpTransport, DtlsTransport, TransportController};
pub use udp::{create_socket, SocketOption};
