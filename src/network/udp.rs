//! UDP socket creation and option handling

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Socket options a packet transport remembers and replays on bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketOption {
    ReceiveBuffer,
    SendBuffer,
    /// DiffServ code point, written into the upper six bits of TOS / TCLASS
    Dscp,
    Ttl,
}

/// Create a UDP socket bound to `addr`.
///
/// The read timeout lets the receive thread notice shutdown without a
/// wake-up datagram.
pub fn create_socket(addr: SocketAddr, read_timeout: Duration) -> io::Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_read_timeout(Some(read_timeout))?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

/// Apply one option to a bound socket
pub fn apply_option(socket: &UdpSocket, option: SocketOption, value: i32) -> io::Result<()> {
    if value < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("negative value {} for {:?}", value, option),
        ));
    }
    let sock = SockRef::from(socket);
    let is_v6 = socket.local_addr()?.is_ipv6();

    match option {
        SocketOption::ReceiveBuffer => sock.set_recv_buffer_size(value as usize),
        SocketOption::SendBuffer => sock.set_send_buffer_size(value as usize),
        SocketOption::Dscp => {
            if is_v6 {
                tracing::debug!("DSCP not applied on IPv6 socket");
                Ok(())
            } else {
                sock.set_tos((value as u32) << 2)
            }
        }
        SocketOption::Ttl => {
            if is_v6 {
                sock.set_unicast_hops_v6(value as u32)
            } else {
                sock.set_ttl(value as u32)
            }
        }
    }
}

/// Read an option back from the socket, for diagnostics
pub fn read_option(socket: &UdpSocket, option: SocketOption) -> io::Result<i32> {
    let sock = SockRef::from(socket);
    let is_v6 = socket.local_addr()?.is_ipv6();

    let value = match option {
        SocketOption::ReceiveBuffer => sock.recv_buffer_size()? as i32,
        SocketOption::SendBuffer => sock.send_buffer_size()? as i32,
        SocketOption::Dscp if is_v6 => 0,
        SocketOption::Dscp => (sock.tos()? >> 2) as i32,
        SocketOption::Ttl if is_v6 => sock.unicast_hops_v6()? as i32,
        SocketOption::Ttl => sock.ttl()? as i32,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_socket_binds_ephemeral_port() {
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let first = create_socket("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        let taken = first.local_addr().unwrap();
        assert!(create_socket(taken, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_ttl_option_applies() {
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        apply_option(&socket, SocketOption::Ttl, 17).unwrap();
        assert_eq!(read_option(&socket, SocketOption::Ttl).unwrap(), 17);
    }

    #[test]
    fn test_negative_value_rejected() {
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        assert!(apply_option(&socket, SocketOption::SendBuffer, -1).is_err());
    }
}
