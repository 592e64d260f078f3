//! Utility module
//!
//! Logging setup and socket helpers shared by discovery and the spot feed.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use crate::core::{Error, Result};

/// Installs a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to `default_filter`.
/// Calling it again is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Binds a UDP socket for receiving broadcasts or multicast.
///
/// The socket allows address reuse so several listeners can share a port,
/// and joins `group` on all interfaces when one is given.
pub fn bind_udp(bind: SocketAddr, group: Option<Ipv4Addr>) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::transport(format!("Failed to create socket for {}: {}", bind, e)))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::transport(format!("Failed to set SO_REUSEADDR on {}: {}", bind, e)))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::transport(format!("Failed to set SO_REUSEPORT on {}: {}", bind, e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::transport(format!("Failed to enable broadcast on {}: {}", bind, e)))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::transport(format!("Failed to make {} non-blocking: {}", bind, e)))?;
    socket
        .bind(&bind.into())
        .map_err(|e| Error::transport(format!("Failed to bind {}: {}", bind, e)))?;

    if let Some(group) = group {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::transport(format!("Failed to join {}: {}", group, e)))?;
    }

    UdpSocket::from_std(socket.into())
        .map_err(|e| Error::transport(format!("Failed to register socket {}: {}", bind, e)))
}

/// Binds a UDP socket for sending announcements
pub fn bind_sender() -> Result<UdpSocket> {
    bind_udp(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing("debug");
        init_tracing("info");
    }

    #[tokio::test]
    async fn test_bind_udp_loopback() {
        let receiver = bind_udp("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = bind_sender().unwrap();
        sender.send_to(b"serial=1", target).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"serial=1");
    }
}
