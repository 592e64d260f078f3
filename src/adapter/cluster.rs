//! DX cluster spot feed over UDP multicast
//!
//! Read-only: every command is refused. The endpoint is `group:port`; a
//! non-multicast address is bound directly, which is how loopback feeds work.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio_util::codec::Decoder;

use super::{not_connected, Adapter, LinkStats};
use crate::codec::spot::parse_spot_line;
use crate::codec::{Decoded, LineCodec};
use crate::core::{Error, Result, MAX_DATAGRAM_SIZE};
use crate::protocol::{Command, EventPayload};
use crate::util::bind_udp;

/// Cluster spot adapter
#[derive(Debug)]
pub struct ClusterAdapter {
    endpoint: String,
    stats: Arc<LinkStats>,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
    pending: VecDeque<EventPayload>,
    last_activity: Instant,
}

impl ClusterAdapter {
    /// Creates a closed adapter
    pub fn new(endpoint: String, stats: Arc<LinkStats>) -> Self {
        ClusterAdapter {
            endpoint,
            stats,
            socket: None,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Bound address, once connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(datagram);
        loop {
            let decoded = match codec.decode_eof(&mut buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) | Err(_) => break,
            };
            let line = match decoded {
                Decoded::Item(line) => line,
                Decoded::Malformed(reason) => {
                    self.stats.record_decode_error();
                    tracing::debug!(endpoint = %self.endpoint, %reason, "Dropped spot line");
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_spot_line(&line) {
                Ok(spot) => {
                    self.stats.record_message();
                    self.pending.push_back(EventPayload::SpotReceived(spot));
                }
                Err(e) => {
                    self.stats.record_decode_error();
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        error = %e,
                        %line,
                        "Dropped spot line"
                    );
                }
            }
        }
    }
}

impl Adapter for ClusterAdapter {
    async fn connect(&mut self) -> Result<()> {
        let addr: SocketAddrV4 = self
            .endpoint
            .parse()
            .map_err(|e| {
                Error::transport(format!("Invalid spot feed address {}: {}", self.endpoint, e))
            })?;
        let socket = if addr.ip().is_multicast() {
            bind_udp(
                SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port())),
                Some(*addr.ip()),
            )?
        } else {
            bind_udp(SocketAddr::V4(addr), None)?
        };
        self.socket = Some(socket);
        self.stats.record_connect();
        self.last_activity = Instant::now();
        tracing::info!(endpoint = %self.endpoint, local = ?self.local_addr(), "Spot feed open");
        Ok(())
    }

    async fn start_monitoring(&mut self) -> Result<()> {
        match self.socket {
            Some(_) => Ok(()),
            None => Err(not_connected(&self.endpoint)),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.socket = None;
        self.pending.clear();
        Ok(())
    }

    async fn send_command(&mut self, _command: &Command) -> Result<()> {
        Err(Error::validation("cluster spot feeds are read-only"))
    }

    async fn next_event(&mut self) -> Result<EventPayload> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let socket = self
                .socket
                .as_ref()
                .ok_or_else(|| not_connected(&self.endpoint))?;
            let (len, from) = socket
                .recv_from(&mut self.buf)
                .await
                .map_err(|e| {
                    Error::transport(format!("Spot feed {} failed: {}", self.endpoint, e))
                })?;
            self.last_activity = Instant::now();
            tracing::trace!(endpoint = %self.endpoint, %from, len, "Spot datagram");
            let datagram = self.buf[..len].to_vec();
            self.handle_datagram(&datagram);
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn stall_timeout(&self) -> Option<Duration> {
        None
    }
}
