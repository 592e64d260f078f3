//! Discovery re-broadcaster for devices reachable only over a routed VPN.
//!
//! Such devices never see or send LAN broadcasts, so this periodically sends
//! an announcement on their behalf to a local broadcast address, where
//! ordinary discovery clients (including our own listeners) pick it up.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::announce::encode_announcement;
use crate::core::{BroadcasterConfig, Result};
use crate::util::bind_sender;

/// Periodic announcement sender
pub struct Broadcaster {
    config: BroadcasterConfig,
    socket: UdpSocket,
    /// Encoded once; the announced devices do not change
    datagrams: Vec<Bytes>,
}

impl Broadcaster {
    /// Binds the sending socket and encodes the announcements
    pub fn new(config: BroadcasterConfig) -> Result<Self> {
        let socket = bind_sender()?;
        let datagrams = config
            .devices
            .iter()
            .map(|device| encode_announcement(config.protocol, device))
            .collect();
        Ok(Broadcaster {
            config,
            socket,
            datagrams,
        })
    }

    /// Destination of the announcements
    pub fn target(&self) -> SocketAddr {
        self.config.target
    }

    /// Sends one round of announcements, returning how many went out
    pub async fn announce(&self) -> usize {
        let mut sent = 0;
        for datagram in &self.datagrams {
            match self.socket.send_to(datagram, self.config.target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(
                        target_addr = %self.config.target,
                        error = %e,
                        "Failed to send announcement"
                    )
                }
            }
        }
        sent
    }

    /// Announces every `interval` until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            protocol = ?self.config.protocol,
            target_addr = %self.config.target,
            devices = self.datagrams.len(),
            "Broadcaster started"
        );
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sent = self.announce().await;
                    tracing::trace!(sent, "Announcements sent");
                }
            }
        }
        tracing::debug!(target_addr = %self.config.target, "Broadcaster stopped");
    }
}
