use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::connection::ManagerOptions;
use super::registry::{RegisterOutcome, RegistryHandle};
use crate::codec::announce::parse_announcement;
use crate::core::{DeviceDescriptor, EndpointConfig, ListenerConfig, Result, MAX_DATAGRAM_SIZE};
use crate::util::bind_udp;

/// Counters of one discovery listener
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    datagrams: AtomicU64,
    malformed: AtomicU64,
    announcements: AtomicU64,
}

impl DiscoveryStats {
    /// Datagrams received
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    /// Datagrams that were not valid announcements
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Valid announcements handed to the registry
    pub fn announcements(&self) -> u64 {
        self.announcements.load(Ordering::Relaxed)
    }
}

/// Passive listener for one protocol's announcements
pub struct DiscoveryListener {
    config: ListenerConfig,
    socket: UdpSocket,
    registry: RegistryHandle,
    stats: Arc<DiscoveryStats>,
    buf: Vec<u8>,
}

impl DiscoveryListener {
    /// Binds the listener socket
    pub fn bind(config: ListenerConfig, registry: RegistryHandle) -> Result<Self> {
        let socket = bind_udp(config.bind, config.multicast_group)?;
        Ok(DiscoveryListener {
            config,
            socket,
            registry,
            stats: Arc::new(DiscoveryStats::default()),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Counters, shared with the running listener
    pub fn stats(&self) -> Arc<DiscoveryStats> {
        Arc::clone(&self.stats)
    }

    /// Receives announcements until cancelled or the registry stops
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            protocol = ?self.config.protocol,
            bind = ?self.local_addr(),
            "Discovery listener started"
        );
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut self.buf) => received,
            };
            let (len, from) = match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(
                        protocol = ?self.config.protocol,
                        error = %e,
                        "Discovery receive failed"
                    );
                    continue;
                }
            };
            self.stats.datagrams.fetch_add(1, Ordering::Relaxed);

            let datagram = &self.buf[..len];
            let announcement = match parse_announcement(self.config.protocol, datagram, from.ip()) {
                Ok(announcement) => announcement,
                Err(e) => {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        protocol = ?self.config.protocol,
                        %from,
                        error = %e,
                        "Dropped announcement"
                    );
                    continue;
                }
            };
            self.stats.announcements.fetch_add(1, Ordering::Relaxed);

            let options = ManagerOptions {
                auto_connect: self.config.auto_connect,
                passive: true,
            };
            let registered = self
                .registry
                .register(announcement.into_descriptor(), options, Some(self.config.expiry))
                .await;
            if let Err(e) = registered {
                tracing::debug!(error = %e, "Registry gone; stopping discovery listener");
                break;
            }
        }
        tracing::debug!(protocol = ?self.config.protocol, "Discovery listener stopped");
    }
}

/// Registers a manually configured endpoint and starts connecting to it
pub async fn register_endpoint(
    registry: &RegistryHandle,
    endpoint: &EndpointConfig,
) -> Result<RegisterOutcome> {
    let mut descriptor = DeviceDescriptor::direct(endpoint.protocol, endpoint.resolved_address());
    descriptor.nickname = endpoint.nickname.clone();
    registry
        .register(descriptor, ManagerOptions::default(), None)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Config, Protocol};
    use crate::network::registry::Registry;
    use crate::protocol::{EventPayload, NormalizedEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn listener_config(protocol: Protocol) -> ListenerConfig {
        ListenerConfig {
            protocol,
            bind: "127.0.0.1:0".parse().unwrap(),
            multicast_group: None,
            expiry: Duration::from_secs(30),
            auto_connect: false,
        }
    }

    async fn start(
        protocol: Protocol,
    ) -> (RegistryHandle, mpsc::Receiver<NormalizedEvent>, SocketAddr, Arc<DiscoveryStats>) {
        let (events, rx) = mpsc::channel(64);
        let (registry, _) = Registry::spawn(Arc::new(Config::default()), events);
        let listener = DiscoveryListener::bind(listener_config(protocol), registry.clone()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats();
        tokio::spawn(listener.run(CancellationToken::new()));
        (registry, rx, addr, stats)
    }

    async fn wait_for_announcements(stats: &DiscoveryStats, datagrams: u64) {
        timeout(Duration::from_secs(2), async {
            while stats.datagrams() < datagrams {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("datagrams not received");
    }

    #[tokio::test]
    async fn test_duplicates_register_one_device() {
        let (registry, mut rx, addr, stats) = start(Protocol::AntennaSwitch).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            sender
                .send_to(b"serial=AG-0042 ip=127.0.0.1 port=6800 model=8x2", addr)
                .await
                .unwrap();
        }
        sender.send_to(b"serial=AG-0099 ip=127.0.0.1 port=6801", addr).await.unwrap();
        wait_for_announcements(&stats, 4).await;

        // Give the registry time to finish the last registration
        timeout(Duration::from_secs(2), async {
            while registry.list().await.unwrap().len() < 2 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut discovered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::DeviceDiscovered { endpoint, model, .. } = event.payload {
                discovered.push((event.device.address, endpoint, model));
            }
        }
        assert_eq!(
            discovered,
            vec![
                ("AG-0042".to_string(), "127.0.0.1:6800".to_string(), Some("8x2".to_string())),
                ("AG-0099".to_string(), "127.0.0.1:6801".to_string(), None),
            ]
        );
        assert_eq!(stats.announcements(), 4);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_counted() {
        let (registry, _rx, addr, stats) = start(Protocol::Amplifier).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"\xff\xfe\xfd", addr).await.unwrap();
        sender.send_to(b"hello there", addr).await.unwrap();
        sender.send_to(b"serial=KPA-7 port=50000", addr).await.unwrap();
        wait_for_announcements(&stats, 3).await;

        assert_eq!(stats.malformed(), 2);
        assert_eq!(stats.announcements(), 1);
        timeout(Duration::from_secs(2), async {
            while registry.list().await.unwrap().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let devices = registry.list().await.unwrap();
        // The datagram source fills in the missing ip
        assert_eq!(devices[0].descriptor().endpoint, "127.0.0.1:50000");
    }

    #[tokio::test]
    async fn test_register_endpoint_uses_default_port() {
        let (events, _rx) = mpsc::channel(64);
        let (registry, _) = Registry::spawn(Arc::new(Config::default()), events);
        let endpoint = EndpointConfig {
            protocol: Protocol::Rotctld,
            address: "127.0.0.1".into(),
            nickname: Some("Tower".into()),
        };
        assert_eq!(register_endpoint(&registry, &endpoint).await.unwrap(), RegisterOutcome::New);
        assert_eq!(register_endpoint(&registry, &endpoint).await.unwrap(), RegisterOutcome::Refreshed);

        let devices = registry.list().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].descriptor().endpoint, "127.0.0.1:4533");
        assert_eq!(devices[0].descriptor().nickname.as_deref(), Some("Tower"));
        registry.shutdown().await.unwrap();
    }
}
