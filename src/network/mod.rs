//! Device discovery, connection management and event distribution
//!
//! [`Station`] wires the pieces together: discovery feeds the registry, the
//! registry owns one connection manager per device, and every manager
//! publishes into the hub that subscribers read from.

mod broadcaster;
mod connection;
mod discovery;
mod hub;
mod registry;

pub use self::broadcaster::Broadcaster;
pub use self::connection::{
    ConnectionManager, ManagerHandle, ManagerOptions, ManagerStatus, ManagerTask,
};
pub use self::discovery::{register_endpoint, DiscoveryListener, DiscoveryStats};
pub use self::hub::{Hub, HubHandle, SubscriberId, Subscription};
pub use self::registry::{RegisterOutcome, Registry, RegistryHandle};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{Config, Protocol, Result};

/// A running station core
pub struct Station {
    config: Arc<Config>,
    registry: RegistryHandle,
    hub: HubHandle,
    /// Stops listeners and broadcasters
    cancel: CancellationToken,
    /// Listener and broadcaster tasks
    tasks: Vec<JoinHandle<()>>,
    registry_task: JoinHandle<()>,
    hub_task: JoinHandle<()>,
    listeners: Vec<(Protocol, Arc<DiscoveryStats>)>,
}

impl Station {
    /// Starts the station from a configuration.
    ///
    /// Configured endpoints are registered and connected immediately. A
    /// listener or broadcaster that cannot bind is logged and skipped.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let (ingest_tx, ingest_rx) = mpsc::channel(config.hub.ingest_queue);
        let (registry, registry_task) = Registry::spawn(Arc::clone(&config), ingest_tx);
        let (hub, hub_task) = Hub::spawn(&config.hub, ingest_rx, registry.clone());
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut listeners = Vec::new();

        for listener_config in &config.listeners {
            let protocol = listener_config.protocol;
            match DiscoveryListener::bind(listener_config.clone(), registry.clone()) {
                Ok(listener) => {
                    listeners.push((protocol, listener.stats()));
                    tasks.push(tokio::spawn(listener.run(cancel.child_token())));
                }
                Err(e) => {
                    tracing::warn!(
                        ?protocol,
                        bind = %listener_config.bind,
                        error = %e,
                        "Discovery listener disabled"
                    )
                }
            }
        }

        for broadcaster_config in &config.broadcasters {
            match Broadcaster::new(broadcaster_config.clone()) {
                Ok(broadcaster) => tasks.push(tokio::spawn(broadcaster.run(cancel.child_token()))),
                Err(e) => {
                    tracing::warn!(
                        target_addr = %broadcaster_config.target,
                        error = %e,
                        "Broadcaster disabled"
                    )
                }
            }
        }

        for endpoint in &config.endpoints {
            register_endpoint(&registry, endpoint).await?;
        }

        tracing::info!(
            endpoints = config.endpoints.len(),
            listeners = listeners.len(),
            broadcasters = config.broadcasters.len(),
            "Station started"
        );
        Ok(Station {
            config,
            registry,
            hub,
            cancel,
            tasks,
            registry_task,
            hub_task,
            listeners,
        })
    }

    /// Subscription and command entry point
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Device registry
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counters of the running discovery listeners
    pub fn discovery_stats(&self) -> &[(Protocol, Arc<DiscoveryStats>)] {
        &self.listeners
    }

    /// Stops discovery, removes every device and waits for the hub to drain.
    ///
    /// Subscriptions end after their final `DeviceRemoved` events.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }

        if let Err(e) = self.registry.shutdown().await {
            tracing::debug!(error = %e, "Registry already stopped");
        }
        let grace = self.config.timeouts.shutdown_grace;
        if timeout(grace, self.registry_task).await.is_err() {
            tracing::warn!("Registry did not stop in time");
        }
        if timeout(grace, self.hub_task).await.is_err() {
            tracing::warn!("Hub did not stop in time");
        }
        tracing::info!("Station stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::amplifier::fake::{serve_one, Behaviour};
    use crate::adapter::testing::listener;
    use crate::core::{
        AnnouncedDevice, BroadcasterConfig, ConnectionState, DeviceKey, EndpointConfig,
        ListenerConfig,
    };
    use crate::protocol::{
        AmplifierMode, Command, DeviceCommand, EventPayload, NormalizedEvent, RemovalReason,
    };
    use std::time::Duration;
    use tokio_test::assert_ok;

    async fn next(sub: &mut Subscription) -> NormalizedEvent {
        timeout(Duration::from_secs(3), sub.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_station_end_to_end() {
        let (device, addr) = listener().await;
        tokio::spawn(async move {
            serve_one(&device, Behaviour::Stream { period: Duration::from_millis(20) }).await
        });

        let mut config = Config::default();
        config.endpoints.push(EndpointConfig {
            protocol: Protocol::Amplifier,
            address: addr.clone(),
            nickname: Some("PA".into()),
        });
        let station = Station::start(config).await.unwrap();
        let mut sub = station.hub().subscribe().await.unwrap();

        // Telemetry arrives once the amplifier is monitored
        loop {
            if let EventPayload::AmplifierStatus(status) = next(&mut sub).await.payload {
                if status.forward_power_w > 0.0 {
                    break;
                }
            }
        }

        let key = DeviceKey::new(crate::core::DeviceFamily::Amplifier, addr);
        let handle = station.registry().lookup(&key).await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Monitoring);
        assert_eq!(handle.descriptor().nickname.as_deref(), Some("PA"));
        station
            .hub()
            .send_command(DeviceCommand::new(
                key.clone(),
                Command::SetAmplifierMode { mode: AmplifierMode::Operate },
            ))
            .await
            .unwrap();

        assert_ok!(station.shutdown().await);
        let mut removed = None;
        while let Some(event) = sub.recv().await {
            if let EventPayload::DeviceRemoved { reason } = event.payload {
                removed = Some((event.device.key(), reason));
            }
        }
        assert_eq!(removed, Some((key, RemovalReason::Shutdown)));
    }

    #[tokio::test]
    async fn test_broadcast_is_discovered_by_listener() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let bind: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let mut config = Config::default();
        config.listeners.push(ListenerConfig {
            protocol: Protocol::SmartSdr,
            bind,
            multicast_group: None,
            expiry: Duration::from_secs(10),
            auto_connect: false,
        });
        config.broadcasters.push(BroadcasterConfig {
            protocol: Protocol::SmartSdr,
            target: bind,
            interval: Duration::from_millis(50),
            devices: vec![AnnouncedDevice {
                serial: "1715-4055-6600-9722".into(),
                ip: "10.8.0.20".parse().unwrap(),
                port: None,
                model: Some("FLEX-6600".into()),
                nickname: None,
            }],
        });

        let station = Station::start(config).await.unwrap();
        let mut sub = station.hub().subscribe().await.unwrap();
        let event = loop {
            let event = next(&mut sub).await;
            if matches!(
                event.payload,
                EventPayload::DeviceDiscovered { .. } | EventPayload::DeviceSnapshot(_)
            ) {
                break event;
            }
        };
        assert_eq!(event.device.address, "1715-4055-6600-9722");

        // Repeated announcements do not add devices
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(station.registry().list().await.unwrap().len(), 1);
        let stats = &station.discovery_stats()[0].1;
        assert!(stats.announcements() >= 2);
        assert_eq!(stats.malformed(), 0);

        station.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let mut config = Config::default();
        config.hub.subscriber_queue = 0;
        assert!(Station::start(config).await.is_err());
    }
}
