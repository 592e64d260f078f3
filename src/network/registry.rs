//! Device registry
//!
//! The only shared state of the station: a map of device key to connection
//! manager, owned by a single actor task. Every registration and removal goes
//! through [`RegistryHandle`], so there is never more than one manager per key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::connection::{ConnectionManager, ManagerHandle, ManagerOptions, ManagerTask};
use crate::core::{Config, DeviceDescriptor, DeviceKey, Error, Result};
use crate::protocol::{EventPayload, NormalizedEvent, RemovalReason};

/// How often expiry and unreachability are checked
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Result of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First time this key was seen
    New,
    /// Already registered at the same endpoint; only last-seen was updated
    Refreshed,
    /// Registered at a different endpoint; the old manager was replaced
    Superseded,
}

/// A registered device
struct Entry {
    handle: ManagerHandle,
    task: ManagerTask,
    /// Passive devices disappear after this long without an announcement
    expiry: Option<Duration>,
    last_seen: Instant,
}

enum RegistryRequest {
    Register {
        descriptor: DeviceDescriptor,
        options: ManagerOptions,
        expiry: Option<Duration>,
        reply: oneshot::Sender<RegisterOutcome>,
    },
    Remove {
        key: DeviceKey,
        reason: RemovalReason,
        reply: oneshot::Sender<bool>,
    },
    Lookup {
        key: DeviceKey,
        reply: oneshot::Sender<Option<ManagerHandle>>,
    },
    List {
        reply: oneshot::Sender<Vec<ManagerHandle>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    requests: mpsc::Sender<RegistryRequest>,
}

impl RegistryHandle {
    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> RegistryRequest,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .await
            .map_err(|_| Error::channel_closed("registry has stopped"))?;
        response
            .await
            .map_err(|_| Error::channel_closed("registry dropped the request"))
    }

    /// Registers a device, creating its manager if the key is new.
    ///
    /// `expiry` marks a passively discovered device that is removed after
    /// that long without a further registration.
    pub async fn register(
        &self,
        descriptor: DeviceDescriptor,
        options: ManagerOptions,
        expiry: Option<Duration>,
    ) -> Result<RegisterOutcome> {
        self.call(|reply| RegistryRequest::Register {
            descriptor,
            options,
            expiry,
            reply,
        })
        .await
    }

    /// Removes a device; `false` if it was not registered
    pub async fn remove(&self, key: &DeviceKey, reason: RemovalReason) -> Result<bool> {
        let key = key.clone();
        self.call(|reply| RegistryRequest::Remove { key, reason, reply })
            .await
    }

    /// Manager of a registered device
    pub async fn lookup(&self, key: &DeviceKey) -> Result<Option<ManagerHandle>> {
        let key = key.clone();
        self.call(|reply| RegistryRequest::Lookup { key, reply }).await
    }

    /// Managers of all registered devices
    pub async fn list(&self) -> Result<Vec<ManagerHandle>> {
        self.call(|reply| RegistryRequest::List { reply }).await
    }

    /// Removes every device and stops the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| RegistryRequest::Shutdown { reply }).await
    }
}

/// Registry actor state
pub struct Registry {
    config: Arc<Config>,
    devices: HashMap<DeviceKey, Entry>,
    events: mpsc::Sender<NormalizedEvent>,
    requests: mpsc::Receiver<RegistryRequest>,
}

impl Registry {
    /// Starts the registry actor
    pub fn spawn(
        config: Arc<Config>,
        events: mpsc::Sender<NormalizedEvent>,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let registry = Registry {
            config,
            devices: HashMap::new(),
            events,
            requests: rx,
        };
        let join = tokio::spawn(registry.run());
        (RegistryHandle { requests: tx }, join)
    }

    async fn run(mut self) {
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(RegistryRequest::Shutdown { reply }) => {
                        self.remove_all().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => {
                        self.remove_all().await;
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }
        tracing::debug!("Registry stopped");
    }

    async fn handle(&mut self, request: RegistryRequest) {
        match request {
            RegistryRequest::Register {
                descriptor,
                options,
                expiry,
                reply,
            } => {
                let outcome = self.register(descriptor, options, expiry).await;
                let _ = reply.send(outcome);
            }
            RegistryRequest::Remove { key, reason, reply } => {
                let removed = self.remove(&key, reason).await;
                let _ = reply.send(removed);
            }
            RegistryRequest::Lookup { key, reply } => {
                let _ = reply.send(self.devices.get(&key).map(|e| e.handle.clone()));
            }
            RegistryRequest::List { reply } => {
                let _ = reply.send(self.devices.values().map(|e| e.handle.clone()).collect());
            }
            RegistryRequest::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn register(
        &mut self,
        descriptor: DeviceDescriptor,
        options: ManagerOptions,
        expiry: Option<Duration>,
    ) -> RegisterOutcome {
        let key = descriptor.key();
        let mut outcome = RegisterOutcome::New;

        if let Some(entry) = self.devices.get_mut(&key) {
            let current = entry.handle.descriptor();
            if current.endpoint == descriptor.endpoint && current.protocol == descriptor.protocol {
                entry.last_seen = Instant::now();
                entry.handle.announced();
                tracing::trace!(device = %key, "Device refreshed");
                return RegisterOutcome::Refreshed;
            }
            tracing::info!(
                device = %key,
                old = %current.endpoint,
                new = %descriptor.endpoint,
                "Device endpoint changed; replacing manager"
            );
            self.remove(&key, RemovalReason::Superseded).await;
            outcome = RegisterOutcome::Superseded;
        }

        tracing::info!(
            device = %key,
            protocol = ?descriptor.protocol,
            endpoint = %descriptor.endpoint,
            "Device registered"
        );
        self.emit(
            &descriptor,
            EventPayload::DeviceDiscovered {
                protocol: descriptor.protocol,
                endpoint: descriptor.endpoint.clone(),
                model: descriptor.model.clone(),
                nickname: descriptor.nickname.clone(),
            },
        )
        .await;

        let (handle, task) =
            ConnectionManager::spawn(descriptor, &self.config, options, self.events.clone());
        self.devices.insert(
            key,
            Entry {
                handle,
                task,
                expiry,
                last_seen: Instant::now(),
            },
        );
        outcome
    }

    async fn remove(&mut self, key: &DeviceKey, reason: RemovalReason) -> bool {
        let Some(entry) = self.devices.remove(key) else {
            return false;
        };
        tracing::info!(device = %key, ?reason, "Removing device");
        entry.task.stop(self.config.timeouts.shutdown_grace).await;
        self.emit(entry.handle.descriptor(), EventPayload::DeviceRemoved { reason })
            .await;
        true
    }

    async fn remove_all(&mut self) {
        let keys: Vec<DeviceKey> = self.devices.keys().cloned().collect();
        for key in keys {
            self.remove(&key, RemovalReason::Shutdown).await;
        }
    }

    /// Drops expired passive devices and devices unreachable for too long
    async fn sweep(&mut self) {
        let unreachable_timeout = self.config.unreachable_timeout;
        let mut doomed = Vec::new();
        for (key, entry) in &self.devices {
            if entry.expiry.is_some_and(|expiry| entry.last_seen.elapsed() >= expiry) {
                doomed.push((key.clone(), RemovalReason::Expired));
                continue;
            }
            let unreachable_for = entry.handle.status().unreachable_since.map(|s| s.elapsed());
            if let (Some(limit), Some(elapsed)) = (unreachable_timeout, unreachable_for) {
                if elapsed >= limit {
                    doomed.push((key.clone(), RemovalReason::Unreachable));
                }
            }
        }
        for (key, reason) in doomed {
            self.remove(&key, reason).await;
        }
    }

    async fn emit(&self, descriptor: &DeviceDescriptor, payload: EventPayload) {
        let event = NormalizedEvent::new(descriptor.identity.clone(), payload);
        if self.events.send(event).await.is_err() {
            tracing::trace!("Hub gone; registry event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionState, Protocol};
    use tokio::time::timeout;

    fn manual() -> ManagerOptions {
        ManagerOptions {
            auto_connect: false,
            passive: true,
        }
    }

    fn spawn(config: Config) -> (RegistryHandle, mpsc::Receiver<NormalizedEvent>) {
        let (events, rx) = mpsc::channel(256);
        let (handle, _join) = Registry::spawn(Arc::new(config), events);
        (handle, rx)
    }

    /// Next registry event, skipping connection state changes
    async fn next_lifecycle(rx: &mut mpsc::Receiver<NormalizedEvent>) -> NormalizedEvent {
        loop {
            let event = timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for a registry event")
                .expect("event channel closed");
            if !matches!(event.payload, EventPayload::ConnectionStateChanged { .. }) {
                return event;
            }
        }
    }

    fn removal_reason(event: &NormalizedEvent) -> Option<RemovalReason> {
        match event.payload {
            EventPayload::DeviceRemoved { reason } => Some(reason),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_one_manager() {
        let (registry, mut rx) = spawn(Config::default());
        let descriptor = DeviceDescriptor::direct(Protocol::Rotctld, "127.0.0.1:1");

        let first = registry
            .register(descriptor.clone(), manual(), None)
            .await
            .unwrap();
        assert_eq!(first, RegisterOutcome::New);
        for _ in 0..3 {
            let again = registry
                .register(descriptor.clone(), manual(), None)
                .await
                .unwrap();
            assert_eq!(again, RegisterOutcome::Refreshed);
        }

        assert_eq!(registry.list().await.unwrap().len(), 1);
        let discovered = next_lifecycle(&mut rx).await;
        assert!(matches!(discovered.payload, EventPayload::DeviceDiscovered { .. }));
        assert_eq!(discovered.device, descriptor.identity);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_endpoint_supersedes() {
        let (registry, mut rx) = spawn(Config::default());
        let mut descriptor = DeviceDescriptor::direct(Protocol::AntennaSwitch, "127.0.0.1:1");
        descriptor.identity.address = "AG-0042".into();
        registry.register(descriptor.clone(), manual(), None).await.unwrap();

        let mut moved = descriptor.clone();
        moved.endpoint = "127.0.0.1:2".into();
        let outcome = registry.register(moved, manual(), None).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Superseded);

        let first = next_lifecycle(&mut rx).await;
        assert!(matches!(first.payload, EventPayload::DeviceDiscovered { .. }));
        let removed = next_lifecycle(&mut rx).await;
        assert_eq!(removal_reason(&removed), Some(RemovalReason::Superseded));
        let replaced = next_lifecycle(&mut rx).await;
        match replaced.payload {
            EventPayload::DeviceDiscovered { endpoint, .. } => assert_eq!(endpoint, "127.0.0.1:2"),
            other => panic!("unexpected {:?}", other),
        }

        let handle = registry.lookup(&descriptor.key()).await.unwrap().unwrap();
        assert_eq!(handle.descriptor().endpoint, "127.0.0.1:2");
    }

    #[tokio::test]
    async fn test_passive_device_expires() {
        let (registry, mut rx) = spawn(Config::default());
        let descriptor = DeviceDescriptor::direct(Protocol::SmartSdr, "127.0.0.1:1");
        registry
            .register(descriptor.clone(), manual(), Some(Duration::from_millis(300)))
            .await
            .unwrap();

        next_lifecycle(&mut rx).await;
        let removed = next_lifecycle(&mut rx).await;
        assert_eq!(removal_reason(&removed), Some(RemovalReason::Expired));
        assert!(registry.lookup(&descriptor.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_device_removed() {
        let mut config = Config::default();
        config.unreachable_timeout = Some(Duration::from_millis(300));
        config.reconnect.initial_delay = Duration::from_millis(50);
        config.reconnect.jitter = 0.0;
        let (registry, mut rx) = spawn(config);

        // Nothing listens on a freshly released port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let descriptor = DeviceDescriptor::direct(Protocol::Amplifier, addr);
        registry
            .register(descriptor.clone(), ManagerOptions::default(), None)
            .await
            .unwrap();

        next_lifecycle(&mut rx).await;
        let removed = next_lifecycle(&mut rx).await;
        assert_eq!(removal_reason(&removed), Some(RemovalReason::Unreachable));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_shutdown() {
        let (registry, mut rx) = spawn(Config::default());
        let rotator = DeviceDescriptor::direct(Protocol::Rotctld, "127.0.0.1:1");
        let amplifier = DeviceDescriptor::direct(Protocol::Amplifier, "127.0.0.1:2");
        registry.register(rotator.clone(), manual(), None).await.unwrap();
        registry.register(amplifier.clone(), manual(), None).await.unwrap();

        let handle = registry.lookup(&rotator.key()).await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        assert!(registry.remove(&rotator.key(), RemovalReason::Requested).await.unwrap());
        assert!(!registry.remove(&rotator.key(), RemovalReason::Requested).await.unwrap());

        registry.shutdown().await.unwrap();
        let mut reasons = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Some(reason) = removal_reason(&event) {
                reasons.push((event.device.key(), reason));
            }
        }
        assert_eq!(
            reasons,
            vec![
                (rotator.key(), RemovalReason::Requested),
                (amplifier.key(), RemovalReason::Shutdown),
            ]
        );
        tokio_test::assert_err!(registry.list().await);
    }
}
