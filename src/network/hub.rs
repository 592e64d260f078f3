//! Event broadcast hub
//!
//! A single task receives every event from the registry and the connection
//! managers, keeps the current state of each device, and fans events out to
//! subscribers. Subscribing, snapshotting and fan-out all happen on that task,
//! so a new subscriber sees each device exactly once in its snapshot and then
//! every later event.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::registry::RegistryHandle;
use crate::core::{ConnectionState, DeviceIdentity, DeviceKey, Error, HubConfig, Result};
use crate::protocol::{DeviceCommand, DeviceSnapshot, EventPayload, NormalizedEvent};

/// Identifies one subscription
pub type SubscriberId = u64;

/// Ordered event stream of one subscriber
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<NormalizedEvent>,
}

impl Subscription {
    /// Identifier to pass to [`HubHandle::unsubscribe`]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event; `None` once the hub dropped this subscriber or stopped
    pub async fn recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<NormalizedEvent> {
        self.rx.try_recv().ok()
    }
}

/// What the hub knows about one device
struct DeviceView {
    identity: DeviceIdentity,
    snapshot: DeviceSnapshot,
    /// Latest telemetry per slot
    telemetry: BTreeMap<(u8, u8), EventPayload>,
}

impl DeviceView {
    fn to_event(&self) -> NormalizedEvent {
        let mut snapshot = self.snapshot.clone();
        snapshot.telemetry = self.telemetry.values().cloned().collect();
        NormalizedEvent::new(self.identity.clone(), EventPayload::DeviceSnapshot(snapshot))
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<NormalizedEvent>,
}

enum HubRequest {
    Subscribe {
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    SubscriberCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle for subscribers and command senders
#[derive(Clone)]
pub struct HubHandle {
    requests: mpsc::Sender<HubRequest>,
    registry: RegistryHandle,
}

impl HubHandle {
    /// Subscribes to the event stream.
    ///
    /// The subscription starts with one `DeviceSnapshot` event per registered
    /// device, followed by incremental events.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(HubRequest::Subscribe { reply })
            .await
            .map_err(|_| Error::channel_closed("hub has stopped"))?;
        response
            .await
            .map_err(|_| Error::channel_closed("hub dropped the subscription"))
    }

    /// Ends a subscription
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<()> {
        self.requests
            .send(HubRequest::Unsubscribe { id })
            .await
            .map_err(|_| Error::channel_closed("hub has stopped"))
    }

    /// Number of live subscribers
    pub async fn subscriber_count(&self) -> Result<usize> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(HubRequest::SubscriberCount { reply })
            .await
            .map_err(|_| Error::channel_closed("hub has stopped"))?;
        response
            .await
            .map_err(|_| Error::channel_closed("hub dropped the request"))
    }

    /// Routes a command to the target device's connection manager
    pub async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        let manager = self
            .registry
            .lookup(&command.target)
            .await?
            .ok_or_else(|| Error::not_found(command.target.to_string()))?;
        tracing::debug!(
            device = %command.target,
            command = command.command.name(),
            "Routing command"
        );
        manager.execute(command.command).await
    }
}

/// Hub task state
pub struct Hub {
    ingest: mpsc::Receiver<NormalizedEvent>,
    requests: mpsc::Receiver<HubRequest>,
    devices: HashMap<DeviceKey, DeviceView>,
    subscribers: Vec<Subscriber>,
    next_id: SubscriberId,
    /// Per-subscriber queue size
    queue: usize,
}

impl Hub {
    /// Starts the hub task.
    ///
    /// The task ends once every sender of `ingest` is gone.
    pub fn spawn(
        config: &HubConfig,
        ingest: mpsc::Receiver<NormalizedEvent>,
        registry: RegistryHandle,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let hub = Hub {
            ingest,
            requests: rx,
            devices: HashMap::new(),
            subscribers: Vec::new(),
            next_id: 1,
            queue: config.subscriber_queue.max(1),
        };
        let join = tokio::spawn(hub.run());
        (
            HubHandle {
                requests: tx,
                registry,
            },
            join,
        )
    }

    async fn run(mut self) {
        let mut accepting = true;
        loop {
            tokio::select! {
                // Queued events are applied before a subscription so its
                // snapshot is current
                biased;
                event = self.ingest.recv() => match event {
                    Some(event) => self.publish(event),
                    None => break,
                },
                request = self.requests.recv(), if accepting => match request {
                    Some(request) => self.handle(request),
                    None => accepting = false,
                },
            }
        }
        tracing::debug!(subscribers = self.subscribers.len(), "Hub stopped");
    }

    fn handle(&mut self, request: HubRequest) {
        match request {
            HubRequest::Subscribe { reply } => {
                let subscription = self.subscribe();
                let _ = reply.send(subscription);
            }
            HubRequest::Unsubscribe { id } => {
                self.subscribers.retain(|s| s.id != id);
                tracing::debug!(subscriber = id, "Unsubscribed");
            }
            HubRequest::SubscriberCount { reply } => {
                let _ = reply.send(self.subscribers.len());
            }
        }
    }

    fn subscribe(&mut self) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;

        // Room for the whole snapshot on top of the normal queue
        let (tx, rx) = mpsc::channel(self.queue + self.devices.len());
        let mut views: Vec<&DeviceView> = self.devices.values().collect();
        views.sort_by(|a, b| a.identity.key().cmp(&b.identity.key()));
        for view in views {
            if tx.try_send(view.to_event()).is_err() {
                tracing::warn!(subscriber = id, "Snapshot did not fit the subscriber queue");
            }
        }

        tracing::debug!(subscriber = id, devices = self.devices.len(), "Subscribed");
        self.subscribers.push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Updates the device views and fans the event out
    fn publish(&mut self, event: NormalizedEvent) {
        self.apply(&event);

        self.subscribers.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscriber = subscriber.id, "Subscriber queue full; disconnecting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = subscriber.id, "Subscriber went away");
                false
            }
        });
    }

    fn apply(&mut self, event: &NormalizedEvent) {
        let key = event.device.key();
        match &event.payload {
            EventPayload::DeviceDiscovered {
                protocol,
                endpoint,
                model,
                nickname,
            } => {
                self.devices.insert(
                    key,
                    DeviceView {
                        identity: event.device.clone(),
                        snapshot: DeviceSnapshot {
                            protocol: *protocol,
                            endpoint: endpoint.clone(),
                            model: model.clone(),
                            nickname: nickname.clone(),
                            state: ConnectionState::Disconnected,
                            error: None,
                            telemetry: Vec::new(),
                        },
                        telemetry: BTreeMap::new(),
                    },
                );
            }
            EventPayload::DeviceRemoved { .. } => {
                self.devices.remove(&key);
            }
            EventPayload::ConnectionStateChanged { to, error, .. } => {
                if let Some(view) = self.devices.get_mut(&key) {
                    view.snapshot.state = *to;
                    view.snapshot.error = error.clone();
                }
            }
            payload => {
                let view = self.devices.get_mut(&key);
                if let (Some(slot), Some(view)) = (payload.telemetry_slot(), view) {
                    view.telemetry.insert(slot, payload.clone());
                }
            }
        }
    }
}
