//! Protocol adapters
//!
//! One adapter per wire protocol. Each owns its device's transport and
//! translates between the wire format and the common event/command
//! vocabulary. The connection manager only ever talks to [`DeviceAdapter`].
//!
//! ```text
//! DeviceAdapter
//!   SmartSdr(SmartSdrAdapter)       radio, meta-command text over TCP
//!   JsonCat(JsonCatAdapter)         radio, newline-delimited JSON over TCP
//!   Rotator(RotatorAdapter)         rotctld text over TCP
//!   AntennaSwitch(AntennaAdapter)   binary frames over TCP
//!   Amplifier(AmplifierAdapter)     binary frames over TCP
//!   Cluster(ClusterAdapter)         spot lines over UDP multicast
//! ```
//!
//! Adapters buffer events that arrive while a command waits for its reply, so
//! [`Adapter::next_event`] always yields them in arrival order. Replies that
//! arrive after their command timed out are dropped.

pub mod amplifier;
pub mod antenna;
pub mod cluster;
pub mod json_cat;
pub mod rotator;
pub mod smartsdr;

pub use self::amplifier::AmplifierAdapter;
pub use self::antenna::AntennaAdapter;
pub use self::cluster::ClusterAdapter;
pub use self::json_cat::JsonCatAdapter;
pub use self::rotator::RotatorAdapter;
pub use self::smartsdr::SmartSdrAdapter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Framed};

use crate::codec::Decoded;
use crate::core::{Config, DeviceDescriptor, Error, Protocol, Result};
use crate::protocol::{Command, EventPayload};

/// Counters shared between an adapter and whoever watches it
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Messages decoded successfully
    messages: AtomicU64,
    /// Messages dropped because they could not be decoded
    decode_errors: AtomicU64,
    /// Transports opened
    connects: AtomicU64,
}

impl LinkStats {
    /// Creates zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a decoded message
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dropped message
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an opened transport
    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages decoded successfully
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Messages dropped because they could not be decoded
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Transports opened
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }
}

/// Capability contract shared by every adapter
#[allow(async_fn_in_trait)]
pub trait Adapter {
    /// Opens the transport and performs the protocol handshake
    async fn connect(&mut self) -> Result<()>;

    /// Subscribes to the device's status stream
    async fn start_monitoring(&mut self) -> Result<()>;

    /// Closes the transport; safe to call when already closed
    async fn disconnect(&mut self) -> Result<()>;

    /// Sends one command and waits for the device to accept it
    async fn send_command(&mut self, command: &Command) -> Result<()>;

    /// Next event from the device.
    ///
    /// Cancellation safe: dropping the future loses no data. An error means
    /// the transport is gone.
    async fn next_event(&mut self) -> Result<EventPayload>;

    /// Last time anything arrived from the device
    fn last_activity(&self) -> Instant;

    /// Silence after which the status stream counts as interrupted
    fn stall_timeout(&self) -> Option<Duration>;
}

/// Adapter for one device, selected by protocol
#[derive(Debug)]
pub enum DeviceAdapter {
    /// SmartSDR radio
    SmartSdr(SmartSdrAdapter),
    /// JSON CAT radio
    JsonCat(JsonCatAdapter),
    /// rotctld rotator
    Rotator(RotatorAdapter),
    /// Antenna switch
    AntennaSwitch(AntennaAdapter),
    /// Amplifier
    Amplifier(AmplifierAdapter),
    /// DX cluster spot feed
    Cluster(ClusterAdapter),
}

macro_rules! dispatch {
    ($self:ident, $adapter:ident => $body:expr) => {
        match $self {
            DeviceAdapter::SmartSdr($adapter) => $body,
            DeviceAdapter::JsonCat($adapter) => $body,
            DeviceAdapter::Rotator($adapter) => $body,
            DeviceAdapter::AntennaSwitch($adapter) => $body,
            DeviceAdapter::Amplifier($adapter) => $body,
            DeviceAdapter::Cluster($adapter) => $body,
        }
    };
}

impl DeviceAdapter {
    /// Builds the adapter for a descriptor's protocol
    pub fn new(descriptor: &DeviceDescriptor, config: &Config, stats: Arc<LinkStats>) -> Self {
        let endpoint = descriptor.endpoint.clone();
        match descriptor.protocol {
            Protocol::SmartSdr => DeviceAdapter::SmartSdr(SmartSdrAdapter::new(endpoint, stats)),
            Protocol::JsonCat => DeviceAdapter::JsonCat(JsonCatAdapter::new(endpoint, stats)),
            Protocol::Rotctld => {
                DeviceAdapter::Rotator(RotatorAdapter::new(endpoint, &config.polling, stats))
            }
            Protocol::AntennaSwitch => {
                DeviceAdapter::AntennaSwitch(AntennaAdapter::new(endpoint, stats))
            }
            Protocol::Amplifier => DeviceAdapter::Amplifier(AmplifierAdapter::new(
                endpoint,
                config.polling.amplifier_stall,
                stats,
            )),
            Protocol::ClusterSpots => DeviceAdapter::Cluster(ClusterAdapter::new(endpoint, stats)),
        }
    }

    /// Protocol spoken by this adapter
    pub fn protocol(&self) -> Protocol {
        match self {
            DeviceAdapter::SmartSdr(_) => Protocol::SmartSdr,
            DeviceAdapter::JsonCat(_) => Protocol::JsonCat,
            DeviceAdapter::Rotator(_) => Protocol::Rotctld,
            DeviceAdapter::AntennaSwitch(_) => Protocol::AntennaSwitch,
            DeviceAdapter::Amplifier(_) => Protocol::Amplifier,
            DeviceAdapter::Cluster(_) => Protocol::ClusterSpots,
        }
    }

    /// See [`Adapter::connect`]
    pub async fn connect(&mut self) -> Result<()> {
        dispatch!(self, a => a.connect().await)
    }

    /// See [`Adapter::start_monitoring`]
    pub async fn start_monitoring(&mut self) -> Result<()> {
        dispatch!(self, a => a.start_monitoring().await)
    }

    /// See [`Adapter::disconnect`]
    pub async fn disconnect(&mut self) -> Result<()> {
        dispatch!(self, a => a.disconnect().await)
    }

    /// See [`Adapter::send_command`]
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        dispatch!(self, a => a.send_command(command).await)
    }

    /// See [`Adapter::next_event`]
    pub async fn next_event(&mut self) -> Result<EventPayload> {
        dispatch!(self, a => a.next_event().await)
    }

    /// See [`Adapter::last_activity`]
    pub fn last_activity(&self) -> Instant {
        dispatch!(self, a => a.last_activity())
    }

    /// See [`Adapter::stall_timeout`]
    pub fn stall_timeout(&self) -> Option<Duration> {
        dispatch!(self, a => a.stall_timeout())
    }
}

/// Opens a TCP connection to a device
pub(crate) async fn connect_tcp(endpoint: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| Error::transport(format!("Failed to connect to {}: {}", endpoint, e)))?;
    stream
        .set_nodelay(true)
        .map_err(|e| {
            Error::transport(format!("Failed to configure socket for {}: {}", endpoint, e))
        })?;
    Ok(stream)
}

/// Error for an adapter used before `connect`
pub(crate) fn not_connected(endpoint: &str) -> Error {
    Error::transport(format!("{} is not connected", endpoint))
}

/// Reads the next well-formed item, counting and skipping malformed ones.
///
/// Cancellation safe as long as the codec is.
pub(crate) async fn next_item<C, T>(
    framed: &mut Option<Framed<TcpStream, C>>,
    stats: &LinkStats,
    endpoint: &str,
) -> Result<T>
where
    C: Decoder<Item = Decoded<T>, Error = std::io::Error>,
{
    let framed = framed.as_mut().ok_or_else(|| not_connected(endpoint))?;
    loop {
        match framed.next().await {
            Some(Ok(Decoded::Item(item))) => return Ok(item),
            Some(Ok(Decoded::Malformed(reason))) => {
                stats.record_decode_error();
                tracing::debug!(endpoint, %reason, "Dropped malformed message");
            }
            Some(Err(e)) => {
                return Err(Error::transport(format!("Read from {} failed: {}", endpoint, e)))
            }
            None => return Err(Error::transport(format!("{} closed the connection", endpoint))),
        }
    }
}

/// Error for a command the device family does not implement
pub(crate) fn unsupported(command: &Command, protocol: Protocol) -> Error {
    Error::validation(format!(
        "{} is not supported by {:?} devices",
        command.name(),
        protocol
    ))
}
