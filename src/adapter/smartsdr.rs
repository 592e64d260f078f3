use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::{connect_tcp, next_item, not_connected, unsupported, Adapter, LinkStats};
use crate::codec::smartsdr::{self, SmartSdrLine};
use crate::codec::LineCodec;
use crate::core::{Error, Protocol, Result};
use crate::protocol::{Command, EventPayload};

/// Last known state of one slice
#[derive(Debug, Clone, Default)]
struct Slice {
    frequency_hz: Option<u64>,
    mode: Option<String>,
}

/// SmartSDR radio adapter
#[derive(Debug)]
pub struct SmartSdrAdapter {
    /// `host:port` of the radio
    endpoint: String,
    /// Shared counters
    stats: Arc<LinkStats>,
    /// Line transport, present while connected
    framed: Option<Framed<TcpStream, LineCodec>>,
    /// Protocol version from the handshake
    version: Option<String>,
    /// Client handle from the handshake
    handle: Option<u32>,
    /// Last command sequence number used
    seq: u32,
    /// Known slices
    slices: BTreeMap<u8, Slice>,
    /// Slice surfaced as active
    selected: Option<u8>,
    /// Last reported transmit state
    transmitting: Option<bool>,
    /// Events decoded while a command waited for its reply
    pending: VecDeque<EventPayload>,
    /// Last inbound traffic
    last_activity: Instant,
}

impl SmartSdrAdapter {
    /// Creates a disconnected adapter
    pub fn new(endpoint: String, stats: Arc<LinkStats>) -> Self {
        SmartSdrAdapter {
            endpoint,
            stats,
            framed: None,
            version: None,
            handle: None,
            seq: 0,
            slices: BTreeMap::new(),
            selected: None,
            transmitting: None,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Protocol version reported by the radio
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Client handle assigned by the radio
    pub fn handle(&self) -> Option<u32> {
        self.handle
    }

    async fn read_line(&mut self) -> Result<SmartSdrLine> {
        loop {
            let line = next_item(&mut self.framed, &self.stats, &self.endpoint).await?;
            self.last_activity = Instant::now();
            if line.trim().is_empty() {
                continue;
            }
            match smartsdr::parse_line(&line) {
                Ok(parsed) => {
                    self.stats.record_message();
                    return Ok(parsed);
                }
                Err(e) => {
                    self.stats.record_decode_error();
                    tracing::debug!(
                        endpoint = %self.endpoint,
                        error = %e,
                        %line,
                        "Unparseable SmartSDR line"
                    );
                }
            }
        }
    }

    /// Sends a command and waits for its response, buffering status traffic
    async fn request(&mut self, command: &str) -> Result<String> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| not_connected(&self.endpoint))?;
        framed
            .send(smartsdr::encode_command(seq, command))
            .await
            .map_err(|e| Error::transport(format!("Failed to send to {}: {}", self.endpoint, e)))?;

        loop {
            match self.read_line().await? {
                SmartSdrLine::Response { seq: got, code, message } if got == seq => {
                    if code != 0 {
                        return Err(Error::validation(format!(
                            "radio rejected '{}': {:08X} {}",
                            command, code, message
                        )));
                    }
                    return Ok(message);
                }
                other => self.handle_line(other),
            }
        }
    }

    fn handle_line(&mut self, line: SmartSdrLine) {
        match line {
            SmartSdrLine::Status { object, params, .. } => self.apply_status(&object, &params),
            SmartSdrLine::Response { seq, code, .. } => {
                tracing::trace!(
                    endpoint = %self.endpoint,
                    seq,
                    code,
                    "Response for unknown or expired sequence"
                );
            }
            SmartSdrLine::Message { code, text } => {
                tracing::debug!(endpoint = %self.endpoint, code, %text, "SmartSDR message");
            }
            SmartSdrLine::Version(_) | SmartSdrLine::Handle(_) => {
                tracing::warn!(
                    endpoint = %self.endpoint,
                    "Unexpected handshake line after handshake"
                );
            }
        }
    }

    fn apply_status(&mut self, object: &str, params: &[(String, String)]) {
        if let Some(transmitting) = smartsdr::parse_interlock(object, params) {
            if self.transmitting != Some(transmitting) {
                self.transmitting = Some(transmitting);
                self.pending
                    .push_back(EventPayload::TransmittingChanged { transmitting });
            }
            return;
        }

        let update = match smartsdr::parse_slice(object, params) {
            Ok(Some(update)) => update,
            Ok(None) => return,
            Err(e) => {
                self.stats.record_decode_error();
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Bad slice status");
                return;
            }
        };

        if update.in_use == Some(false) {
            self.slices.remove(&update.index);
            if self.selected == Some(update.index) {
                self.selected = self.slices.keys().next().copied();
                if let Some(index) = self.selected {
                    self.emit_slice(index);
                }
            }
            return;
        }

        let slice = self.slices.entry(update.index).or_default();
        let mut changed = false;
        if update.frequency_hz.is_some() && slice.frequency_hz != update.frequency_hz {
            slice.frequency_hz = update.frequency_hz;
            changed = true;
        }
        if update.mode.is_some() && slice.mode != update.mode {
            slice.mode = update.mode;
            changed = true;
        }
        if self.selected.is_none() {
            self.selected = Some(update.index);
        }
        if changed {
            self.emit_slice(update.index);
        }
    }

    fn emit_slice(&mut self, index: u8) {
        let Some(slice) = self.slices.get(&index) else {
            return;
        };
        let (Some(frequency_hz), Some(mode)) = (slice.frequency_hz, slice.mode.clone()) else {
            return;
        };
        self.pending.push_back(EventPayload::FrequencyModeChanged {
            instance: index,
            frequency_hz,
            mode,
            active: self.selected == Some(index),
        });
    }
}

impl Adapter for SmartSdrAdapter {
    async fn connect(&mut self) -> Result<()> {
        let stream = connect_tcp(&self.endpoint).await?;
        self.framed = Some(Framed::new(stream, LineCodec::new()));
        self.stats.record_connect();
        self.last_activity = Instant::now();
        self.version = None;
        self.handle = None;

        while self.version.is_none() || self.handle.is_none() {
            match self.read_line().await? {
                SmartSdrLine::Version(version) => self.version = Some(version),
                SmartSdrLine::Handle(handle) => self.handle = Some(handle),
                other => self.handle_line(other),
            }
        }
        tracing::info!(
            endpoint = %self.endpoint,
            version = self.version.as_deref().unwrap_or_default(),
            handle = %format!("{:08X}", self.handle.unwrap_or_default()),
            "SmartSDR handshake complete"
        );
        Ok(())
    }

    async fn start_monitoring(&mut self) -> Result<()> {
        self.request("sub slice all").await?;
        self.request("sub tx all").await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            let _ = SinkExt::<String>::close(&mut framed).await;
        }
        self.slices.clear();
        self.selected = None;
        self.transmitting = None;
        self.pending.clear();
        Ok(())
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        if self.framed.is_none() {
            return Err(not_connected(&self.endpoint));
        }
        match command {
            Command::SelectInstance { instance } => {
                if !self.slices.contains_key(instance) {
                    return Err(Error::validation(format!("slice {} does not exist", instance)));
                }
                let previous = self.selected.replace(*instance);
                if let Some(previous) = previous.filter(|p| p != instance) {
                    self.emit_slice(previous);
                }
                self.emit_slice(*instance);
                Ok(())
            }
            other => Err(unsupported(other, Protocol::SmartSdr)),
        }
    }

    async fn next_event(&mut self) -> Result<EventPayload> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let line = self.read_line().await?;
            self.handle_line(line);
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn stall_timeout(&self) -> Option<Duration> {
        None
    }
}
