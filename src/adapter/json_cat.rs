use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::{connect_tcp, next_item, not_connected, unsupported, Adapter, LinkStats};
use crate::codec::json_cat::{self, JsonCommand, JsonInbound};
use crate::codec::LineCodec;
use crate::core::{Error, Protocol, Result};
use crate::protocol::{Command, EventPayload};

#[derive(Debug, Clone, PartialEq)]
struct Instance {
    frequency_hz: u64,
    mode: String,
}

/// JSON CAT radio adapter
#[derive(Debug)]
pub struct JsonCatAdapter {
    endpoint: String,
    stats: Arc<LinkStats>,
    framed: Option<Framed<TcpStream, LineCodec>>,
    /// Model from the hello message
    model: Option<String>,
    next_id: u32,
    instances: BTreeMap<u8, Instance>,
    selected: Option<u8>,
    transmitting: Option<bool>,
    pending: VecDeque<EventPayload>,
    last_activity: Instant,
}

impl JsonCatAdapter {
    /// Creates a disconnected adapter
    pub fn new(endpoint: String, stats: Arc<LinkStats>) -> Self {
        JsonCatAdapter {
            endpoint,
            stats,
            framed: None,
            model: None,
            next_id: 0,
            instances: BTreeMap::new(),
            selected: None,
            transmitting: None,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Model reported in the hello message
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn read_message(&mut self) -> Result<JsonInbound> {
        loop {
            let line = next_item(&mut self.framed, &self.stats, &self.endpoint).await?;
            self.last_activity = Instant::now();
            if line.trim().is_empty() {
                continue;
            }
            match json_cat::parse_line(&line) {
                Ok(message) => {
                    self.stats.record_message();
                    return Ok(message);
                }
                Err(e) => {
                    self.stats.record_decode_error();
                    tracing::debug!(endpoint = %self.endpoint, error = %e, "Dropped JSON CAT line");
                }
            }
        }
    }

    async fn request(&mut self, cmd: JsonCommand) -> Result<()> {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        let line = json_cat::encode_request(id, cmd)?;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| not_connected(&self.endpoint))?;
        framed
            .send(line)
            .await
            .map_err(|e| Error::transport(format!("Failed to send to {}: {}", self.endpoint, e)))?;

        loop {
            match self.read_message().await? {
                JsonInbound::Reply { id: got, ok, error } if got == id => {
                    return if ok {
                        Ok(())
                    } else {
                        Err(Error::validation(format!(
                            "radio rejected request {}: {}",
                            id,
                            error.unwrap_or_else(|| "no reason given".to_string())
                        )))
                    };
                }
                other => self.handle_message(other),
            }
        }
    }

    fn handle_message(&mut self, message: JsonInbound) {
        match message {
            JsonInbound::Hello { model, instances } => {
                tracing::debug!(endpoint = %self.endpoint, ?model, ?instances, "JSON CAT hello");
                self.model = model;
            }
            JsonInbound::State {
                instance,
                freq_khz,
                mode,
                tx,
            } => {
                let frequency_hz = match json_cat::khz_to_hz(freq_khz) {
                    Ok(hz) => hz,
                    Err(e) => {
                        self.stats.record_decode_error();
                        tracing::debug!(endpoint = %self.endpoint, error = %e, "Bad state message");
                        return;
                    }
                };
                let state = Instance { frequency_hz, mode };
                if self.selected.is_none() {
                    self.selected = Some(instance);
                }
                if self.instances.get(&instance) != Some(&state) {
                    self.instances.insert(instance, state);
                    self.emit_instance(instance);
                }
                if self.transmitting != Some(tx) {
                    self.transmitting = Some(tx);
                    self.pending
                        .push_back(EventPayload::TransmittingChanged { transmitting: tx });
                }
            }
            JsonInbound::Reply { id, .. } => {
                tracing::trace!(
                    endpoint = %self.endpoint,
                    id,
                    "Reply for unknown or expired request"
                );
            }
        }
    }

    fn emit_instance(&mut self, index: u8) {
        if let Some(instance) = self.instances.get(&index) {
            self.pending.push_back(EventPayload::FrequencyModeChanged {
                instance: index,
                frequency_hz: instance.frequency_hz,
                mode: instance.mode.clone(),
                active: self.selected == Some(index),
            });
        }
    }
}

impl Adapter for JsonCatAdapter {
    async fn connect(&mut self) -> Result<()> {
        let stream = connect_tcp(&self.endpoint).await?;
        self.framed = Some(Framed::new(stream, LineCodec::new()));
        self.stats.record_connect();
        self.last_activity = Instant::now();

        loop {
            match self.read_message().await? {
                JsonInbound::Hello { model, .. } => {
                    tracing::info!(endpoint = %self.endpoint, ?model, "JSON CAT radio connected");
                    self.model = model;
                    return Ok(());
                }
                other => self.handle_message(other),
            }
        }
    }

    async fn start_monitoring(&mut self) -> Result<()> {
        self.request(JsonCommand::Subscribe).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            let _ = SinkExt::<String>::close(&mut framed).await;
        }
        self.instances.clear();
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
                if !self.instances.contains_key(instance) {
                    return Err(Error::validation(format!("instance {} does not exist", instance)));
                }
                self.request(JsonCommand::SelectInstance {
                    instance: *instance,
                })
                .await?;
                let previous = self.selected.replace(*instance);
                if let Some(previous) = previous.filter(|p| p != instance) {
                    self.emit_instance(previous);
                }
                self.emit_instance(*instance);
                Ok(())
            }
            other => Err(unsupported(other, Protocol::JsonCat)),
        }
    }

    async fn next_event(&mut self) -> Result<EventPayload> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let message = self.read_message().await?;
            self.handle_message(message);
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn stall_timeout(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{listener, LinePeer};

    async fn reply_ok(peer: &mut LinePeer) -> serde_json::Value {
        let request: serde_json::Value = serde_json::from_str(&peer.recv().await.unwrap()).unwrap();
        peer.send(&format!(r#"{{"type":"reply","id":{},"ok":true}}"#, request["id"]))
            .await;
        request
    }

    #[tokio::test]
    async fn test_subscribe_and_state() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let mut peer = LinePeer::accept(&listener).await;
            peer.send(r#"{"type":"hello","model":"IC-7610","instances":2}"#).await;
            let request = reply_ok(&mut peer).await;
            assert_eq!(request["cmd"], "subscribe");
            peer.send(r#"{"type":"state","instance":0,"freq_khz":14074.0,"mode":"USB","tx":false}"#)
                .await;
            peer.send("{broken").await;
            peer.send(r#"{"type":"state","instance":0,"freq_khz":14074.0,"mode":"USB","tx":true}"#)
                .await;
            peer
        });

        let stats = Arc::new(LinkStats::new());
        let mut adapter = JsonCatAdapter::new(addr, stats.clone());
        adapter.connect().await.unwrap();
        assert_eq!(adapter.model(), Some("IC-7610"));
        adapter.start_monitoring().await.unwrap();

        assert_eq!(
            adapter.next_event().await.unwrap(),
            EventPayload::FrequencyModeChanged {
                instance: 0,
                frequency_hz: 14_074_000,
                mode: "USB".into(),
                active: true
            }
        );
        assert_eq!(
            adapter.next_event().await.unwrap(),
            EventPayload::TransmittingChanged { transmitting: false }
        );
        // Unchanged frequency is not re-emitted; the malformed line is skipped
        assert_eq!(
            adapter.next_event().await.unwrap(),
            EventPayload::TransmittingChanged { transmitting: true }
        );
        assert_eq!(stats.decode_errors(), 1);
        let _peer = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_select_instance_round_trip() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let mut peer = LinePeer::accept(&listener).await;
            peer.send(r#"{"type":"hello"}"#).await;
            reply_ok(&mut peer).await;
            peer.send(r#"{"type":"state","instance":0,"freq_khz":7030.0,"mode":"CW"}"#).await;
            peer.send(r#"{"type":"state","instance":1,"freq_khz":3573.0,"mode":"DATA"}"#).await;
            let request = reply_ok(&mut peer).await;
            assert_eq!(request["cmd"], "select_instance");
            assert_eq!(request["instance"], 1);
            peer
        });

        let mut adapter = JsonCatAdapter::new(addr, Arc::new(LinkStats::new()));
        adapter.connect().await.unwrap();
        adapter.start_monitoring().await.unwrap();
        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let EventPayload::FrequencyModeChanged { instance, .. } = adapter.next_event().await.unwrap() {
                seen.push(instance);
            }
        }

        adapter
            .send_command(&Command::SelectInstance { instance: 1 })
            .await
            .unwrap();
        assert!(matches!(
            adapter.next_event().await.unwrap(),
            EventPayload::FrequencyModeChanged { instance: 0, active: false, .. }
        ));
        assert!(matches!(
            adapter.next_event().await.unwrap(),
            EventPayload::FrequencyModeChanged { instance: 1, active: true, frequency_hz: 3_573_000, .. }
        ));

        assert!(matches!(
            adapter.send_command(&Command::SelectInstance { instance: 9 }).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            adapter.send_command(&Command::MoveRotator { bearing: 10.0 }).await,
            Err(Error::Validation(_))
        ));
        let _peer = server.await.unwrap();
    }
}
