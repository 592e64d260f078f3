use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::{connect_tcp, next_item, not_connected, unsupported, Adapter, LinkStats};
use crate::codec::amplifier::{self, KIND_HELLO, KIND_STATUS, KIND_TELEMETRY};
use crate::codec::frame::KIND_ACK;
use crate::codec::{BinaryFrame, FrameCodec};
use crate::core::{Error, Protocol, Result};
use crate::protocol::event::watts_to_dbm;
use crate::protocol::{AmplifierStatus, Command, EventPayload};

/// Amplifier adapter
#[derive(Debug)]
pub struct AmplifierAdapter {
    endpoint: String,
    stats: Arc<LinkStats>,
    framed: Option<Framed<TcpStream, FrameCodec>>,
    seq: u8,
    /// Model from the hello frame
    model: Option<String>,
    /// Telemetry and status merged from the latest frames
    status: AmplifierStatus,
    /// Telemetry gap treated as an interrupted stream
    stall: Duration,
    pending: VecDeque<EventPayload>,
    last_activity: Instant,
}

impl AmplifierAdapter {
    /// Creates a disconnected adapter
    pub fn new(endpoint: String, stall: Duration, stats: Arc<LinkStats>) -> Self {
        AmplifierAdapter {
            endpoint,
            stats,
            framed: None,
            seq: 0,
            model: None,
            status: AmplifierStatus::default(),
            stall,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Model reported by the amplifier
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    async fn read_frame(&mut self) -> Result<BinaryFrame> {
        let frame = next_item(&mut self.framed, &self.stats, &self.endpoint).await?;
        self.last_activity = Instant::now();
        self.stats.record_message();
        Ok(frame)
    }

    async fn request(&mut self, frame: BinaryFrame) -> Result<u8> {
        let seq = frame.seq;
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| not_connected(&self.endpoint))?;
        framed
            .send(frame)
            .await
            .map_err(|e| Error::transport(format!("Failed to send to {}: {}", self.endpoint, e)))?;

        loop {
            let frame = self.read_frame().await?;
            if frame.kind == KIND_ACK && frame.seq == seq {
                return frame.ack_status();
            }
            self.handle_frame(frame);
        }
    }

    fn handle_frame(&mut self, frame: BinaryFrame) {
        let result = match frame.kind {
            KIND_HELLO => amplifier::parse_hello(&frame.payload).map(|model| {
                self.model = Some(model);
            }),
            KIND_TELEMETRY => amplifier::parse_telemetry(&frame.payload).map(|t| {
                self.status.forward_power_w = t.forward_power_w;
                self.status.forward_power_dbm = watts_to_dbm(t.forward_power_w);
                self.status.return_loss_db = t.return_loss_db;
                self.status.swr = t.swr;
                self.status.temperature_c = t.temperature_c;
                self.status.current_a = t.current_a;
                self.pending
                    .push_back(EventPayload::AmplifierStatus(self.status));
            }),
            KIND_STATUS => amplifier::parse_status(&frame.payload).map(|s| {
                self.status.operate = s.operate;
                self.status.bias = s.bias;
                self.status.band = s.band;
                self.status.faults = s.faults;
                self.pending
                    .push_back(EventPayload::AmplifierStatus(self.status));
            }),
            KIND_ACK => {
                tracing::trace!(
                    endpoint = %self.endpoint,
                    seq = frame.seq,
                    "Acknowledgement for unknown or expired request"
                );
                Ok(())
            }
            kind => Err(Error::decode(format!("unknown amplifier frame kind 0x{:02X}", kind))),
        };
        if let Err(e) = result {
            self.stats.record_decode_error();
            tracing::debug!(endpoint = %self.endpoint, error = %e, "Dropped amplifier frame");
        }
    }
}

impl Adapter for AmplifierAdapter {
    async fn connect(&mut self) -> Result<()> {
        let stream = connect_tcp(&self.endpoint).await?;
        self.framed = Some(Framed::new(stream, FrameCodec::new()));
        self.stats.record_connect();
        self.last_activity = Instant::now();
        self.model = None;

        while self.model.is_none() {
            let frame = self.read_frame().await?;
            self.handle_frame(frame);
        }
        tracing::info!(endpoint = %self.endpoint, model = ?self.model, "Amplifier connected");
        Ok(())
    }

    async fn start_monitoring(&mut self) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        match self.request(amplifier::subscribe(self.seq)).await? {
            0 => {
                self.last_activity = Instant::now();
                Ok(())
            }
            status => Err(Error::transport(format!(
                "{} refused subscription with status {}",
                self.endpoint, status
            ))),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut framed) = self.framed.take() {
            let _ = SinkExt::<BinaryFrame>::close(&mut framed).await;
        }
        self.pending.clear();
        Ok(())
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        if self.framed.is_none() {
            return Err(not_connected(&self.endpoint));
        }
        match command {
            Command::SetAmplifierMode { mode } => {
                self.seq = self.seq.wrapping_add(1);
                match self.request(amplifier::set_mode(self.seq, *mode)).await? {
                    0 => Ok(()),
                    status => Err(Error::validation(format!(
                        "amplifier refused {:?} with status {}",
                        mode, status
                    ))),
                }
            }
            other => Err(unsupported(other, Protocol::Amplifier)),
        }
    }

    async fn next_event(&mut self) -> Result<EventPayload> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            let frame = self.read_frame().await?;
            self.handle_frame(frame);
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn stall_timeout(&self) -> Option<Duration> {
        Some(self.stall)
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{serve_one, Behaviour};
    use super::*;
    use crate::adapter::testing::listener;
    use crate::protocol::AmplifierMode;

    #[tokio::test]
    async fn test_telemetry_and_operate() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            serve_one(&listener, Behaviour::Stream { period: Duration::from_millis(20) }).await
        });

        let stats = Arc::new(LinkStats::new());
        let mut adapter = AmplifierAdapter::new(addr, Duration::from_secs(1), stats.clone());
        adapter.connect().await.unwrap();
        assert_eq!(adapter.model(), Some("KPA1500"));
        assert_eq!(stats.connects(), 1);
        adapter.start_monitoring().await.unwrap();

        let mut saw_telemetry = false;
        while !saw_telemetry {
            if let EventPayload::AmplifierStatus(status) = adapter.next_event().await.unwrap() {
                if status.forward_power_w > 0.0 {
                    assert_eq!(status.forward_power_w, 500.0);
                    assert!((status.forward_power_dbm.unwrap() - 56.99).abs() < 0.01);
                    assert_eq!(status.swr, 1.15);
                    assert!(stats.messages() >= 2);
                    saw_telemetry = true;
                }
            }
        }

        adapter
            .send_command(&Command::SetAmplifierMode { mode: AmplifierMode::Operate })
            .await
            .unwrap();
        loop {
            if let EventPayload::AmplifierStatus(status) = adapter.next_event().await.unwrap() {
                if status.operate {
                    // Telemetry is kept when status changes
                    assert_eq!(status.forward_power_w, 500.0);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_reset_is_transport_error() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move { serve_one(&listener, Behaviour::ResetAfter { frames: 2 }).await });

        let mut adapter = AmplifierAdapter::new(addr, Duration::from_secs(1), Arc::new(LinkStats::new()));
        adapter.connect().await.unwrap();
        adapter.start_monitoring().await.unwrap();
        let err = loop {
            match adapter.next_event().await {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unanswered_command_times_out() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move { serve_one(&listener, Behaviour::IgnoreCommands).await });

        let mut adapter = AmplifierAdapter::new(addr, Duration::from_secs(1), Arc::new(LinkStats::new()));
        adapter.connect().await.unwrap();
        adapter.start_monitoring().await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            adapter.send_command(&Command::SetAmplifierMode { mode: AmplifierMode::Standby }),
        )
        .await;
        assert!(result.is_err());
    }
}
