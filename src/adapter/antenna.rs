use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::{connect_tcp, next_item, not_connected, unsupported, Adapter, LinkStats};
use crate::codec::antenna::{self, SwitchInfo, KIND_HELLO, KIND_PORT_STATUS};
use crate::codec::frame::KIND_ACK;
use crate::codec::{BinaryFrame, FrameCodec};
use crate::core::{Error, Protocol, Result};
use crate::protocol::{Command, EventPayload, PortStatus};

/// Antenna switch adapter
#[derive(Debug)]
pub struct AntennaAdapter {
    endpoint: String,
    stats: Arc<LinkStats>,
    framed: Option<Framed<TcpStream, FrameCodec>>,
    seq: u8,
    /// Layout reported in the hello frame
    info: Option<SwitchInfo>,
    /// Latest status per port
    ports: BTreeMap<u8, PortStatus>,
    pending: VecDeque<EventPayload>,
    last_activity: Instant,
}

impl AntennaAdapter {
    /// Creates a disconnected adapter
    pub fn new(endpoint: String, stats: Arc<LinkStats>) -> Self {
        AntennaAdapter {
            endpoint,
            stats,
            framed: None,
            seq: 0,
            info: None,
            ports: BTreeMap::new(),
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Switch layout, known once connected
    pub fn info(&self) -> Option<&SwitchInfo> {
        self.info.as_ref()
    }

    /// Latest status of a port
    pub fn port(&self, port: u8) -> Option<&PortStatus> {
        self.ports.get(&port)
    }

    fn next_seq(&mut self) -> u8 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    async fn read_frame(&mut self) -> Result<BinaryFrame> {
        let frame = next_item(&mut self.framed, &self.stats, &self.endpoint).await?;
        self.last_activity = Instant::now();
        self.stats.record_message();
        Ok(frame)
    }

    /// Sends a frame and waits for its acknowledgement
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
            KIND_HELLO => antenna::parse_hello(&frame.payload).map(|info| {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    ports = info.ports,
                    antennas = info.antennas.len(),
                    "Switch layout"
                );
                self.info = Some(info);
            }),
            KIND_PORT_STATUS => antenna::parse_port_status(&frame.payload).map(|status| {
                self.ports.insert(status.port, status);
                self.pending.push_back(EventPayload::AntennaPortChanged(status));
            }),
            KIND_ACK => {
                tracing::trace!(
                    endpoint = %self.endpoint,
                    seq = frame.seq,
                    "Acknowledgement for unknown or expired request"
                );
                Ok(())
            }
            kind => Err(Error::decode(format!("unknown antenna switch frame kind 0x{:02X}", kind))),
        };
        if let Err(e) = result {
            self.stats.record_decode_error();
            tracing::debug!(endpoint = %self.endpoint, error = %e, "Dropped antenna switch frame");
        }
    }

    /// Checks a selection against the capability masks
    fn check_selection(&self, port: u8, antenna: u8) -> Result<()> {
        let info = self
            .info
            .as_ref()
            .ok_or_else(|| Error::validation("switch layout not known yet"))?;
        if port == 0 || port > info.ports {
            return Err(Error::validation(format!(
                "port {} does not exist (switch has {})",
                port, info.ports
            )));
        }
        let capability = info.antenna(antenna).ok_or_else(|| {
            Error::validation(format!(
                "antenna {} does not exist (switch has {})",
                antenna,
                info.antennas.len()
            ))
        })?;
        if !capability.allows_port(port) {
            return Err(Error::validation(format!(
                "antenna {} cannot be routed to port {}",
                antenna, port
            )));
        }
        if let Some(status) = self.ports.get(&port) {
            if status.inhibited {
                return Err(Error::validation(format!("port {} is inhibited", port)));
            }
            if !capability.allows_band(status.band) {
                return Err(Error::validation(format!(
                    "antenna {} is not usable on band {} of port {}",
                    antenna, status.band, port
                )));
            }
        }
        Ok(())
    }
}

impl Adapter for AntennaAdapter {
    async fn connect(&mut self) -> Result<()> {
        let stream = connect_tcp(&self.endpoint).await?;
        self.framed = Some(Framed::new(stream, FrameCodec::new()));
        self.stats.record_connect();
        self.last_activity = Instant::now();
        self.info = None;

        while self.info.is_none() {
            let frame = self.read_frame().await?;
            self.handle_frame(frame);
        }
        tracing::info!(endpoint = %self.endpoint, "Antenna switch connected");
        Ok(())
    }

    async fn start_monitoring(&mut self) -> Result<()> {
        let seq = self.next_seq();
        match self.request(antenna::subscribe(seq)).await? {
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
        self.ports.clear();
        self.pending.clear();
        Ok(())
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        if self.framed.is_none() {
            return Err(not_connected(&self.endpoint));
        }
        match command {
            Command::SelectAntenna { port, antenna } => {
                self.check_selection(*port, *antenna)?;
                let seq = self.next_seq();
                match self.request(antenna::select(seq, *port, *antenna)).await? {
                    0 => Ok(()),
                    status => Err(Error::validation(format!(
                        "switch refused antenna {} on port {} with status {}",
                        antenna, port, status
                    ))),
                }
            }
            other => Err(unsupported(other, Protocol::AntennaSwitch)),
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
        None
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process antenna switch

    use super::*;
    use crate::adapter::testing::FramePeer;
    use crate::codec::antenna::{AntennaCapability, KIND_SELECT};
    use crate::codec::frame::KIND_SUBSCRIBE;
    use crate::protocol::PortSource;
    use tokio::net::TcpListener;

    /// Two ports, three antennas; antenna 3 only works on band 9 and port 2
    pub fn layout() -> SwitchInfo {
        SwitchInfo {
            ports: 2,
            antennas: vec![
                AntennaCapability { port_mask: 0b11, band_mask: 0x03FF },
                AntennaCapability { port_mask: 0b11, band_mask: 0x00F0 },
                AntennaCapability { port_mask: 0b10, band_mask: 0x0200 },
            ],
        }
    }

    fn status(port: u8, antenna: u8, band: u8) -> PortStatus {
        PortStatus {
            port,
            antenna,
            band,
            source: PortSource::Manual,
            inhibited: false,
            transmitting: false,
        }
    }

    /// Serves one client: hello, then status on subscribe and on every selection
    pub async fn serve(listener: TcpListener) {
        let mut peer = FramePeer::accept(&listener).await;
        peer.send(antenna::hello(0, &layout())).await;
        let mut ports = [status(1, 1, 5), status(2, 0, 5)];
        while let Some(frame) = peer.recv().await {
            match frame.kind {
                KIND_SUBSCRIBE => {
                    peer.send(BinaryFrame::new(KIND_ACK, frame.seq, vec![0u8])).await;
                    for port in ports {
                        peer.send(antenna::port_status(0, &port)).await;
                    }
                }
                KIND_SELECT => {
                    let index = usize::from(frame.payload[0] - 1);
                    ports[index].antenna = frame.payload[1];
                    peer.send(BinaryFrame::new(KIND_ACK, frame.seq, vec![0u8])).await;
                    peer.send(antenna::port_status(0, &ports[index])).await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::listener;

    async fn monitoring_adapter() -> AntennaAdapter {
        let (listener, addr) = listener().await;
        tokio::spawn(fake::serve(listener));
        let mut adapter = AntennaAdapter::new(addr, Arc::new(LinkStats::new()));
        adapter.connect().await.unwrap();
        adapter.start_monitoring().await.unwrap();
        // Initial status of both ports
        for _ in 0..2 {
            assert!(matches!(
                adapter.next_event().await.unwrap(),
                EventPayload::AntennaPortChanged(_)
            ));
        }
        adapter
    }

    async fn select(adapter: &mut AntennaAdapter, port: u8, antenna: u8) -> Result<PortStatus> {
        adapter
            .send_command(&Command::SelectAntenna { port, antenna })
            .await?;
        match adapter.next_event().await? {
            EventPayload::AntennaPortChanged(status) => Ok(status),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_selection_is_idempotent() {
        let mut adapter = monitoring_adapter().await;
        assert_eq!(adapter.info().unwrap().antennas.len(), 3);

        let first = select(&mut adapter, 2, 2).await.unwrap();
        let second = select(&mut adapter, 2, 2).await.unwrap();
        assert_eq!(first.antenna, 2);
        assert_eq!(first, second);
        assert_eq!(adapter.port(2), Some(&second));
    }

    #[tokio::test]
    async fn test_capability_mask_validation() {
        let mut adapter = monitoring_adapter().await;

        // Port 3 does not exist
        assert!(matches!(select(&mut adapter, 3, 1).await, Err(Error::Validation(_))));
        // Antenna 4 does not exist
        assert!(matches!(select(&mut adapter, 1, 4).await, Err(Error::Validation(_))));
        // Antenna 3 cannot be routed to port 1
        assert!(matches!(select(&mut adapter, 1, 3).await, Err(Error::Validation(_))));
        // Antenna 3 can use port 2 but not band 5
        assert!(matches!(select(&mut adapter, 2, 3).await, Err(Error::Validation(_))));
        // Nothing was sent, so the port is unchanged
        assert_eq!(adapter.port(2).unwrap().antenna, 0);
    }

    #[tokio::test]
    async fn test_wrong_command_family() {
        let mut adapter = monitoring_adapter().await;
        let err = adapter
            .send_command(&Command::MoveRotator { bearing: 10.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
