//! rotctld rotator adapter
//!
//! Position is polled with `p` while monitoring. Replies are self-describing
//! (angles are bare numbers, acknowledgements are `RPRT n`), so poll replies
//! and command acknowledgements can interleave freely on the one connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;

use super::{connect_tcp, next_item, not_connected, unsupported, Adapter, LinkStats};
use crate::codec::{rotctl, LineCodec};
use crate::core::{Error, PollingConfig, Protocol, Result};
use crate::protocol::{Command, EventPayload, RotatorPosition};

/// Polls without a reply before the stream counts as stalled
const STALL_POLLS: u32 = 5;

/// Smallest angle change reported as movement
const ANGLE_EPSILON: f64 = 0.05;

fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// rotctld adapter
#[derive(Debug)]
pub struct RotatorAdapter {
    endpoint: String,
    stats: Arc<LinkStats>,
    framed: Option<Framed<TcpStream, LineCodec>>,
    /// Poll timer, running while monitoring
    poll: Option<Interval>,
    /// Poll period
    period: Duration,
    /// Distance from the target at which a move is complete
    tolerance: f64,
    /// Unchanged polls after which a move counts as stopped
    stall_polls: u32,
    /// Azimuth line of a position reply waiting for its elevation line
    partial_azimuth: Option<f64>,
    /// Last complete position
    position: Option<RotatorPosition>,
    /// Consecutive polls without movement during a move
    unchanged_polls: u32,
    /// Complete position replies received on this connection
    replies: u64,
    pending: VecDeque<EventPayload>,
    last_activity: Instant,
}

impl RotatorAdapter {
    /// Creates a disconnected adapter
    pub fn new(endpoint: String, polling: &PollingConfig, stats: Arc<LinkStats>) -> Self {
        RotatorAdapter {
            endpoint,
            stats,
            framed: None,
            poll: None,
            period: polling.rotator_interval,
            tolerance: polling.rotator_tolerance_deg,
            stall_polls: polling.rotator_stall_polls.max(1),
            partial_azimuth: None,
            position: None,
            unchanged_polls: 0,
            replies: 0,
            pending: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    /// Last known position
    pub fn position(&self) -> Option<RotatorPosition> {
        self.position
    }

    async fn write(&mut self, line: String) -> Result<()> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| not_connected(&self.endpoint))?;
        framed
            .send(line)
            .await
            .map_err(|e| Error::transport(format!("Failed to send to {}: {}", self.endpoint, e)))
    }

    async fn read_line(&mut self) -> Result<String> {
        let line = next_item(&mut self.framed, &self.stats, &self.endpoint).await?;
        self.last_activity = Instant::now();
        Ok(line)
    }

    /// Handles one reply line; returns the code when it is an `RPRT` line
    fn handle_line(&mut self, line: &str) -> Option<i32> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match rotctl::parse_report(line) {
            Ok(Some(code)) => {
                self.stats.record_message();
                return Some(code);
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.record_decode_error();
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Bad rotctld report");
                return None;
            }
        }

        match rotctl::parse_angle(line) {
            Ok(angle) => {
                self.stats.record_message();
                match self.partial_azimuth.take() {
                    None => self.partial_azimuth = Some(angle),
                    Some(azimuth) => self.update_position(azimuth, angle),
                }
            }
            Err(e) => {
                self.partial_azimuth = None;
                self.stats.record_decode_error();
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Bad rotctld line");
            }
        }
        None
    }

    fn update_position(&mut self, azimuth: f64, elevation: f64) {
        let azimuth = rotctl::normalize_azimuth(azimuth);
        self.replies += 1;
        let previous = self.position;
        let mut target = previous.and_then(|p| p.target);

        let moved = previous.map_or(true, |p| {
            angular_distance(p.azimuth, azimuth) > ANGLE_EPSILON
                || (p.elevation - elevation).abs() > ANGLE_EPSILON
        });

        if let Some(bearing) = target {
            if angular_distance(azimuth, bearing) <= self.tolerance {
                target = None;
            } else if moved {
                self.unchanged_polls = 0;
            } else {
                self.unchanged_polls += 1;
                if self.unchanged_polls >= self.stall_polls {
                    tracing::info!(
                        endpoint = %self.endpoint,
                        azimuth,
                        bearing,
                        "Rotator stopped short of target"
                    );
                    target = None;
                }
            }
        }

        let position = RotatorPosition {
            azimuth,
            elevation,
            target,
            is_moving: target.is_some(),
        };
        let moving_changed = previous.map_or(true, |p| p.is_moving != position.is_moving);
        self.position = Some(position);
        if moved || moving_changed {
            self.pending.push_back(EventPayload::RotatorPosition(position));
        }
    }

    /// Sends `p` and waits for the next complete position reply
    async fn query_position(&mut self) -> Result<()> {
        let seen = self.replies;
        self.write(rotctl::get_position()).await?;
        while self.replies == seen {
            let line = self.read_line().await?;
            if let Some(code) = self.handle_line(&line) {
                if code < 0 {
                    return Err(Error::transport(format!(
                        "{} refused position query: RPRT {}",
                        self.endpoint, code
                    )));
                }
            }
        }
        Ok(())
    }

    async fn move_to(&mut self, bearing: f64) -> Result<()> {
        let elevation = self.position.map_or(0.0, |p| p.elevation);
        self.write(rotctl::set_position(bearing, elevation)).await?;
        loop {
            let line = self.read_line().await?;
            let Some(code) = self.handle_line(&line) else {
                continue;
            };
            if code < 0 {
                return Err(Error::validation(format!(
                    "rotator rejected move to {:.1}: RPRT {}",
                    bearing, code
                )));
            }
            break;
        }

        self.unchanged_polls = 0;
        if let Some(current) = self.position {
            let arrived = angular_distance(current.azimuth, bearing) <= self.tolerance;
            let position = RotatorPosition {
                target: (!arrived).then_some(bearing),
                is_moving: !arrived,
                ..current
            };
            self.position = Some(position);
            self.pending.push_back(EventPayload::RotatorPosition(position));
        }
        Ok(())
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(poll) => {
            poll.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Adapter for RotatorAdapter {
    async fn connect(&mut self) -> Result<()> {
        let stream = connect_tcp(&self.endpoint).await?;
        self.framed = Some(Framed::new(stream, LineCodec::new()));
        self.stats.record_connect();
        self.last_activity = Instant::now();
        self.partial_azimuth = None;
        self.position = None;
        self.unchanged_polls = 0;
        self.replies = 0;

        // rotctld has no greeting; a position query proves the link works
        self.query_position().await?;
        tracing::info!(endpoint = %self.endpoint, position = ?self.position, "Rotator connected");
        Ok(())
    }

    async fn start_monitoring(&mut self) -> Result<()> {
        // Subscribing requires an answered position query
        self.query_position().await?;
        let mut poll = interval(self.period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.poll = Some(poll);
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.poll = None;
        if let Some(mut framed) = self.framed.take() {
            let _ = SinkExt::<String>::close(&mut framed).await;
        }
        self.partial_azimuth = None;
        self.pending.clear();
        Ok(())
    }

    async fn send_command(&mut self, command: &Command) -> Result<()> {
        if self.framed.is_none() {
            return Err(not_connected(&self.endpoint));
        }
        match command {
            Command::MoveRotator { bearing } => {
                if !(0.0..=360.0).contains(bearing) {
                    return Err(Error::validation(format!(
                        "bearing {} is outside 0..=360 degrees",
                        bearing
                    )));
                }
                self.move_to(*bearing).await
            }
            other => Err(unsupported(other, Protocol::Rotctld)),
        }
    }

    async fn next_event(&mut self) -> Result<EventPayload> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let line = {
                let framed = &mut self.framed;
                let stats = &self.stats;
                let endpoint = &self.endpoint;
                tokio::select! {
                    _ = tick(&mut self.poll) => None,
                    line = next_item(framed, stats, endpoint) => Some(line?),
                }
            };

            match line {
                Some(line) => {
                    self.last_activity = Instant::now();
                    self.handle_line(&line);
                }
                None => self.write(rotctl::get_position()).await?,
            }
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn stall_timeout(&self) -> Option<Duration> {
        Some(self.period * STALL_POLLS)
    }
}
