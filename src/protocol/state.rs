use std::time::{Duration, Instant};

use rand::Rng;

use crate::core::{ConnectionState, Error, ReconnectPolicy, Result};

/// Whether `from -> to` is an edge of the connection state machine
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (from, to),
        (Disconnected, Discovering)
            | (Disconnected, Connecting)
            | (Discovering, Connecting)
            | (Discovering, Disconnected)
            | (Connecting, Connected)
            | (Connecting, Error)
            | (Connecting, Disconnected)
            | (Connected, Monitoring)
            | (Connected, Error)
            | (Connected, Disconnected)
            | (Monitoring, Connected)
            | (Monitoring, Error)
            | (Monitoring, Disconnected)
            | (Error, Connecting)
            | (Error, Disconnected)
    )
}

/// A completed transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State left
    pub from: ConnectionState,
    /// State entered
    pub to: ConnectionState,
    /// Failure description when entering `Error`
    pub error: Option<String>,
}

/// Connection state owned by one connection manager
#[derive(Debug)]
pub struct StateMachine {
    /// Current state
    state: ConnectionState,
    /// When the current state was entered
    entered_at: Instant,
    /// First entry into `Error` since the device was last healthy
    unreachable_since: Option<Instant>,
    /// Last failure message
    last_error: Option<String>,
}

impl StateMachine {
    /// Creates a machine in the given initial state
    pub fn new(initial: ConnectionState) -> Self {
        StateMachine {
            state: initial,
            entered_at: Instant::now(),
            unreachable_since: None,
            last_error: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Time spent in the current state
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// When the device stopped being reachable, if it currently is not
    pub fn unreachable_since(&self) -> Option<Instant> {
        self.unreachable_since
    }

    /// Last failure message
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Moves to `to`, refusing edges that are not in the table
    pub fn transition(&mut self, to: ConnectionState, error: Option<String>) -> Result<Transition> {
        let from = self.state;
        if !is_valid_transition(from, to) {
            return Err(Error::InvalidTransition { from, to });
        }

        self.state = to;
        self.entered_at = Instant::now();
        match to {
            ConnectionState::Error => {
                self.unreachable_since.get_or_insert(self.entered_at);
                self.last_error = error.clone();
            }
            ConnectionState::Connected | ConnectionState::Monitoring => {
                self.unreachable_since = None;
                self.last_error = None;
            }
            // An explicit disconnect is not a reachability failure
            ConnectionState::Disconnected if from != ConnectionState::Error => {
                self.unreachable_since = None;
            }
            _ => {}
        }

        Ok(Transition { from, to, error })
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Policy in use
    policy: ReconnectPolicy,
    /// Consecutive failed attempts
    attempts: u32,
}

impl Backoff {
    /// Creates a backoff for the given policy
    pub fn new(policy: ReconnectPolicy) -> Self {
        Backoff {
            policy,
            attempts: 0,
        }
    }

    /// Consecutive failures recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the retry budget is used up
    pub fn exhausted(&self) -> bool {
        self.policy
            .max_retries
            .is_some_and(|max| self.attempts >= max)
    }

    /// Delay before the next attempt, without jitter
    pub fn base_delay(&self) -> Duration {
        let exponent = i32::try_from(self.attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.policy.multiplier.powi(exponent);
        let secs = self.policy.initial_delay.as_secs_f64() * factor;
        let capped = secs.min(self.policy.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Records a failure and returns how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let base = self.base_delay().as_secs_f64();
        let jitter = self.policy.jitter;
        let scale = if jitter > 0.0 {
            rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let secs = (base * scale).min(self.policy.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Forgets past failures
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
