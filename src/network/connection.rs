//! Per-device connection manager
//!
//! One task per device. It owns the device's [`StateMachine`], its adapter and
//! its reconnect backoff, executes commands one at a time, and forwards every
//! adapter event to the hub. Everything else talks to it through a
//! [`ManagerHandle`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

use crate::adapter::{DeviceAdapter, LinkStats};
use crate::core::{
    Config, ConnectionState, DeviceDescriptor, DeviceFamily, Error, ReconnectPolicy, Result,
    TimeoutConfig,
};
use crate::protocol::{Backoff, Command, CommandPolicy, EventPayload, NormalizedEvent, StateMachine};

/// Published on every state change
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStatus {
    /// Current state
    pub state: ConnectionState,
    /// When the state was entered
    pub entered_at: Instant,
    /// When the device stopped being reachable, if it is not
    pub unreachable_since: Option<Instant>,
    /// Last failure message
    pub last_error: Option<String>,
}

/// How a manager starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Connect immediately
    pub auto_connect: bool,
    /// Found by a passive listener; after giving up the manager waits in
    /// `Discovering` for the next announcement
    pub passive: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            auto_connect: true,
            passive: false,
        }
    }
}

type Reply = oneshot::Sender<Result<()>>;

/// Requests accepted by a manager task
#[derive(Debug)]
enum ManagerRequest {
    /// Run a command and report the outcome
    Execute { command: Command, reply: Reply },
    /// The device announced itself again
    Announced,
}

/// Clears the busy flag when the command finishes or its caller goes away
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cloneable handle to a running connection manager
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    /// Device being managed
    descriptor: Arc<DeviceDescriptor>,
    /// Request queue of the manager task
    requests: mpsc::Sender<ManagerRequest>,
    /// Latest published status
    status: watch::Receiver<ManagerStatus>,
    /// Set while a command is in flight
    busy: Arc<AtomicBool>,
    /// Busy-versus-queue policy of the device family
    policy: CommandPolicy,
    /// Adapter counters
    stats: Arc<LinkStats>,
}

impl ManagerHandle {
    /// Device being managed
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Device family
    pub fn family(&self) -> DeviceFamily {
        self.descriptor.protocol.family()
    }

    /// Latest status
    pub fn status(&self) -> ManagerStatus {
        self.status.borrow().clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    /// Watch channel of status changes
    pub fn watch(&self) -> watch::Receiver<ManagerStatus> {
        self.status.clone()
    }

    /// Adapter counters
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Validates and runs a command, returning once the device accepted it
    pub async fn execute(&self, command: Command) -> Result<()> {
        command.validate(self.family(), self.state())?;

        let _guard = match (self.policy, command.is_lifecycle()) {
            (CommandPolicy::RejectWhenBusy, false) => {
                let guard = BusyGuard::acquire(&self.busy).ok_or_else(|| {
                    Error::busy(format!("{} is still executing a command", self.descriptor.key()))
                })?;
                Some(guard)
            }
            _ => None,
        };

        let (reply, response) = oneshot::channel();
        self.requests
            .try_send(ManagerRequest::Execute { command, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    Error::busy(format!("{} command queue is full", self.descriptor.key()))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Error::channel_closed(format!("{} manager has stopped", self.descriptor.key()))
                }
            })?;
        response.await.map_err(|_| {
            Error::channel_closed(format!("{} manager has stopped", self.descriptor.key()))
        })?
    }

    /// Tells the manager its device announced itself again
    pub fn announced(&self) {
        let _ = self.requests.try_send(ManagerRequest::Announced);
    }
}

/// Owner side of a manager task, kept by the registry
#[derive(Debug)]
pub struct ManagerTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ManagerTask {
    /// Cancels the manager and waits up to `grace` for it to release its transport
    pub async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let mut join = self.join;
        if timeout(grace, &mut join).await.is_err() {
            tracing::warn!(?grace, "Connection manager did not stop in time; aborting");
            join.abort();
        }
    }
}

/// What interrupted a wait
enum Interrupted<T> {
    Completed(T),
    Cancelled,
    Connect(Reply),
    Disconnect(Reply),
}

/// Manages one device's connection
pub struct ConnectionManager {
    descriptor: Arc<DeviceDescriptor>,
    adapter: DeviceAdapter,
    machine: StateMachine,
    backoff: Backoff,
    policy: ReconnectPolicy,
    options: ManagerOptions,
    timeouts: TimeoutConfig,
    requests: mpsc::Receiver<ManagerRequest>,
    status: watch::Sender<ManagerStatus>,
    events: mpsc::Sender<NormalizedEvent>,
    cancel: CancellationToken,
    /// Consecutive commands that went unanswered
    consecutive_timeouts: u32,
    /// When the current Monitoring period began
    monitoring_since: Option<Instant>,
}

impl ConnectionManager {
    /// Starts a manager task for a device
    pub fn spawn(
        descriptor: DeviceDescriptor,
        config: &Config,
        options: ManagerOptions,
        events: mpsc::Sender<NormalizedEvent>,
    ) -> (ManagerHandle, ManagerTask) {
        let descriptor = Arc::new(descriptor);
        let stats = Arc::new(LinkStats::new());
        let adapter = DeviceAdapter::new(&descriptor, config, Arc::clone(&stats));
        let machine = StateMachine::new(ConnectionState::Disconnected);
        let (status_tx, status_rx) = watch::channel(ManagerStatus {
            state: machine.state(),
            entered_at: Instant::now(),
            unreachable_since: None,
            last_error: None,
        });
        let (request_tx, request_rx) = mpsc::channel(config.hub.command_queue.max(1));
        let cancel = CancellationToken::new();

        let manager = ConnectionManager {
            descriptor: Arc::clone(&descriptor),
            adapter,
            machine,
            backoff: Backoff::new(config.reconnect.clone()),
            policy: config.reconnect.clone(),
            options,
            timeouts: config.timeouts.clone(),
            requests: request_rx,
            status: status_tx,
            events,
            cancel: cancel.clone(),
            consecutive_timeouts: 0,
            monitoring_since: None,
        };

        let handle = ManagerHandle {
            policy: CommandPolicy::for_family(descriptor.protocol.family()),
            descriptor,
            requests: request_tx,
            status: status_rx,
            busy: Arc::new(AtomicBool::new(false)),
            stats,
        };
        let join = tokio::spawn(manager.run());
        (handle, ManagerTask { cancel, join })
    }

    async fn run(mut self) {
        let key = self.descriptor.key();
        tracing::debug!(
            device = %key,
            endpoint = %self.descriptor.endpoint,
            "Connection manager started"
        );

        if self.options.auto_connect {
            self.enter(ConnectionState::Connecting, None).await;
        }

        loop {
            let running = match self.machine.state() {
                ConnectionState::Disconnected | ConnectionState::Discovering => self.idle().await,
                ConnectionState::Connecting => self.connecting().await,
                ConnectionState::Connected => self.subscribing().await,
                ConnectionState::Monitoring => self.monitoring().await,
                ConnectionState::Error => self.recovering().await,
            };
            if !running {
                break;
            }
        }

        if let Err(e) = self.adapter.disconnect().await {
            tracing::debug!(device = %key, error = %e, "Error closing transport");
        }
        if self.machine.state() != ConnectionState::Disconnected {
            self.enter(ConnectionState::Disconnected, None).await;
        }
        tracing::debug!(device = %key, "Connection manager stopped");
    }

    /// Applies a transition, publishes it and emits the state-change event
    async fn enter(&mut self, to: ConnectionState, error: Option<String>) {
        let dwell = self.machine.time_in_state();
        let transition = match self.machine.transition(to, error) {
            Ok(transition) => transition,
            Err(e) => {
                tracing::error!(
                    device = %self.descriptor.key(),
                    error = %e,
                    "Refused state transition"
                );
                return;
            }
        };

        match &transition.error {
            Some(error) => tracing::warn!(
                device = %self.descriptor.key(),
                from = ?transition.from,
                to = ?transition.to,
                ?dwell,
                %error,
                "Connection state changed"
            ),
            None => tracing::info!(
                device = %self.descriptor.key(),
                from = ?transition.from,
                to = ?transition.to,
                ?dwell,
                "Connection state changed"
            ),
        }

        self.monitoring_since = (to == ConnectionState::Monitoring).then(Instant::now);
        self.status.send_replace(ManagerStatus {
            state: self.machine.state(),
            entered_at: Instant::now(),
            unreachable_since: self.machine.unreachable_since(),
            last_error: self.machine.last_error().map(str::to_string),
        });
        self.emit(EventPayload::ConnectionStateChanged {
            from: transition.from,
            to: transition.to,
            error: transition.error,
        })
        .await;
    }

    async fn emit(&self, payload: EventPayload) {
        let event = NormalizedEvent::new(self.descriptor.identity.clone(), payload);
        if self.events.send(event).await.is_err() {
            tracing::trace!(device = %self.descriptor.key(), "Hub gone; event dropped");
        }
    }

    /// Closes the transport and enters `Error`
    async fn fail(&mut self, message: String) {
        if let Err(e) = self.adapter.disconnect().await {
            tracing::debug!(device = %self.descriptor.key(), error = %e, "Error closing transport");
        }
        self.consecutive_timeouts = 0;
        self.enter(ConnectionState::Error, Some(message)).await;
    }

    /// Disconnected or Discovering: wait for a request
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            request = self.requests.recv() => match request {
                Some(request) => {
                    self.handle_request(request).await;
                    true
                }
                None => false,
            },
        }
    }

    async fn connecting(&mut self) -> bool {
        let bound = self.timeouts.connect;
        let attempt = timeout(bound, self.adapter.connect());
        let state = ConnectionState::Connecting;
        match interruptible(attempt, &self.cancel, &mut self.requests, state, false).await {
            Interrupted::Completed(Ok(Ok(()))) => {
                self.enter(ConnectionState::Connected, None).await
            }
            Interrupted::Completed(Ok(Err(e))) => self.fail(e.to_string()).await,
            Interrupted::Completed(Err(_)) => {
                self.fail(format!("connect timed out after {:?}", bound)).await
            }
            Interrupted::Cancelled => return false,
            Interrupted::Connect(reply) => {
                let _ = reply.send(Ok(()));
            }
            Interrupted::Disconnect(reply) => self.disconnect_now(reply).await,
        }
        true
    }

    /// Connected: subscribe to the status stream
    async fn subscribing(&mut self) -> bool {
        let bound = self.timeouts.connect;
        let attempt = timeout(bound, self.adapter.start_monitoring());
        let state = ConnectionState::Connected;
        match interruptible(attempt, &self.cancel, &mut self.requests, state, false).await {
            Interrupted::Completed(Ok(Ok(()))) => {
                self.enter(ConnectionState::Monitoring, None).await
            }
            Interrupted::Completed(Ok(Err(e))) => {
                self.fail(format!("subscription failed: {}", e)).await
            }
            Interrupted::Completed(Err(_)) => {
                self.fail(format!("subscription timed out after {:?}", bound)).await
            }
            Interrupted::Cancelled => return false,
            Interrupted::Connect(reply) => {
                let _ = reply.send(Ok(()));
            }
            Interrupted::Disconnect(reply) => self.disconnect_now(reply).await,
        }
        true
    }

    async fn monitoring(&mut self) -> bool {
        loop {
            let since = self.monitoring_since.unwrap_or_else(Instant::now);
            let stall_deadline = self
                .adapter
                .stall_timeout()
                .map(|stall| self.adapter.last_activity().max(since) + stall);
            let stable_deadline =
                (self.backoff.attempts() > 0).then(|| since + self.policy.stable_period);

            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                request = self.requests.recv() => {
                    let Some(request) = request else { return false };
                    self.handle_request(request).await;
                    if self.machine.state() != ConnectionState::Monitoring {
                        return true;
                    }
                }
                event = self.adapter.next_event() => match event {
                    Ok(payload) => self.emit(payload).await,
                    Err(e) => {
                        self.fail(e.to_string()).await;
                        return true;
                    }
                },
                _ = sleep_until_opt(stall_deadline) => {
                    let stall = self.adapter.stall_timeout().unwrap_or_default();
                    if self.adapter.last_activity().max(since).elapsed() >= stall {
                        tracing::warn!(
                            device = %self.descriptor.key(),
                            ?stall,
                            "Status stream stalled; resubscribing"
                        );
                        self.enter(ConnectionState::Connected, None).await;
                        return true;
                    }
                }
                _ = sleep_until_opt(stable_deadline) => {
                    tracing::debug!(
                        device = %self.descriptor.key(),
                        "Connection stable; backoff reset"
                    );
                    self.backoff.reset();
                }
            }
        }
    }

    /// Error: wait out the backoff, then retry
    async fn recovering(&mut self) -> bool {
        if self.backoff.exhausted() {
            tracing::warn!(
                device = %self.descriptor.key(),
                attempts = self.backoff.attempts(),
                "Giving up reconnecting"
            );
            self.enter(ConnectionState::Disconnected, None).await;
            if self.options.passive {
                self.enter(ConnectionState::Discovering, None).await;
            }
            return true;
        }

        let delay = self.backoff.next_delay();
        tracing::info!(
            device = %self.descriptor.key(),
            attempt = self.backoff.attempts(),
            ?delay,
            "Reconnecting after backoff"
        );
        let wait = sleep(delay);
        let state = ConnectionState::Error;
        match interruptible(wait, &self.cancel, &mut self.requests, state, true).await {
            Interrupted::Completed(()) => self.enter(ConnectionState::Connecting, None).await,
            Interrupted::Cancelled => return false,
            Interrupted::Connect(reply) => {
                self.backoff.reset();
                let _ = reply.send(Ok(()));
                self.enter(ConnectionState::Connecting, None).await;
            }
            Interrupted::Disconnect(reply) => self.disconnect_now(reply).await,
        }
        true
    }

    async fn disconnect_now(&mut self, reply: Reply) {
        if let Err(e) = self.adapter.disconnect().await {
            tracing::debug!(device = %self.descriptor.key(), error = %e, "Error closing transport");
        }
        self.enter(ConnectionState::Disconnected, None).await;
        let _ = reply.send(Ok(()));
    }

    async fn handle_request(&mut self, request: ManagerRequest) {
        use ConnectionState::*;

        let (command, reply) = match request {
            ManagerRequest::Announced => {
                if self.machine.state() == Discovering {
                    self.backoff.reset();
                    self.enter(Connecting, None).await;
                }
                return;
            }
            ManagerRequest::Execute { command, reply } => (command, reply),
        };

        match (&command, self.machine.state()) {
            (Command::Connect, Disconnected | Discovering | Error) => {
                self.backoff.reset();
                self.enter(Connecting, None).await;
                let _ = reply.send(Ok(()));
            }
            (Command::Connect, _) => {
                let _ = reply.send(Ok(()));
            }
            (Command::Disconnect, Disconnected) => {
                let _ = reply.send(Ok(()));
            }
            (Command::Disconnect, _) => self.disconnect_now(reply).await,
            (_, state) => {
                if let Err(e) = command.validate(self.descriptor.protocol.family(), state) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.execute(command, reply).await;
            }
        }
    }

    /// Runs one device command, bounded by the command timeout
    async fn execute(&mut self, command: Command, reply: Reply) {
        let bound = self.timeouts.command;
        tracing::debug!(
            device = %self.descriptor.key(),
            command = command.name(),
            "Executing command"
        );

        match timeout(bound, self.adapter.send_command(&command)).await {
            Ok(Ok(())) => {
                self.consecutive_timeouts = 0;
                let _ = reply.send(Ok(()));
            }
            Ok(Err(e)) if e.is_transport() => {
                let message = e.to_string();
                let _ = reply.send(Err(e));
                self.fail(message).await;
            }
            Ok(Err(e)) => {
                // The device answered, so the link is alive
                self.consecutive_timeouts = 0;
                let _ = reply.send(Err(e));
            }
            Err(_) => {
                self.consecutive_timeouts += 1;
                let _ = reply.send(Err(Error::command_timeout(format!(
                    "{} got no reply within {:?}",
                    command.name(),
                    bound
                ))));
                if self.consecutive_timeouts >= self.timeouts.command_failure_threshold {
                    let message = format!(
                        "silent transport failure: {} consecutive command timeouts",
                        self.consecutive_timeouts
                    );
                    self.fail(message).await;
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Drives `fut` while still answering requests.
///
/// Device commands are refused because the device is not ready for them;
/// disconnect (and connect when `connect_interrupts`) abandon the wait.
async fn interruptible<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    requests: &mut mpsc::Receiver<ManagerRequest>,
    state: ConnectionState,
    connect_interrupts: bool,
) -> Interrupted<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Interrupted::Cancelled,
            output = &mut fut => return Interrupted::Completed(output),
            request = requests.recv() => match request {
                None => return Interrupted::Cancelled,
                Some(ManagerRequest::Announced) => {}
                Some(ManagerRequest::Execute { command: Command::Disconnect, reply }) => {
                    return Interrupted::Disconnect(reply)
                }
                Some(ManagerRequest::Execute { command: Command::Connect, reply }) => {
                    if connect_interrupts {
                        return Interrupted::Connect(reply);
                    }
                    let _ = reply.send(Ok(()));
                }
                Some(ManagerRequest::Execute { command, reply }) => {
                    let _ = reply.send(Err(Error::validation(format!(
                        "{} requires a connected device, current state is {:?}",
                        command.name(),
                        state
                    ))));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::amplifier::fake::{serve_one, Behaviour};
    use crate::adapter::testing::{listener, LinePeer};
    use crate::core::Protocol;
    use crate::protocol::{is_valid_transition, AmplifierMode};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.reconnect.initial_delay = Duration::from_millis(20);
        config.reconnect.max_delay = Duration::from_millis(100);
        config.reconnect.jitter = 0.0;
        config.timeouts.connect = Duration::from_millis(500);
        config.timeouts.command = Duration::from_millis(100);
        config.timeouts.command_failure_threshold = 2;
        config.polling.amplifier_stall = Duration::from_secs(5);
        config
    }

    type Transition = (ConnectionState, ConnectionState, Option<String>);

    async fn next_transition(events: &mut mpsc::Receiver<NormalizedEvent>) -> Transition {
        loop {
            let event = timeout(Duration::from_secs(3), events.recv())
                .await
                .expect("timed out waiting for a transition")
                .expect("event channel closed");
            if let EventPayload::ConnectionStateChanged { from, to, error } = event.payload {
                return (from, to, error);
            }
        }
    }

    async fn wait_for(
        events: &mut mpsc::Receiver<NormalizedEvent>,
        state: ConnectionState,
    ) -> Vec<Transition> {
        let mut seen = Vec::new();
        loop {
            let transition = next_transition(events).await;
            let done = transition.1 == state;
            seen.push(transition);
            if done {
                return seen;
            }
        }
    }

    fn assert_valid_path(path: &[Transition]) {
        for window in path.windows(2) {
            assert_eq!(window[0].1, window[1].0, "discontinuous path {:?}", path);
        }
        for (from, to, _) in path {
            assert!(is_valid_transition(*from, *to), "invalid edge {:?} -> {:?}", from, to);
        }
    }

    fn spawn_amp(
        addr: String,
        config: &Config,
    ) -> (ManagerHandle, ManagerTask, mpsc::Receiver<NormalizedEvent>) {
        let (events, rx) = mpsc::channel(256);
        let descriptor = DeviceDescriptor::direct(Protocol::Amplifier, addr);
        let options = ManagerOptions::default();
        let (handle, task) = ConnectionManager::spawn(descriptor, config, options, events);
        (handle, task, rx)
    }

    #[tokio::test]
    async fn test_socket_reset_goes_through_error_and_reconnects() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            serve_one(&listener, Behaviour::ResetAfter { frames: 3 }).await;
            serve_one(&listener, Behaviour::Stream { period: Duration::from_millis(20) }).await;
        });

        let (handle, task, mut events) = spawn_amp(addr, &fast_config());
        let mut path = wait_for(&mut events, ConnectionState::Monitoring).await;
        path.extend(wait_for(&mut events, ConnectionState::Error).await);

        let (from, to, error) = path.last().cloned().unwrap();
        assert_eq!((from, to), (ConnectionState::Monitoring, ConnectionState::Error));
        assert!(error.is_some_and(|e| !e.is_empty()));
        assert!(handle.status().unreachable_since.is_some());

        let next = next_transition(&mut events).await;
        assert_eq!((next.0, next.1), (ConnectionState::Error, ConnectionState::Connecting));
        path.push(next);
        path.extend(wait_for(&mut events, ConnectionState::Monitoring).await);
        assert_valid_path(&path);
        assert_eq!(path[0].0, ConnectionState::Disconnected);
        assert!(handle.status().unreachable_since.is_none());
        assert!(handle.stats().connects() >= 2);
        assert!(handle.stats().messages() > 0);

        task.stop(Duration::from_secs(1)).await;
        let last = wait_for(&mut events, ConnectionState::Disconnected).await;
        assert_valid_path(&last);
    }

    #[tokio::test]
    async fn test_connect_refused_backs_off_and_gives_up() {
        let (listener, addr) = listener().await;
        drop(listener);

        let mut config = fast_config();
        config.reconnect.max_retries = Some(2);
        let (handle, _task, mut events) = spawn_amp(addr, &config);
        let path = wait_for(&mut events, ConnectionState::Disconnected).await;
        assert_valid_path(&path);
        let errors = path.iter().filter(|t| t.1 == ConnectionState::Error).count();
        assert_eq!(errors, 3);
        assert!(path
            .iter()
            .filter(|t| t.1 == ConnectionState::Error)
            .all(|t| t.2.is_some()));
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        // Commands are refused until the device is connected
        let err = handle
            .execute(Command::SetAmplifierMode { mode: AmplifierMode::Operate })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_command_timeouts_force_error() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            serve_one(&listener, Behaviour::IgnoreCommands).await;
        });

        let (handle, _task, mut events) = spawn_amp(addr, &fast_config());
        wait_for(&mut events, ConnectionState::Monitoring).await;

        for _ in 0..2 {
            let err = handle
                .execute(Command::SetAmplifierMode { mode: AmplifierMode::Operate })
                .await
                .unwrap_err();
            assert!(matches!(err, Error::CommandTimeout(_)), "got {:?}", err);
        }
        let (from, to, error) = next_transition(&mut events).await;
        assert_eq!((from, to), (ConnectionState::Monitoring, ConnectionState::Error));
        assert!(error.unwrap().contains("silent transport failure"));
    }

    #[tokio::test]
    async fn test_second_command_rejected_while_busy() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            serve_one(&listener, Behaviour::IgnoreCommands).await;
        });

        let mut config = fast_config();
        config.timeouts.command = Duration::from_millis(300);
        config.timeouts.command_failure_threshold = 10;
        let (handle, _task, mut events) = spawn_amp(addr, &config);
        wait_for(&mut events, ConnectionState::Monitoring).await;

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .execute(Command::SetAmplifierMode { mode: AmplifierMode::Operate })
                    .await
            })
        };
        sleep(Duration::from_millis(50)).await;
        let second = handle
            .execute(Command::SetAmplifierMode { mode: AmplifierMode::Standby })
            .await;
        assert!(matches!(second, Err(Error::Busy(_))));
        assert!(matches!(first.await.unwrap(), Err(Error::CommandTimeout(_))));

        // Wrong family is a validation error, not busy
        let err = handle.execute(Command::MoveRotator { bearing: 90.0 }).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect_commands() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let period = Duration::from_millis(50);
            serve_one(&listener, Behaviour::Stream { period }).await;
            serve_one(&listener, Behaviour::Stream { period }).await;
        });

        let (handle, _task, mut events) = spawn_amp(addr, &fast_config());
        wait_for(&mut events, ConnectionState::Monitoring).await;

        handle.execute(Command::Disconnect).await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        let path = wait_for(&mut events, ConnectionState::Disconnected).await;
        assert_eq!(path.last().unwrap().0, ConnectionState::Monitoring);

        handle.execute(Command::Disconnect).await.unwrap();
        handle.execute(Command::Connect).await.unwrap();
        let path = wait_for(&mut events, ConnectionState::Monitoring).await;
        assert_valid_path(&path);
        assert_eq!(path[0], (ConnectionState::Disconnected, ConnectionState::Connecting, None));
    }

    #[tokio::test]
    async fn test_stalled_stream_resubscribes() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            serve_one(&listener, Behaviour::IgnoreCommands).await;
        });

        let mut config = fast_config();
        config.polling.amplifier_stall = Duration::from_millis(100);
        let (_handle, _task, mut events) = spawn_amp(addr, &config);
        wait_for(&mut events, ConnectionState::Monitoring).await;

        let (from, to, error) = next_transition(&mut events).await;
        assert_eq!(
            (from, to, error),
            (ConnectionState::Monitoring, ConnectionState::Connected, None)
        );
        let (from, to, _) = next_transition(&mut events).await;
        assert_eq!((from, to), (ConnectionState::Connected, ConnectionState::Monitoring));
    }

    #[tokio::test]
    async fn test_silent_rotator_reaches_error() {
        let (listener, addr) = listener().await;
        // Answers the connect and first subscribe queries, then goes quiet
        tokio::spawn(async move {
            let mut peer = LinePeer::accept(&listener).await;
            let mut answers = 2;
            while let Some(line) = peer.recv().await {
                if line == "p" && answers > 0 {
                    answers -= 1;
                    peer.send("90.000000").await;
                    peer.send("0.000000").await;
                }
            }
        });

        let mut config = fast_config();
        config.polling.rotator_interval = Duration::from_millis(20);
        config.timeouts.connect = Duration::from_millis(200);
        let (events, mut rx) = mpsc::channel(256);
        let descriptor = DeviceDescriptor::direct(Protocol::Rotctld, addr);
        let options = ManagerOptions::default();
        let (_handle, _task) = ConnectionManager::spawn(descriptor, &config, options, events);

        let path = wait_for(&mut rx, ConnectionState::Error).await;
        assert_valid_path(&path);
        let states: Vec<ConnectionState> = path.iter().map(|t| t.1).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Monitoring,
                ConnectionState::Connected,
                ConnectionState::Error,
            ]
        );
        let error = path.last().and_then(|t| t.2.clone()).unwrap();
        assert!(error.contains("subscription timed out"), "got {}", error);
    }

    #[tokio::test]
    async fn test_manual_start_waits_for_connect() {
        let (events, mut rx) = mpsc::channel(16);
        let descriptor = DeviceDescriptor::direct(Protocol::Rotctld, "127.0.0.1:1");
        let options = ManagerOptions {
            auto_connect: false,
            passive: true,
        };
        let config = Config::default();
        let (handle, task) = ConnectionManager::spawn(descriptor, &config, options, events);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());

        task.stop(Duration::from_secs(1)).await;
        assert!(matches!(handle.execute(Command::Connect).await, Err(Error::ChannelClosed(_))));
    }
}
