use dashmap::DashMap;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ChannelState};
use crate::config::ClientConfig;
use crate::protocol::{self, ClientFrame, ServerFrame};
use crate::router::Router;
use crate::transport::Transport;

/// How often pending join/leave deadlines are checked.
const DEADLINE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Socket lifecycle. At most one live transport per client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketState::Disconnected => write!(f, "disconnected"),
            SocketState::Connecting => write!(f, "connecting"),
            SocketState::Open => write!(f, "open"),
            SocketState::Closing => write!(f, "closing"),
            SocketState::Closed => write!(f, "closed"),
            SocketState::Errored => write!(f, "errored"),
        }
    }
}

/// Transport-level errors. Handled locally by the reconnect policy and
/// surfaced to `on_error` observers for visibility only.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    ConnectFailed(String),
    Transport(String),
    HeartbeatTimeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
            ConnectionError::Transport(reason) => write!(f, "transport error: {}", reason),
            ConnectionError::HeartbeatTimeout => write!(f, "heartbeat timed out"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Requests issued by the public API; processed serially by the core task.
#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Join { topic: String },
    Leave { topic: String },
}

pub type OpenCallback = Arc<dyn Fn() + Send + Sync>;
pub type SocketErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;

/// Socket state and observer lists, shared between the client handle and the
/// core task. Observers are invoked in registration order, snapshot-first so
/// registration is safe while a notification is in flight.
pub(crate) struct SocketShared {
    state: RwLock<SocketState>,
    open_callbacks: RwLock<Vec<OpenCallback>>,
    close_callbacks: RwLock<Vec<OpenCallback>>,
    error_callbacks: RwLock<Vec<SocketErrorCallback>>,
}

impl SocketShared {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(SocketState::Disconnected),
            open_callbacks: RwLock::new(Vec::new()),
            close_callbacks: RwLock::new(Vec::new()),
            error_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> SocketState {
        *self.state.read().unwrap()
    }

    pub(crate) fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.open_callbacks.write().unwrap().push(Arc::new(callback));
    }

    pub(crate) fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.close_callbacks.write().unwrap().push(Arc::new(callback));
    }

    pub(crate) fn on_error(&self, callback: impl Fn(ConnectionError) + Send + Sync + 'static) {
        self.error_callbacks.write().unwrap().push(Arc::new(callback));
    }

    fn set_state(&self, next: SocketState) {
        *self.state.write().unwrap() = next;
    }

    fn notify_open(&self) {
        let callbacks: Vec<OpenCallback> = self.open_callbacks.read().unwrap().clone();
        for callback in callbacks {
            (*callback)();
        }
    }

    fn notify_close(&self) {
        let callbacks: Vec<OpenCallback> = self.close_callbacks.read().unwrap().clone();
        for callback in callbacks {
            (*callback)();
        }
    }

    fn notify_error(&self, error: ConnectionError) {
        let callbacks: Vec<SocketErrorCallback> = self.error_callbacks.read().unwrap().clone();
        for callback in callbacks {
            (*callback)(error.clone());
        }
    }
}

struct ActiveConnection {
    outbound: tokio::sync::mpsc::Sender<ClientFrame>,
    inbound: tokio::sync::mpsc::Receiver<ServerFrame>,
    /// True while a heartbeat ack is outstanding
    awaiting_heartbeat: bool,
}

enum LoopEvent {
    Command(Option<Command>),
    Frame(Option<ServerFrame>),
    ReconnectDue,
    HeartbeatDue,
    SweepDue,
}

/// Core task: owns the transport, the rejoin set, pending join/leave
/// deadlines, the heartbeat, and the reconnect timer.
///
/// All inbound frame processing is serialized through this task: one frame is
/// fully routed (callbacks included) before the next is taken, which gives
/// deterministic, in-order delivery per channel. The public API never blocks
/// on the server; it sends `Command`s into this loop.
pub(crate) struct Core {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    channels: Arc<DashMap<String, Arc<Channel>>>,
    router: Router,
    shared: Arc<SocketShared>,
    conn: Option<ActiveConnection>,
    /// Topics to (re)join whenever a connection is established
    rejoin: HashSet<String>,
    pending_joins: HashMap<String, Instant>,
    pending_leaves: HashMap<String, Instant>,
    reconnect_at: Option<Instant>,
    attempt: u32,
}

impl Core {
    pub(crate) fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        channels: Arc<DashMap<String, Arc<Channel>>>,
        shared: Arc<SocketShared>,
    ) -> Self {
        let router = Router::new(Arc::clone(&channels));
        Self {
            config,
            transport,
            channels,
            router,
            shared,
            conn: None,
            rejoin: HashSet::new(),
            pending_joins: HashMap::new(),
            pending_leaves: HashMap::new(),
            reconnect_at: None,
            attempt: 0,
        }
    }

    pub(crate) async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        let heartbeat_period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval_at(
            Instant::now() + DEADLINE_SWEEP_INTERVAL,
            DEADLINE_SWEEP_INTERVAL,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            match self.next_event(&mut commands, &mut heartbeat, &mut sweep).await {
                LoopEvent::Command(None) => break, // client handle dropped
                LoopEvent::Command(Some(command)) => self.handle_command(command).await,
                LoopEvent::Frame(Some(frame)) => self.handle_frame(frame),
                LoopEvent::Frame(None) => {
                    self.connection_lost(ConnectionError::Transport(
                        "connection closed by peer".to_string(),
                    ));
                }
                LoopEvent::ReconnectDue => self.try_connect().await,
                LoopEvent::HeartbeatDue => self.send_heartbeat().await,
                LoopEvent::SweepDue => self.sweep_deadlines(),
            }
        }

        debug!("client dropped, connection task exiting");
    }

    async fn next_event(
        &mut self,
        commands: &mut UnboundedReceiver<Command>,
        heartbeat: &mut Interval,
        sweep: &mut Interval,
    ) -> LoopEvent {
        let connected = self.conn.is_some();
        let reconnect_at = self.reconnect_at;
        let has_deadlines = !self.pending_joins.is_empty() || !self.pending_leaves.is_empty();

        tokio::select! {
            command = commands.recv() => LoopEvent::Command(command),
            frame = Self::next_frame(&mut self.conn), if connected => LoopEvent::Frame(frame),
            _ = Self::sleep_until_opt(reconnect_at), if reconnect_at.is_some() => LoopEvent::ReconnectDue,
            _ = heartbeat.tick(), if connected => LoopEvent::HeartbeatDue,
            _ = sweep.tick(), if has_deadlines => LoopEvent::SweepDue,
        }
    }

    async fn next_frame(conn: &mut Option<ActiveConnection>) -> Option<ServerFrame> {
        match conn {
            Some(active) => active.inbound.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn sleep_until_opt(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.conn.is_some() {
                    debug!("connect requested while already connected, ignoring");
                    return;
                }
                self.attempt = 0;
                self.try_connect().await;
            }
            Command::Disconnect => self.handle_disconnect(),
            Command::Join { topic } => self.handle_join(topic).await,
            Command::Leave { topic } => self.handle_leave(topic).await,
        }
    }

    /// Manual disconnect. Cancels any pending reconnect attempt, so a timer
    /// firing later can never race a disconnect the application asked for.
    fn handle_disconnect(&mut self) {
        self.reconnect_at = None;
        self.attempt = 0;
        self.pending_joins.clear();

        // Channels awaiting a leave ack close now; the transport is going away.
        let leaving: Vec<String> = self.pending_leaves.drain().map(|(topic, _)| topic).collect();
        for topic in leaving {
            if let Some((_, chan)) = self.channels.remove(&topic) {
                chan.set_state(ChannelState::Closed, None);
            }
        }

        let had_transport = self.conn.take().is_some();
        if had_transport {
            self.shared.set_state(SocketState::Closing);
        }

        // Joined channels fall back to Joining and stay in the rejoin set, so
        // a later connect() resubscribes them with callbacks intact. Snapshot
        // before notifying: state callbacks may touch the registry.
        let chans: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for chan in chans {
            if chan.state() == ChannelState::Joined {
                chan.set_state(ChannelState::Joining, None);
            }
        }

        self.shared.set_state(SocketState::Closed);
        if had_transport {
            self.shared.notify_close();
        }
        info!("disconnected");
    }

    async fn handle_join(&mut self, topic: String) {
        let Some(chan) = self.channels.get(&topic).map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        match chan.state() {
            ChannelState::Unjoined => {}
            // Already in flight, active, or terminal; subscribe() only added
            // an observer
            _ => return,
        }

        self.rejoin.insert(topic.clone());
        chan.set_state(ChannelState::Joining, None);
        if self.conn.is_some() {
            self.send_join(&topic).await;
        }
        // Otherwise the topic waits in the rejoin set until connect()
    }

    async fn handle_leave(&mut self, topic: String) {
        self.rejoin.remove(&topic);
        self.pending_joins.remove(&topic);

        let Some(chan) = self.channels.get(&topic).map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        if chan.state().is_terminal() || self.pending_leaves.contains_key(&topic) {
            return;
        }

        if self.conn.is_some()
            && matches!(chan.state(), ChannelState::Joined | ChannelState::Joining)
        {
            let frame = ClientFrame::Leave {
                topic: topic.clone(),
                frame_ref: protocol::next_ref(),
            };
            let deadline = Instant::now() + self.config.join_timeout();
            if self.send_frame(frame).await {
                // Advisory until acknowledged: the channel stays joined (and
                // keeps delivering) until LeaveOk or the deadline.
                self.pending_leaves.insert(topic, deadline);
                return;
            }
        }

        // Not connected: close locally
        chan.set_state(ChannelState::Closed, None);
        self.channels.remove(&topic);
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::JoinOk { topic, .. } => {
                self.pending_joins.remove(&topic);
                if let Some(chan) = self.channels.get(&topic).map(|entry| Arc::clone(entry.value())) {
                    info!(topic = %topic, "channel joined");
                    chan.set_state(ChannelState::Joined, None);
                }
            }
            ServerFrame::JoinError { topic, reason, .. } => {
                self.pending_joins.remove(&topic);
                self.rejoin.remove(&topic);
                if let Some((_, chan)) = self.channels.remove(&topic) {
                    warn!(topic = %topic, reason = %reason, "join rejected");
                    chan.set_state(
                        ChannelState::Errored,
                        Some(ChannelError::JoinRejected(reason)),
                    );
                }
            }
            ServerFrame::LeaveOk { topic, .. } => {
                self.pending_leaves.remove(&topic);
                if let Some((_, chan)) = self.channels.remove(&topic) {
                    info!(topic = %topic, "channel left");
                    chan.set_state(ChannelState::Closed, None);
                }
            }
            ServerFrame::HeartbeatOk { .. } => {
                if let Some(active) = self.conn.as_mut() {
                    active.awaiting_heartbeat = false;
                }
            }
            ServerFrame::ChannelError { topic, reason } => {
                self.rejoin.remove(&topic);
                self.pending_joins.remove(&topic);
                self.pending_leaves.remove(&topic);
                if let Some((_, chan)) = self.channels.remove(&topic) {
                    warn!(topic = %topic, reason = %reason, "channel errored");
                    chan.set_state(ChannelState::Errored, Some(ChannelError::Faulted(reason)));
                }
            }
            ServerFrame::Event { topic, change } => self.router.dispatch(&topic, change),
        }
    }

    async fn try_connect(&mut self) {
        self.reconnect_at = None;
        self.shared.set_state(SocketState::Connecting);
        info!(url = %self.config.url, "connecting");

        match self.transport.connect(&self.config.url).await {
            Ok(pair) => {
                self.conn = Some(ActiveConnection {
                    outbound: pair.outbound,
                    inbound: pair.inbound,
                    awaiting_heartbeat: false,
                });
                self.attempt = 0;
                self.shared.set_state(SocketState::Open);
                self.shared.notify_open();
                info!("connected");
                self.rejoin_channels().await;
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.shared.set_state(SocketState::Disconnected);
                self.shared
                    .notify_error(ConnectionError::ConnectFailed(e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    /// Resubscribe every topic in the rejoin set on a fresh connection. No
    /// application intervention; registered callbacks are untouched.
    async fn rejoin_channels(&mut self) {
        let topics: Vec<String> = self.rejoin.iter().cloned().collect();
        for topic in topics {
            match self.channels.get(&topic).map(|entry| Arc::clone(entry.value())) {
                Some(chan) => {
                    chan.set_state(ChannelState::Joining, None);
                    self.send_join(&topic).await;
                }
                None => {
                    self.rejoin.remove(&topic);
                }
            }
        }
    }

    async fn send_join(&mut self, topic: &str) {
        let frame = ClientFrame::Join {
            topic: topic.to_string(),
            frame_ref: protocol::next_ref(),
        };
        let deadline = Instant::now() + self.config.join_timeout();
        if self.send_frame(frame).await {
            self.pending_joins.insert(topic.to_string(), deadline);
        }
    }

    /// Send one frame on the active connection. Returns false (after running
    /// the connection-lost path) when there is no usable transport.
    async fn send_frame(&mut self, frame: ClientFrame) -> bool {
        let Some(outbound) = self.conn.as_ref().map(|active| active.outbound.clone()) else {
            return false;
        };
        if outbound.send(frame).await.is_err() {
            self.connection_lost(ConnectionError::Transport("send failed".to_string()));
            return false;
        }
        true
    }

    async fn send_heartbeat(&mut self) {
        let awaiting = match self.conn.as_ref() {
            Some(active) => active.awaiting_heartbeat,
            None => return,
        };
        if awaiting {
            // Previous heartbeat never acked; recycle the connection
            self.connection_lost(ConnectionError::HeartbeatTimeout);
            return;
        }
        let frame = ClientFrame::Heartbeat {
            frame_ref: protocol::next_ref(),
        };
        if self.send_frame(frame).await {
            if let Some(active) = self.conn.as_mut() {
                active.awaiting_heartbeat = true;
            }
        }
    }

    /// Unexpected transport loss: notify observers, park joined channels in
    /// the rejoin set, and schedule a backoff reconnect.
    fn connection_lost(&mut self, error: ConnectionError) {
        if self.conn.take().is_none() {
            return;
        }
        warn!(error = %error, "connection lost");
        self.shared.set_state(SocketState::Errored);
        self.shared.notify_error(error);

        self.pending_joins.clear();
        let leaving: Vec<String> = self.pending_leaves.drain().map(|(topic, _)| topic).collect();
        for topic in leaving {
            if let Some((_, chan)) = self.channels.remove(&topic) {
                chan.set_state(ChannelState::Closed, None);
            }
        }

        let chans: Vec<Arc<Channel>> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for chan in chans {
            if chan.state() == ChannelState::Joined {
                chan.set_state(ChannelState::Joining, None);
            }
        }

        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = backoff_delay(
            self.config.reconnect_initial(),
            self.config.reconnect_max(),
            self.attempt,
        );
        self.attempt = self.attempt.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
    }

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();

        let expired: Vec<String> = self
            .pending_joins
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in expired {
            self.pending_joins.remove(&topic);
            self.rejoin.remove(&topic);
            if let Some((_, chan)) = self.channels.remove(&topic) {
                warn!(topic = %topic, "join timed out");
                chan.set_state(ChannelState::TimedOut, Some(ChannelError::JoinTimeout));
            }
        }

        let expired: Vec<String> = self
            .pending_leaves
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in expired {
            self.pending_leaves.remove(&topic);
            if let Some((_, chan)) = self.channels.remove(&topic) {
                debug!(topic = %topic, "leave ack timed out, closing locally");
                chan.set_state(ChannelState::Closed, None);
            }
        }
    }
}

/// Exponential backoff capped at `max`, with downward jitter so a fleet of
/// clients does not reconnect in lockstep.
fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = initial.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(max);
    capped.mul_f64(0.5 + rand::thread_rng().gen::<f64>() * 0.5)
}
