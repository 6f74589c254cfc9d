use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connection::Command;
use crate::filter::Filter;
use crate::message::Message;

#[cfg(test)]
mod tests;

/// Lifecycle of one subscription handle.
///
/// `Closed`, `Errored` and `TimedOut` are terminal for the handle instance;
/// resubscribing to the topic requires a fresh handle from
/// `RealtimeClient::channel`. `Joined -> Joining` happens when the transport
/// drops: the handle stays alive and re-enters `Joined` after the connection
/// manager rejoins it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unjoined,
    Joining,
    Joined,
    Closed,
    Errored,
    TimedOut,
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelState::Closed | ChannelState::Errored | ChannelState::TimedOut
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Unjoined => write!(f, "unjoined"),
            ChannelState::Joining => write!(f, "joining"),
            ChannelState::Joined => write!(f, "joined"),
            ChannelState::Closed => write!(f, "closed"),
            ChannelState::Errored => write!(f, "errored"),
            ChannelState::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Channel-level errors. These terminate the channel's state machine and are
/// surfaced to its own observers; sibling channels are unaffected.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Server refused the join request
    JoinRejected(String),
    /// No join acknowledgment within the configured timeout
    JoinTimeout,
    /// Post-join fault reported by the server
    Faulted(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::JoinRejected(reason) => write!(f, "join rejected: {}", reason),
            ChannelError::JoinTimeout => write!(f, "join timed out"),
            ChannelError::Faulted(reason) => write!(f, "channel error: {}", reason),
        }
    }
}

impl std::error::Error for ChannelError {}

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ChannelState, Option<ChannelError>) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ChannelError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// One (filter, callback) registration.
#[derive(Clone)]
struct Binding {
    filter: Filter,
    callback: MessageCallback,
}

/// Handle for one topic subscription over the shared connection.
///
/// Registration is chainable, mirroring the callback-style API the client
/// exposes to applications:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use ripple::{ClientConfig, RealtimeClient};
/// # use ripple::filter::{EventFilter, Filter};
/// # use ripple::transport::TcpTransport;
/// # let client = RealtimeClient::new(ClientConfig::default(), Arc::new(TcpTransport));
/// let channel = client.channel("public");
/// channel
///     .on(Filter::event(EventFilter::Insert).schema("public"), |msg| {
///         println!("insert: {:?}", msg.payload);
///     })
///     .on(Filter::event(EventFilter::Delete).schema("public"), |msg| {
///         println!("delete: {:?}", msg.payload);
///     });
/// channel.subscribe(|state, _err| println!("channel is {}", state));
/// ```
pub struct Channel {
    topic: String,
    state: RwLock<ChannelState>,
    bindings: RwLock<Vec<Binding>>,
    state_callbacks: RwLock<Vec<StateCallback>>,
    error_callbacks: RwLock<Vec<ErrorCallback>>,
    close_callbacks: RwLock<Vec<CloseCallback>>,
    /// Ensures on_error/on_close observers fire at most once
    terminal_notified: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(topic: impl Into<String>, commands: mpsc::UnboundedSender<Command>) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.into(),
            state: RwLock::new(ChannelState::Unjoined),
            bindings: RwLock::new(Vec::new()),
            state_callbacks: RwLock::new(Vec::new()),
            error_callbacks: RwLock::new(Vec::new()),
            close_callbacks: RwLock::new(Vec::new()),
            terminal_notified: AtomicBool::new(false),
            commands,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state of the handle.
    pub fn state(&self) -> ChannelState {
        *self.state.read().unwrap()
    }

    /// True iff the current state is exactly `Joined`.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Register a callback for changes matching `filter`. Chainable; callbacks
    /// fire in registration order. Safe to call while delivery is in progress.
    pub fn on(&self, filter: Filter, callback: impl Fn(Message) + Send + Sync + 'static) -> &Self {
        self.bindings.write().unwrap().push(Binding {
            filter,
            callback: Arc::new(callback),
        });
        self
    }

    /// Register an observer for the terminal error transition. Fires at most
    /// once per handle.
    pub fn on_error(&self, callback: impl Fn(ChannelError) + Send + Sync + 'static) -> &Self {
        self.error_callbacks.write().unwrap().push(Arc::new(callback));
        self
    }

    /// Register an observer for the `Closed` transition. Fires at most once.
    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) -> &Self {
        self.close_callbacks.write().unwrap().push(Arc::new(callback));
        self
    }

    /// Request the join and observe state transitions. Returns immediately;
    /// the outcome (`Joined`, `Errored`, `TimedOut`) arrives via the callback.
    ///
    /// Calling subscribe on a handle that is already joining or joined only
    /// adds the state observer; no second join request is sent.
    pub fn subscribe(
        &self,
        state_callback: impl Fn(ChannelState, Option<ChannelError>) + Send + Sync + 'static,
    ) {
        self.state_callbacks
            .write()
            .unwrap()
            .push(Arc::new(state_callback));
        if self
            .commands
            .send(Command::Join {
                topic: self.topic.clone(),
            })
            .is_err()
        {
            debug!(topic = %self.topic, "subscribe after client shutdown, ignoring");
        }
    }

    /// Request the leave. Advisory until acknowledged: frames already routed
    /// may still be delivered, but nothing is delivered after `Closed`.
    pub fn unsubscribe(&self) {
        if self
            .commands
            .send(Command::Leave {
                topic: self.topic.clone(),
            })
            .is_err()
        {
            debug!(topic = %self.topic, "unsubscribe after client shutdown, ignoring");
        }
    }

    /// Transition the state machine and notify observers. Driven only by the
    /// connection manager; terminal states are sticky.
    pub(crate) fn set_state(&self, next: ChannelState, error: Option<ChannelError>) {
        {
            let mut state = self.state.write().unwrap();
            if state.is_terminal() || *state == next {
                return;
            }
            *state = next;
        }

        // Snapshot, then invoke without the lock so callbacks can re-register.
        let state_callbacks: Vec<StateCallback> =
            self.state_callbacks.read().unwrap().clone();
        for callback in state_callbacks {
            (*callback)(next, error.clone());
        }

        if next.is_terminal() && !self.terminal_notified.swap(true, Ordering::SeqCst) {
            match next {
                ChannelState::Closed => {
                    let callbacks: Vec<CloseCallback> =
                        self.close_callbacks.read().unwrap().clone();
                    for callback in callbacks {
                        (*callback)();
                    }
                }
                ChannelState::Errored | ChannelState::TimedOut => {
                    let err = error.unwrap_or(ChannelError::JoinTimeout);
                    let callbacks: Vec<ErrorCallback> =
                        self.error_callbacks.read().unwrap().clone();
                    for callback in callbacks {
                        (*callback)(err.clone());
                    }
                }
                _ => {}
            }
        }
    }

    /// Deliver one message to every matching registration, in registration
    /// order. No-op unless the handle is currently `Joined`. A panicking
    /// callback is logged and skipped; delivery continues.
    pub(crate) fn deliver(&self, message: &Message) {
        if !self.is_joined() {
            return;
        }

        let bindings: Vec<Binding> = self.bindings.read().unwrap().clone();
        for binding in &bindings {
            match binding.filter.matches(message) {
                Ok(true) => {
                    let callback = Arc::clone(&binding.callback);
                    let msg = message.clone();
                    if catch_unwind(AssertUnwindSafe(move || (*callback)(msg))).is_err() {
                        error!(topic = %self.topic, "subscriber callback panicked");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "filter evaluation failed, frame dropped");
                }
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}
