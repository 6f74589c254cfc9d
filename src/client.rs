use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::channel::Channel;
use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionError, Core, SocketShared, SocketState};
use crate::transport::Transport;

/// Realtime subscription client.
///
/// Owns one logical connection to the server and a registry of topic
/// channels multiplexed over it. Explicitly constructed and passed by
/// reference; there is no process-wide instance. Dropping the client stops
/// its connection task and closes the transport.
///
/// `new` must be called from within a tokio runtime: the connection task is
/// spawned immediately (idle until `connect()` is requested). All public
/// methods are synchronous and non-blocking; outcomes arrive via callbacks.
pub struct RealtimeClient {
    shared: Arc<SocketShared>,
    channels: Arc<DashMap<String, Arc<Channel>>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl RealtimeClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(SocketShared::new());
        let channels: Arc<DashMap<String, Arc<Channel>>> = Arc::new(DashMap::new());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let core = Core::new(
            config,
            transport,
            Arc::clone(&channels),
            Arc::clone(&shared),
        );
        tokio::spawn(core.run(command_rx));

        Self {
            shared,
            channels,
            commands,
        }
    }

    /// Establish the connection asynchronously. A no-op when already
    /// connected; failures are reported via `on_error` observers and retried
    /// with backoff, never returned here.
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Tear the connection down. Cancels any pending reconnect attempt.
    /// Joined channels keep their registrations and resubscribe on the next
    /// `connect()`.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Register an observer invoked on every successful (re)connect.
    /// Multiple observers run in registration order.
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.on_open(callback);
    }

    /// Register an observer for manual disconnects.
    pub fn on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.on_close(callback);
    }

    /// Register an observer for transport-level errors. Errors are handled
    /// locally by the reconnect policy; observers see them for visibility.
    pub fn on_error(&self, callback: impl Fn(ConnectionError) + Send + Sync + 'static) {
        self.shared.on_error(callback);
    }

    /// Current socket state.
    pub fn socket_state(&self) -> SocketState {
        self.shared.state()
    }

    /// Get the channel handle for a topic.
    ///
    /// Idempotent per topic while the existing handle is live. A handle in a
    /// terminal state (closed, errored, timed out) is replaced by a fresh
    /// `Unjoined` one; terminal handles are never resurrected.
    pub fn channel(&self, topic: &str) -> Arc<Channel> {
        use dashmap::mapref::entry::Entry;

        match self.channels.entry(topic.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().state().is_terminal() {
                    debug!(topic = %topic, "replacing terminal channel handle");
                    let fresh = Channel::new(topic, self.commands.clone());
                    occupied.insert(Arc::clone(&fresh));
                    fresh
                } else {
                    Arc::clone(occupied.get())
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = Channel::new(topic, self.commands.clone());
                vacant.insert(Arc::clone(&fresh));
                fresh
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("connection task already stopped, command dropped");
        }
    }
}
