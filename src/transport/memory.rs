//! In-process transport.
//!
//! Every `connect` call emits a fresh [`ServerSession`] on the session stream,
//! so a test (or an embedded server) can script acknowledgments, change
//! events, and connection drops, including full reconnect sequences, where
//! each reconnect shows up as the next session.

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::protocol::{ClientFrame, ServerFrame};

use super::{Transport, TransportPair, FRAME_BUFFER};

/// Server-side half of one in-memory connection.
pub struct ServerSession {
    /// Frames the client sent (join/leave/heartbeat)
    pub incoming: mpsc::Receiver<ClientFrame>,
    /// Frames to deliver to the client; dropping this closes the connection
    pub outgoing: mpsc::Sender<ServerFrame>,
}

impl ServerSession {
    /// Convenience for scripted servers: send one frame, panicking if the
    /// client side is gone (a test bug, not a runtime condition).
    pub async fn send(&self, frame: ServerFrame) {
        self.outgoing
            .send(frame)
            .await
            .expect("client side of memory transport is gone");
    }
}

/// Transport whose connections are in-process channel pairs.
pub struct MemoryTransport {
    sessions: mpsc::UnboundedSender<ServerSession>,
}

impl MemoryTransport {
    /// Returns the transport plus the stream of server sessions, one per
    /// successful `connect`. Dropping the receiver makes subsequent connect
    /// attempts fail, which is how tests exercise the retry path.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerSession>) {
        let (sessions, session_rx) = mpsc::unbounded_channel();
        (Self { sessions }, session_rx)
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, _url: &str) -> BoxFuture<'static, anyhow::Result<TransportPair>> {
        let sessions = self.sessions.clone();
        Box::pin(async move {
            let (outbound_tx, incoming) = mpsc::channel::<ClientFrame>(FRAME_BUFFER);
            let (outgoing, inbound_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);

            sessions
                .send(ServerSession { incoming, outgoing })
                .map_err(|_| anyhow!("memory transport has no listener"))?;

            Ok(TransportPair {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}
