// Subscription handle state machine
pub mod channel;

// Public client entry point
pub mod client;

// Client configuration
pub mod config;

// Connection manager (socket lifecycle, heartbeat, reconnect, rejoin)
pub mod connection;

// Client-side event filtering
pub mod filter;

// Delivered change notifications
pub mod message;

// Wire frames
pub mod protocol;

// Inbound frame dispatch
mod router;

// Pluggable framed transports
pub mod transport;

pub use channel::{Channel, ChannelError, ChannelState};
pub use client::RealtimeClient;
pub use config::ClientConfig;
pub use connection::{ConnectionError, SocketState};
pub use filter::{EventFilter, Filter};
pub use message::{EventType, Message};
