use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

use crate::channel::Channel;
use crate::message::Message;
use crate::protocol::ChangeRecord;

/// Demultiplexes inbound change frames onto channels.
///
/// Topic lookup is O(1) in the registry; the filter walk is bounded by the
/// registrations on the matched channel, never by the total channel count.
/// Frames for topics with no live channel are dropped silently.
pub(crate) struct Router {
    channels: Arc<DashMap<String, Arc<Channel>>>,
}

impl Router {
    pub(crate) fn new(channels: Arc<DashMap<String, Arc<Channel>>>) -> Self {
        Self { channels }
    }

    pub(crate) fn dispatch(&self, topic: &str, change: ChangeRecord) {
        let Some(chan) = self.channels.get(topic).map(|entry| Arc::clone(entry.value()))
        else {
            trace!(topic = %topic, "no channel for inbound frame, dropping");
            return;
        };

        // One Message per frame; Channel::deliver clones it per matching
        // callback and invokes them synchronously, preserving arrival order.
        let message = Message::from_change(change);
        chan.deliver(&message);
    }
}
