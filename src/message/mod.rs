use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::protocol::ChangeRecord;

/// Database change kind carried by a server frame.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

/// Message represents one change notification delivered to a callback.
///
/// Immutable value: constructed once per inbound frame, cloned per matching
/// registered callback. `payload` keeps the key order the server sent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Change kind (INSERT, UPDATE, DELETE)
    pub event_type: EventType,

    /// Origin schema (e.g., "public")
    pub schema: String,

    /// Origin table
    pub table: String,

    /// Row data as the server framed it (ordered key -> value)
    pub payload: Map<String, Value>,

    /// Server-side commit time, when the server provided one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,

    /// Local receive time (set when the frame is routed)
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Build a Message from a decoded change record, stamping receive time.
    pub(crate) fn from_change(change: ChangeRecord) -> Self {
        Self {
            event_type: change.event_type,
            schema: change.schema,
            table: change.table,
            payload: change.payload,
            commit_timestamp: change.commit_timestamp,
            received_at: Utc::now(),
        }
    }
}
