use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::message::EventType;

/// Client → Server frames.
///
/// Every frame carries a `ref` (UUIDv4 string) so a server can correlate
/// acknowledgments; the client itself correlates join/leave acks by topic
/// since it allows at most one of each in flight per topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        topic: String,
        #[serde(rename = "ref")]
        frame_ref: String,
    },
    Leave {
        topic: String,
        #[serde(rename = "ref")]
        frame_ref: String,
    },
    Heartbeat {
        #[serde(rename = "ref")]
        frame_ref: String,
    },
}

/// Server → Client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    JoinOk {
        topic: String,
        #[serde(rename = "ref", default)]
        frame_ref: String,
    },
    JoinError {
        topic: String,
        reason: String,
        #[serde(rename = "ref", default)]
        frame_ref: String,
    },
    LeaveOk {
        topic: String,
        #[serde(rename = "ref", default)]
        frame_ref: String,
    },
    HeartbeatOk {
        #[serde(rename = "ref", default)]
        frame_ref: String,
    },
    /// Post-join fault on a single channel; never affects siblings.
    ChannelError { topic: String, reason: String },
    Event { topic: String, change: ChangeRecord },
}

/// One database change as framed by the server.
///
/// `payload` is an ordered map: serde_json's preserve_order feature keeps
/// keys in the order the server serialized them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub event_type: EventType,
    pub schema: String,
    pub table: String,
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

/// New correlation id for an outbound frame.
pub fn next_ref() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_serializes_tagged() {
        let frame = ClientFrame::Join {
            topic: "public".to_string(),
            frame_ref: "abc".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["topic"], "public");
        assert_eq!(json["ref"], "abc");
    }

    #[test]
    fn test_event_frame_decodes() {
        let raw = json!({
            "type": "event",
            "topic": "public",
            "change": {
                "event_type": "INSERT",
                "schema": "public",
                "table": "messages",
                "payload": {"id": 1, "body": "hi"}
            }
        });
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        match frame {
            ServerFrame::Event { topic, change } => {
                assert_eq!(topic, "public");
                assert_eq!(change.event_type, EventType::Insert);
                assert_eq!(change.table, "messages");
                assert_eq!(change.payload["id"], 1);
                assert!(change.commit_timestamp.is_none());
            }
            other => panic!("expected event frame, got {:?}", other),
        }
    }

    #[test]
    fn test_join_error_without_ref_decodes() {
        let raw = json!({"type": "join_error", "topic": "public", "reason": "unauthorized"});
        let frame: ServerFrame = serde_json::from_value(raw).unwrap();
        assert_eq!(
            frame,
            ServerFrame::JoinError {
                topic: "public".to_string(),
                reason: "unauthorized".to_string(),
                frame_ref: String::new(),
            }
        );
    }

    #[test]
    fn test_payload_preserves_server_key_order() {
        let raw = r#"{"event_type":"UPDATE","schema":"public","table":"t","payload":{"z":1,"a":2,"m":3}}"#;
        let change: ChangeRecord = serde_json::from_str(raw).unwrap();
        let keys: Vec<&str> = change.payload.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_next_ref_is_unique() {
        assert_ne!(next_ref(), next_ref());
    }
}
