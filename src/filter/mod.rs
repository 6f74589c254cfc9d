use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::message::{EventType, Message};

/// Event-type selector for a registration. `All` matches every change kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventFilter {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl EventFilter {
    fn accepts(&self, event_type: EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Insert => event_type == EventType::Insert,
            EventFilter::Update => event_type == EventType::Update,
            EventFilter::Delete => event_type == EventType::Delete,
        }
    }
}

/// Column equality condition evaluated against the change payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub column: String,
    pub value: Value,
}

/// Filter evaluation errors. A failing filter drops the frame for that
/// registration only; routing continues.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    EmptyColumn,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::EmptyColumn => {
                write!(f, "filter condition has an empty column name")
            }
        }
    }
}

impl std::error::Error for FilterError {}

/// Predicate narrowing which changes on a channel trigger a callback.
///
/// Built once at registration time and never mutated afterwards:
///
/// ```
/// use ripple::filter::{EventFilter, Filter};
///
/// let filter = Filter::event(EventFilter::Insert)
///     .schema("public")
///     .table("messages");
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub event: EventFilter,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub conditions: Vec<Condition>,
}

impl Filter {
    /// Start a filter matching the given event kind.
    pub fn event(event: EventFilter) -> Self {
        Self {
            event,
            schema: None,
            table: None,
            conditions: Vec::new(),
        }
    }

    /// Restrict to a schema (exact match).
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Restrict to a table (exact match).
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Require a payload column to equal a value.
    pub fn eq(mut self, column: impl Into<String>, value: Value) -> Self {
        self.conditions.push(Condition {
            column: column.into(),
            value,
        });
        self
    }

    /// Evaluate this filter against a delivered message's metadata.
    ///
    /// A column named in a condition but absent from the payload is a
    /// non-match, not an error.
    pub fn matches(&self, message: &Message) -> Result<bool, FilterError> {
        if !self.event.accepts(message.event_type) {
            return Ok(false);
        }
        if let Some(schema) = &self.schema {
            if schema != &message.schema {
                return Ok(false);
            }
        }
        if let Some(table) = &self.table {
            if table != &message.table {
                return Ok(false);
            }
        }
        for condition in &self.conditions {
            if condition.column.is_empty() {
                return Err(FilterError::EmptyColumn);
            }
            match message.payload.get(&condition.column) {
                Some(value) if *value == condition.value => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(event_type: EventType, schema: &str, table: &str) -> Message {
        let payload = match json!({"id": 7, "status": "open"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        Message {
            event_type,
            schema: schema.to_string(),
            table: table.to_string(),
            payload,
            commit_timestamp: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_and_schema_must_both_match() {
        let filter = Filter::event(EventFilter::Insert).schema("public");

        assert!(filter
            .matches(&message(EventType::Insert, "public", "messages"))
            .unwrap());
        assert!(!filter
            .matches(&message(EventType::Update, "public", "messages"))
            .unwrap());
        assert!(!filter
            .matches(&message(EventType::Insert, "other", "messages"))
            .unwrap());
    }

    #[test]
    fn test_wildcard_event_matches_all_kinds() {
        let filter = Filter::event(EventFilter::All);
        for event_type in [EventType::Insert, EventType::Update, EventType::Delete] {
            assert!(filter.matches(&message(event_type, "public", "t")).unwrap());
        }
    }

    #[test]
    fn test_table_restriction() {
        let filter = Filter::event(EventFilter::All).table("messages");
        assert!(filter
            .matches(&message(EventType::Delete, "public", "messages"))
            .unwrap());
        assert!(!filter
            .matches(&message(EventType::Delete, "public", "users"))
            .unwrap());
    }

    #[test]
    fn test_eq_condition_on_payload() {
        let matching = Filter::event(EventFilter::All).eq("id", json!(7));
        let missing = Filter::event(EventFilter::All).eq("absent", json!(1));
        let wrong = Filter::event(EventFilter::All).eq("id", json!(8));

        let msg = message(EventType::Insert, "public", "t");
        assert!(matching.matches(&msg).unwrap());
        assert!(!missing.matches(&msg).unwrap());
        assert!(!wrong.matches(&msg).unwrap());
    }

    #[test]
    fn test_empty_column_is_an_error() {
        let filter = Filter::event(EventFilter::All).eq("", json!(1));
        let msg = message(EventType::Insert, "public", "t");
        assert_eq!(filter.matches(&msg), Err(FilterError::EmptyColumn));
    }
}
