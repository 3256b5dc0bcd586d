use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type of a simulation event.
///
/// The string forms are stable identifiers used in scenario files and in the
/// JSON snapshots published to listeners.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A request has arrived at a component.
    RequestArrival,
    /// A component has finished processing a request.
    RequestProcessed,
    /// A request has completed end to end.
    RequestCompleted,
    /// A request has failed; the payload carries a `reason`.
    RequestFailed,
    /// A component has started.
    ComponentStarted,
    /// A component has stopped.
    ComponentStopped,
    /// A component has failed.
    ComponentFailed,
    /// Network latency injection.
    NetworkLatency,
    /// Network partition began.
    NetworkPartition,
    /// Network partition healed.
    NetworkRestore,
    /// Database read operation.
    DatabaseRead,
    /// Database write operation.
    DatabaseWrite,
    /// Database complex query operation.
    DatabaseQuery,
    /// A message was submitted to a message queue.
    MessageEnqueued,
    /// A message was taken off a message queue.
    MessageDequeued,
    /// A message queue reached capacity.
    QueueFull,
    /// A fault was injected into a component.
    FaultInjected,
    /// A previously injected fault was cleared.
    FaultRecovered,
}

/// A discrete event scheduled on the virtual clock.
///
/// Events are immutable once enqueued: the engine and the components only
/// ever read them, and reactions are expressed as freshly constructed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Identifier unique within a simulation run, supplied by the caller.
    pub id: String,
    /// Virtual time at which the event fires.
    pub timestamp: f64,
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Identifier of the component that handles this event.
    pub component_id: String,
    /// Opaque payload carried through the system.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Tie-breaker at equal timestamps; lower values fire first.
    #[serde(default)]
    pub priority: i32,
    /// Wall-clock creation time, for diagnostics only.
    #[serde(default = "SystemTime::now", skip_serializing)]
    pub created_at: SystemTime,
}

impl Event {
    /// Constructs an event with default priority and an empty payload.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        timestamp: f64,
        kind: EventKind,
        component_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            kind,
            component_id: component_id.into(),
            data: Map::new(),
            priority: 0,
            created_at: SystemTime::now(),
        }
    }

    /// Sets the tie-break priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Inserts a payload entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Returns a payload value, or `None` if the key is absent.
    #[must_use]
    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Returns a payload value as a string slice, if it is one.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Serializes the event to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload contains values that cannot be
    /// represented in JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserializes an event from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid event document.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        // `created_at` is a wall-clock diagnostic and not part of identity.
        self.id == other.id
            && self.timestamp == other.timestamp
            && self.kind == other.kind
            && self.component_id == other.component_id
            && self.data == other.data
            && self.priority == other.priority
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_string_forms() {
        use std::str::FromStr;
        assert_eq!(EventKind::RequestArrival.to_string(), "request_arrival");
        assert_eq!(EventKind::MessageEnqueued.to_string(), "message_enqueued");
        assert_eq!(
            EventKind::from_str("database_query").unwrap(),
            EventKind::DatabaseQuery
        );
        assert!(EventKind::from_str("no_such_kind").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let event = Event::new("e1", 2.5, EventKind::RequestArrival, "svc")
            .with_priority(3)
            .with_data("request_id", "r1")
            .with_data("size", 7);
        let parsed = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_clone_produces_independent_payload() {
        let event = Event::new("e1", 1.0, EventKind::DatabaseWrite, "db").with_data("key", "a");
        let mut clone = event.clone();
        clone.data.insert("key".into(), Value::from("b"));
        assert_eq!(event.data_str("key"), Some("a"));
        assert_eq!(clone.data_str("key"), Some("b"));
    }

    #[test]
    fn test_serialized_tag_is_snake_case() {
        let event = Event::new("e1", 0.0, EventKind::QueueFull, "mq");
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""type":"queue_full""#));
    }
}
