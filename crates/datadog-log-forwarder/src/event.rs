use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Partition key routing an event to its batch. `None` is the device's
/// default group.
pub type GroupKey = Option<String>;

/// A single log record accepted from the producer.
///
/// The record is opaque to the forwarder; transports decide how to encode
/// it on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LogEvent {
    record: Value,
}

impl LogEvent {
    pub fn new(record: Value) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &Value {
        &self.record
    }
}

impl From<Value> for LogEvent {
    fn from(record: Value) -> Self {
        Self::new(record)
    }
}

/// One flush's worth of events for one group.
///
/// A batch is consumed exactly once by a flush attempt; on failure its
/// events either re-enter the buffer or are dropped, per policy.
#[derive(Debug, Clone)]
pub struct Batch {
    group: GroupKey,
    events: Vec<LogEvent>,
    created_at: Instant,
    first_pending_at: Instant,
}

impl Batch {
    pub(crate) fn new(group: GroupKey, events: Vec<LogEvent>, first_pending_at: Instant) -> Self {
        Self {
            group,
            events,
            created_at: Instant::now(),
            first_pending_at,
        }
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<LogEvent> {
        self.events
    }

    /// How long the oldest member had been buffered when the batch was cut.
    pub fn buffered_for(&self) -> Duration {
        self.created_at.saturating_duration_since(self.first_pending_at)
    }

    pub(crate) fn first_pending_at(&self) -> Instant {
        self.first_pending_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_as_record() {
        let event = LogEvent::new(json!({"message": "hello", "level": "info"}));
        let encoded = serde_json::to_string(&event).unwrap();
        assert_eq!(encoded, r#"{"level":"info","message":"hello"}"#);
    }

    #[test]
    fn test_batch_metadata() {
        let first_seen = Instant::now();
        let batch = Batch::new(
            Some("web".to_string()),
            vec![LogEvent::new(json!("a")), LogEvent::new(json!("b"))],
            first_seen,
        );
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_empty());
        assert_eq!(batch.group().as_deref(), Some("web"));
    }
}
