//! In-process notification bus for form-level events.
//!
//! Collaborators outside a form session (toolbars, list views, routers)
//! subscribe here instead of holding a reference into the session. Topics
//! are hierarchical strings; subscribers filter with exact matches or
//! `prefix.*` wildcards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One notification: which form, what happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormEvent {
    /// Unique event identifier (ULID).
    pub id: String,
    /// Topic for routing (e.g. "form.refresh", "model.ToDo").
    pub topic: String,
    pub doctype: String,
    pub docname: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FormEvent {
    pub fn new(
        topic: impl Into<String>,
        doctype: impl Into<String>,
        docname: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            topic: topic.into(),
            doctype: doctype.into(),
            docname: docname.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Check if this event matches a topic pattern.
    /// Supports wildcards: "form.*" matches "form.refresh", "form.rename".
    pub fn matches_topic(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix(".*") {
            self.topic.starts_with(prefix)
                && (self.topic.len() == prefix.len()
                    || self.topic[prefix.len()..].starts_with('.'))
        } else {
            self.topic == pattern
        }
    }
}

/// Broadcast bus; cheap to clone, subscribers receive every event and
/// filter by topic themselves.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FormEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FormEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. An event with no listeners is
    /// dropped, not an error.
    pub fn publish(&self, event: FormEvent) {
        tracing::debug!(topic = %event.topic, doctype = %event.doctype, docname = %event.docname, "publishing form event");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(topic: &str) -> FormEvent {
        FormEvent::new(topic, "ToDo", "TD-0001", json!({}))
    }

    #[test]
    fn test_matches_topic_exact() {
        let e = event("form.refresh");
        assert!(e.matches_topic("form.refresh"));
        assert!(!e.matches_topic("form"));
        assert!(!e.matches_topic("form.refresh.extra"));
    }

    #[test]
    fn test_matches_topic_wildcard() {
        let e = event("form.refresh");
        assert!(e.matches_topic("form.*"));
        assert!(e.matches_topic("*"));
        assert!(!e.matches_topic("model.*"));
        // prefix must end on a segment boundary
        assert!(!event("formx.refresh").matches_topic("form.*"));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(event("form.refresh"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, "form.refresh");
        assert_eq!(got.docname, "TD-0001");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(event("form.dirty"));
    }
}
