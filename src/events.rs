use tokio::sync::broadcast;

use crate::scanner::EventEmitter;

/// One rendered event: name plus pre-serialized JSON payload.
#[derive(Debug, Clone)]
pub struct EventMessage {
    pub event: String,
    pub data: String,
}

/// In-process fan-out for scan events. Per-subscriber lossy: a slow consumer
/// drops backlog instead of slowing the publisher down.
#[derive(Clone)]
pub struct EventBroker {
    tx: broadcast::Sender<EventMessage>,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: &str, data: String) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.tx.send(EventMessage { event: event.to_string(), data });
    }

    pub fn publish_json(&self, event: &str, payload: serde_json::Value) {
        self.publish(event, payload.to_string());
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventEmitter for EventBroker {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        self.publish_json(event, payload);
    }
}
