//! Typed control-event fan-out for one workspace.

use serde_json::Value;
use tokio::sync::broadcast;

/// One control event pushed to transport subscribers, e.g.
/// `task:moved`, `queue:status`, `agent:execution_status`, `qa:request`.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    pub event: String,
    pub params: Value,
}

/// Broadcasts control events to all subscribers of a workspace.
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<ControlEvent>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Send a control event to all subscribers. No subscribers is fine.
    pub fn broadcast(&self, event: &str, params: Value) {
        let _ = self.tx.send(ControlEvent {
            event: event.to_string(),
            params,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let b = EventBroadcaster::new();
        let mut rx = b.subscribe();
        b.broadcast("task:updated", json!({"taskId": "DEMO-1"}));
        b.broadcast("queue:status", json!({"executing": 1}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event, "task:updated");
        assert_eq!(second.event, "queue:status");
    }
}
