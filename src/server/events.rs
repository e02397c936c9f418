//! Server lifecycle event bus
//!
//! Connection lifecycle transitions are published on a broadcast channel so
//! in-process listeners (metrics, supervisors, tests) can observe them
//! without reaching into the connection registry. Delivery is at-least-once
//! to currently-subscribed receivers; there is no replay.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    AgentConnected {
        agent_id: String,
        address: String,
        token_id: String,
    },
    AgentDisconnected {
        agent_id: String,
        address: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentConnected { .. } => "agent.connected",
            Self::AgentDisconnected { .. } => "agent.disconnected",
        }
    }
}

/// Cheap-to-clone handle around the broadcast sender.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send with no live subscribers is not an error.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(ServerEvent::AgentConnected {
            agent_id: "agent-1".to_string(),
            address: "0xabc".to_string(),
            token_id: "1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "agent.connected");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(ServerEvent::AgentDisconnected {
            agent_id: "agent-1".to_string(),
            address: "0xabc".to_string(),
        });
    }
}
