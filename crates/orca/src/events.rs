//! Outbound event broadcasting.
//!
//! Fire-and-forget fan-out to every connected dashboard/API client.
//! Consumers tolerate duplicates and out-of-order delivery; nothing here
//! waits for acknowledgment.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::cdp::Target;
use crate::sync::ConversationUpdate;
use crate::workspace::WorkspaceStatus;

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Events pushed to subscribed clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum WorkspaceEvent {
    /// A workspace moved through its lifecycle.
    #[serde(rename = "workspace:status", rename_all = "camelCase")]
    Status {
        workspace_id: String,
        status: WorkspaceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// One human-readable setup log line.
    #[serde(rename = "workspace:log", rename_all = "camelCase")]
    Log { workspace_id: String, line: String },

    /// The conversation inside a workspace changed.
    #[serde(rename = "conversation:update", rename_all = "camelCase")]
    Conversation {
        workspace_id: String,
        update: ConversationUpdate,
    },

    /// The workspace's debuggable target set changed.
    #[serde(rename = "targets:update", rename_all = "camelCase")]
    Targets {
        workspace_id: String,
        targets: Vec<Target>,
    },
}

impl WorkspaceEvent {
    /// The workspace this event belongs to.
    pub fn workspace_id(&self) -> &str {
        match self {
            WorkspaceEvent::Status { workspace_id, .. }
            | WorkspaceEvent::Log { workspace_id, .. }
            | WorkspaceEvent::Conversation { workspace_id, .. }
            | WorkspaceEvent::Targets { workspace_id, .. } => workspace_id,
        }
    }
}

/// Hub fanning workspace events out to WebSocket clients.
#[derive(Debug)]
pub struct EventHub {
    tx: broadcast::Sender<WorkspaceEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event. Nobody listening is fine.
    pub fn emit(&self, event: WorkspaceEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_event_wire_shape() {
        let event = WorkspaceEvent::Status {
            workspace_id: "w1".to_string(),
            status: WorkspaceStatus::Initializing,
            stage: Some("Waiting for IDE".to_string()),
            message: None,
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(
            wire,
            json!({
                "event": "workspace:status",
                "payload": {
                    "workspaceId": "w1",
                    "status": "initializing",
                    "stage": "Waiting for IDE",
                },
            })
        );
    }

    #[test]
    fn log_event_wire_shape() {
        let event = WorkspaceEvent::Log {
            workspace_id: "w1".to_string(),
            line: "Allocated port 41931".to_string(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["event"], "workspace:log");
        assert_eq!(wire["payload"]["workspaceId"], "w1");
        assert_eq!(wire["payload"]["line"], "Allocated port 41931");
    }

    #[tokio::test]
    async fn emit_reaches_subscribers() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.emit(WorkspaceEvent::Log {
            workspace_id: "w1".to_string(),
            line: "hello".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.workspace_id(), "w1");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let hub = EventHub::new();
        hub.emit(WorkspaceEvent::Log {
            workspace_id: "w1".to_string(),
            line: "nobody home".to_string(),
        });
        assert_eq!(hub.subscriber_count(), 0);
    }
}
