//! Lifecycle event definitions and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    /// Instance created (by any creation pathway).
    InstanceCreated {
        name: String,
        pool: String,
        timestamp: i64,
    },
    /// Instance and its snapshots deleted.
    InstanceDeleted { name: String, timestamp: i64 },
    /// Instance renamed.
    InstanceRenamed {
        old: String,
        new: String,
        timestamp: i64,
    },
    /// Instance rolled back to a snapshot.
    InstanceRestored {
        name: String,
        snapshot: String,
        timestamp: i64,
    },
    /// Snapshot created.
    SnapshotCreated {
        name: String,
        stateful: bool,
        timestamp: i64,
    },
    /// Snapshot deleted.
    SnapshotDeleted { name: String, timestamp: i64 },
    /// Snapshot renamed.
    SnapshotRenamed {
        old: String,
        new: String,
        timestamp: i64,
    },
    /// Instance streamed to a migration peer.
    InstanceSent {
        name: String,
        live: bool,
        timestamp: i64,
    },
    /// Custom volume created or copied.
    VolumeCreated {
        pool: String,
        name: String,
        timestamp: i64,
    },
    /// Custom volume deleted.
    VolumeDeleted {
        pool: String,
        name: String,
        timestamp: i64,
    },
    /// Custom volume renamed.
    VolumeRenamed {
        pool: String,
        old: String,
        new: String,
        timestamp: i64,
    },
    /// Storage pool created.
    PoolCreated { name: String, timestamp: i64 },
    /// Storage pool configuration changed.
    PoolUpdated { name: String, timestamp: i64 },
    /// Storage pool deleted.
    PoolDeleted { name: String, timestamp: i64 },
}

/// Current time as a unix timestamp, for event payloads.
#[must_use]
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Event bus for lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: LifecycleEvent) {
        tracing::trace!(?event, "Publishing lifecycle event");
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(LifecycleEvent::PoolCreated {
            name: "default".to_string(),
            timestamp: 1,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            LifecycleEvent::PoolCreated {
                name: "default".to_string(),
                timestamp: 1,
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(LifecycleEvent::InstanceDeleted {
            name: "c1".to_string(),
            timestamp: now(),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(LifecycleEvent::InstanceRenamed {
            old: "c1".to_string(),
            new: "c2".to_string(),
            timestamp: 0,
        })
        .unwrap();
        assert_eq!(json["type"], "instance-renamed");
        assert_eq!(json["new"], "c2");
    }

    #[test]
    fn snapshot_event_wire_format() {
        let json = serde_json::to_string(&LifecycleEvent::SnapshotCreated {
            name: "c1/s0".to_string(),
            stateful: true,
            timestamp: 42,
        })
        .unwrap();
        insta::assert_snapshot!(
            json,
            @r#"{"type":"snapshot-created","name":"c1/s0","stateful":true,"timestamp":42}"#
        );
    }
}
