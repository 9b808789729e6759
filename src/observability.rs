//! Memory change events for external monitors.
//!
//! Publishing is fire-and-forget: the owning mutation never waits on a
//! subscriber and never fails because of one. Slow subscribers lose the
//! oldest events and see `RecvError::Lagged`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Kind of entity a memory event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A session.
    Session,
    /// A Turn.
    Turn,
    /// A plan.
    Plan,
    /// A Step.
    Step,
    /// An Action.
    Action,
    /// An evidence item.
    Evidence,
    /// A claim.
    Claim,
}

impl EntityType {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Session => "session",
            EntityType::Turn => "turn",
            EntityType::Plan => "plan",
            EntityType::Step => "step",
            EntityType::Action => "action",
            EntityType::Evidence => "evidence",
            EntityType::Claim => "claim",
        }
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entity added.
    Created,
    /// Entity changed in place.
    Updated,
    /// Claim replaced by a successor.
    Superseded,
    /// Claim retired.
    Retracted,
    /// Action or Turn finished.
    Completed,
    /// Turn rolled into the session summary.
    Archived,
}

impl ChangeKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Superseded => "superseded",
            ChangeKind::Retracted => "retracted",
            ChangeKind::Completed => "completed",
            ChangeKind::Archived => "archived",
        }
    }
}

/// One memory mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// Empty for session-level events.
    pub turn_id: String,
    /// Kind of entity changed.
    pub entity_type: EntityType,
    /// Entity identifier.
    pub entity_id: String,
    /// What happened.
    pub change_kind: ChangeKind,
}

impl MemoryEvent {
    /// Create an event stamped with the current time
    pub fn new(
        turn_id: impl Into<String>,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        change_kind: ChangeKind,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            turn_id: turn_id.into(),
            entity_type,
            entity_id: entity_id.into(),
            change_kind,
        }
    }
}

/// Broadcast channel for memory events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MemoryEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; the event is dropped when nobody listens.
    pub fn publish(&self, event: MemoryEvent) {
        if self.tx.send(event).is_err() {
            debug!("No memory event subscribers, event dropped");
        }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Log every event until the bus is closed.
pub async fn log_events(mut rx: broadcast::Receiver<MemoryEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => info!(
                turn_id = %event.turn_id,
                entity_type = event.entity_type.as_str(),
                entity_id = %event.entity_id,
                change_kind = event.change_kind.as_str(),
                "memory event"
            ),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Memory event monitor lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> MemoryEvent {
        MemoryEvent::new("turn-1", EntityType::Claim, id, ChangeKind::Created)
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(event("c1"));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(event("c1"));
        bus.publish(event("c2"));

        assert_eq!(rx.recv().await.unwrap().entity_id, "c1");
        assert_eq!(rx.recv().await.unwrap().entity_id, "c2");
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(&format!("c{}", i)));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert_eq!(missed, 3),
            other => panic!("expected lag, got {:?}", other),
        }
        assert_eq!(rx.recv().await.unwrap().entity_id, "c3");
    }

    #[test]
    fn test_event_serialization() {
        let value = serde_json::to_value(event("c9")).unwrap();
        assert_eq!(value["entity_type"], "claim");
        assert_eq!(value["change_kind"], "created");
        assert_eq!(value["turn_id"], "turn-1");
    }
}
