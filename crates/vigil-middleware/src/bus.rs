//! Headless, named-topic publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.  Channels are created lazily the first time a topic is
//! published to or subscribed to.
//!
//! # Default topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`topics::JOINT_STATES`] | Joint-position feed |
//! | [`topics::ATTACHED_COLLISION_OBJECT`] | Attach/detach edits |
//! | [`topics::COLLISION_OBJECT`] | Collision object add/remove/move |
//! | [`topics::PLANNING_SCENE_WORLD`] | Whole-world replacements |
//! | [`topics::PLANNING_SCENE`] | Externally published scenes and diffs |
//! | [`topics::MONITORED_PLANNING_SCENE`] | Scenes republished by the monitor |

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;
use vigil_types::{Event, VigilError};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Well-known topic names.
pub mod topics {
    pub const JOINT_STATES: &str = "joint_states";
    pub const ATTACHED_COLLISION_OBJECT: &str = "attached_collision_object";
    pub const COLLISION_OBJECT: &str = "collision_object";
    pub const PLANNING_SCENE_WORLD: &str = "planning_scene_world";
    pub const PLANNING_SCENE: &str = "planning_scene";
    pub const MONITORED_PLANNING_SCENE: &str = "monitored_planning_scene";
    pub const GET_PLANNING_SCENE: &str = "get_planning_scene";
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Event>>>>,
}

impl EventBus {
    /// Create a new bus with the given per-topic channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`VigilError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: &str, event: Event) -> Result<usize, VigilError> {
        self.sender(topic)
            .send(event)
            .map_err(|_| VigilError::Channel(format!("no subscribers for topic '{topic}'")))
    }

    /// Subscribe to `topic`.
    pub fn subscribe_to(&self, topic: &str) -> TopicReceiver {
        TopicReceiver {
            topic: topic.to_string(),
            receiver: self.sender(topic).subscribe(),
        }
    }

    /// Number of live receivers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .lock()
            .get(topic)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        self.channels
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Topic receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single topic.
///
/// Obtained via [`EventBus::subscribe_to`].  Dropping it releases the
/// subscription.
pub struct TopicReceiver {
    topic: String,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Lagging is logged and skipped; `None` means the bus has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "topic receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The topic this receiver is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use vigil_types::{EventPayload, JointStateMsg};

    fn make_event(source: &str) -> Event {
        Event::new(
            source,
            EventPayload::JointState(JointStateMsg::from_positions(Utc::now(), [("elbow", 1.0)])),
        )
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(topics::JOINT_STATES);

        let event = make_event("driver");
        bus.publish_to(topics::JOINT_STATES, event.clone())?;

        let received = rx.recv().await.ok_or("no event received")?;
        assert_eq!(received.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe_to(topics::PLANNING_SCENE);
        let mut rx2 = bus.subscribe_to(topics::PLANNING_SCENE);

        let event = make_event("planner");
        bus.publish_to(topics::PLANNING_SCENE, event.clone())?;

        assert_eq!(rx1.recv().await.ok_or("rx1")?.id, event.id);
        assert_eq!(rx2.recv().await.ok_or("rx2")?.id, event.id);
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_returns_error() {
        let bus = EventBus::default();
        let result = bus.publish_to(topics::COLLISION_OBJECT, make_event("test"));
        assert!(matches!(result, Err(VigilError::Channel(_))));
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut world_rx = bus.subscribe_to(topics::PLANNING_SCENE_WORLD);
        let _joint_rx = bus.subscribe_to(topics::JOINT_STATES);

        bus.publish_to(topics::JOINT_STATES, make_event("driver"))?;

        let result = tokio::time::timeout(Duration::from_millis(50), world_rx.recv()).await;
        assert!(result.is_err(), "world subscriber must not see joint states");
        Ok(())
    }

    #[test]
    fn dropping_receiver_releases_subscription() {
        let bus = EventBus::default();
        let rx = bus.subscribe_to(topics::JOINT_STATES);
        assert_eq!(bus.subscriber_count(topics::JOINT_STATES), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(topics::JOINT_STATES), 0);
    }
}
