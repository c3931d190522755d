//! Notification bus
//!
//! Fire-and-forget publication of content state changes for UI consumers.
//! The engine never reads from the bus.

use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Host content change published after a successful commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContentEvent {
    PostCreated { post_id: i64, topic_id: i64 },
    PostUpdated { post_id: i64 },
    PostDeleted { post_id: i64 },
    LikeAdded { post_id: i64, user_id: i64 },
    LikeRemoved { post_id: i64, user_id: i64 },
    FollowChanged { follower: String, followed: String, following: bool },
}

#[derive(Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<ContentEvent>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error.
    pub fn publish(&self, event: ContentEvent) {
        match self.sender.send(event) {
            Ok(receivers) => tracing::trace!(receivers, "Content event published"),
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(?event, "Content event dropped without subscribers")
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.sender.subscribe()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = NotificationBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(ContentEvent::PostDeleted { post_id: 7 });

        assert_eq!(
            receiver.recv().await.unwrap(),
            ContentEvent::PostDeleted { post_id: 7 }
        );
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = NotificationBus::with_capacity(1);
        bus.publish(ContentEvent::PostUpdated { post_id: 1 });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(ContentEvent::LikeAdded {
            post_id: 1,
            user_id: 2,
        })
        .unwrap();
        assert_eq!(json["event"], "like_added");
    }
}
