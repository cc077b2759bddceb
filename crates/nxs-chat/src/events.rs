//! Notifications for front ends.

use crate::models::MessageWithSender;
use nxs_backend::SubscriptionStatus;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A snapshot replaced the timeline of a chat.
    TimelineLoaded { chat_id: String, len: usize },
    MessageAdded {
        chat_id: String,
        message: MessageWithSender,
    },
    MessageUpdated {
        chat_id: String,
        message: MessageWithSender,
    },
    MessageRemoved { chat_id: String, message_id: String },
    /// The conversation list changed order or content.
    ConversationsChanged,
    /// Local state can no longer be patched; fetch again.
    RefetchNeeded { chat_id: Option<String> },
    ConnectionChanged { status: SubscriptionStatus },
    StatusFeedChanged,
}

/// Fan-out of [`ChatEvent`]s to any number of listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
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

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ChatEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("[Events] no listeners");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_listeners() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(ChatEvent::ConversationsChanged);
        assert_eq!(a.recv().await.unwrap(), ChatEvent::ConversationsChanged);
        assert_eq!(b.recv().await.unwrap(), ChatEvent::ConversationsChanged);
    }

    #[test]
    fn test_emit_without_listeners_is_fine() {
        EventBus::new(4).emit(ChatEvent::StatusFeedChanged);
    }
}
