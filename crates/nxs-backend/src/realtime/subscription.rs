use super::protocol::ChangeEvent;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};

/// Delivery state of a subscription.
///
/// Events emitted while `Reconnecting` are lost; a transition back to
/// `Joined` is the caller's cue to refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Joining,
    Joined,
    Reconnecting,
    Closed,
}

type OnDrop = Box<dyn FnOnce() + Send + Sync>;

/// Runs the unsubscribe action when dropped.
struct Unsubscribe(Option<OnDrop>);

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// A live stream of change events. Dropping it unsubscribes.
pub struct ChangeStream {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    status: watch::Receiver<SubscriptionStatus>,
    guard: Unsubscribe,
}

impl fmt::Debug for ChangeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeStream")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ChangeStream {
    pub fn new<F>(
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        status: watch::Receiver<SubscriptionStatus>,
        on_drop: F,
    ) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            events,
            status,
            guard: Unsubscribe(Some(Box::new(on_drop))),
        }
    }

    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    pub fn status(&self) -> SubscriptionStatus {
        *self.status.borrow()
    }

    /// Receiver for status transitions.
    pub fn status_watch(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Split into the raw receivers, keeping the unsubscribe guard alive in
    /// the returned handle.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<ChangeEvent>,
        watch::Receiver<SubscriptionStatus>,
        SubscriptionGuard,
    ) {
        (
            self.events,
            self.status,
            SubscriptionGuard(self.guard),
        )
    }
}

/// Keeps a subscription open until dropped.
pub struct SubscriptionGuard(Unsubscribe);

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SubscriptionGuard")
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::protocol::ChangeKind;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drop_runs_unsubscribe() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel(SubscriptionStatus::Joined);
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let mut stream = ChangeStream::new(rx, status_rx, move || flag.store(true, Ordering::SeqCst));

        tx.send(ChangeEvent::new(ChangeKind::Insert, "messages", None, None))
            .unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(stream.status(), SubscriptionStatus::Joined);

        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_into_parts_defers_unsubscribe() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel(SubscriptionStatus::Joined);
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();
        let stream = ChangeStream::new(rx, status_rx, move || flag.store(true, Ordering::SeqCst));

        let (_events, _status, guard) = stream.into_parts();
        assert!(!dropped.load(Ordering::SeqCst));
        drop(guard);
        assert!(dropped.load(Ordering::SeqCst));
    }
}
