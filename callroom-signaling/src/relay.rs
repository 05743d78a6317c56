//! Relay channel contract
//!
//! The relay is an ordered, at-most-once pub/sub channel keyed by participant.
//! It is consumed through [`RelayClient`]; inbound traffic is read from a
//! [`RelaySubscription`] that unsubscribes when dropped.

use crate::protocol::{RelayEvent, RelayMessage};
use async_trait::async_trait;
use callroom_core::CallError;
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Client side of the relay channel
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Send one message; fails with [`CallError::RelaySendFailed`]
    async fn send(&self, message: RelayMessage) -> Result<(), CallError>;

    /// Open a subscription to inbound events
    fn subscribe(&self) -> RelaySubscription;
}

/// Scoped registration for inbound relay events
pub struct RelaySubscription {
    receiver: mpsc::UnboundedReceiver<RelayEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl RelaySubscription {
    /// Wrap a receiver; `on_drop` runs exactly once when the subscription ends
    pub fn new<F>(receiver: mpsc::UnboundedReceiver<RelayEvent>, on_drop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            receiver,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Wait for the next event; `None` once the relay side is gone
    pub async fn next(&mut self) -> Option<RelayEvent> {
        self.receiver.recv().await
    }

    /// Take an already queued event without waiting
    pub fn try_next(&mut self) -> Option<RelayEvent> {
        self.receiver.try_recv().ok()
    }

    /// End the subscription now
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.receiver.close();
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("active", &self.on_drop.is_some())
            .finish()
    }
}

impl Stream for RelaySubscription {
    type Item = RelayEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<RelayEvent>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_subscription_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&released);
        let mut subscription = RelaySubscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(RelayEvent::ParticipantLeft {
            participant_id: "p2".into(),
        })
        .unwrap();
        assert!(subscription.next().await.is_some());
        assert!(subscription.try_next().is_none());

        subscription.unsubscribe();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(tx.is_closed());
    }

    #[test]
    fn test_subscription_drop_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&released);
        drop(RelaySubscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = RelaySubscription::new(rx, || {});
        for id in ["p2", "p3"] {
            assert_ok!(tx.send(RelayEvent::ParticipantLeft {
                participant_id: id.into(),
            }));
        }
        drop(tx);

        let names: Vec<&str> = subscription.map(|event| event.event_name()).collect().await;
        assert_eq!(names, vec!["participant:left", "participant:left"]);
    }
}
