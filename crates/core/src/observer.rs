//! Publish/subscribe hub that notifies consumers of session changes.
//!
//! The session manager publishes while it holds its state lock, so a
//! subscriber never observes an event before the state it describes.

use crate::model::{CallStatus, Turn, TurnState};
use crate::protocol::SignalingMessage;
use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// An observable change in a call session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged {
        previous: CallStatus,
        current: CallStatus,
        session_id: Option<String>,
    },
    /// A turn left the pending state: completed, failed or abandoned.
    TurnClosed(Turn),
    /// The remote peer reported a non-fatal error.
    RemoteError {
        session_id: Option<String>,
        message: String,
    },
    /// An offer, answer or ICE candidate received from the peer.
    Negotiation {
        session_id: String,
        message: SignalingMessage,
    },
}

/// Selects which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    StatusChanges,
    /// Only turns that completed with a reply.
    CompletedTurns,
    Turns,
    Notices,
}

impl EventFilter {
    fn accepts(self, event: &SessionEvent) -> bool {
        match (self, event) {
            (EventFilter::All, _) => true,
            (EventFilter::StatusChanges, SessionEvent::StatusChanged { .. }) => true,
            (EventFilter::CompletedTurns, SessionEvent::TurnClosed(turn)) => {
                turn.state == TurnState::Completed
            }
            (EventFilter::Turns, SessionEvent::TurnClosed(_)) => true,
            (
                EventFilter::Notices,
                SessionEvent::RemoteError { .. } | SessionEvent::Negotiation { .. },
            ) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live subscription. Dropping it unsubscribes lazily.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<SessionEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Fans session events out to every interested subscriber.
#[derive(Default)]
pub struct SessionObserverHub {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SessionObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_filtered(EventFilter::All)
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    /// Removes a subscription. Its receiver yields `None` afterwards.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Delivers `event` to every matching subscriber without blocking.
    pub fn publish(&self, event: SessionEvent) {
        self.lock().retain(|subscriber| {
            if !subscriber.filter.accepts(&event) {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(event.clone()).is_ok()
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        // A panic while holding this lock cannot leave the list half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
