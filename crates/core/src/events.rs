//! Process-wide publish/subscribe channel for node events.
//!
//! Publishing never blocks: every subscriber owns a bounded buffer and a slow
//! subscriber that falls behind is told how many events it missed instead of
//! holding up the publisher.

use tokio::sync::broadcast;

use crate::peer::PeerId;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// The last connection to the peer dropped.
    PeerDisconnected(PeerId),
    /// A reconnection attempt for a keep-alive peer succeeded.
    PeerReconnected(PeerId),
    /// Reconnection to the peer was given up after the configured attempts.
    ReconnectFailed(PeerId),
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscriber lagged behind, {0} events dropped")]
    Lagged(u64),
    #[error("event bus closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NodeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus where each subscriber buffers up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Delivers `event` to every live subscription, returning how many there were.
    pub fn publish(&self, event: NodeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Starts receiving every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Handle on an active subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<NodeEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<NodeEvent, SubscriptionError> {
        self.receiver.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Lagged(n) => SubscriptionError::Lagged(n),
            broadcast::error::RecvError::Closed => SubscriptionError::Closed,
        })
    }

    pub fn unsubscribe(self) {}
}
