use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// A presence transition observed on a channel. The `uuid` is whatever
/// identifier the subscriber announced; the bus does not interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub action: PresenceAction,
    pub uuid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnected,
}

/// Everything a subscriber can observe on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(Bytes),
    Presence(PresenceChange),
    Status(ConnectionStatus),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("payload of {size} bytes exceeds the {limit} byte publish limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Pub/sub bus contract: at-most-once delivery, no ordering guarantee
/// across publishes, completion signalled by the async return.
#[async_trait]
pub trait Bus: Send + Sync {
    fn subscribe(&self, channel: &str, with_presence: bool) -> broadcast::Receiver<ChannelEvent>;
    fn unsubscribe(&self, channel: &str);
    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;
}

/// In-memory bus for tests and non-networked contexts. Presence and
/// status events are injected by the test harness via the helper methods.
#[derive(Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<ChannelEvent>>>,
    // One receiver per topic is parked here so publishes to channels
    // whose subscribers have all dropped do not error.
    guards: parking_lot::Mutex<Vec<broadcast::Receiver<ChannelEvent>>>,
    payload_limit: Option<usize>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that rejects publishes above `limit` bytes, the way a real
    /// size-limited transport would.
    pub fn with_payload_limit(limit: usize) -> Self {
        Self {
            payload_limit: Some(limit),
            ..Self::default()
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<ChannelEvent> {
        if let Some(sender) = self.topics.read().get(channel) {
            return sender.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(channel.to_string())
            .or_insert_with(|| {
                let (sender, guard) = broadcast::channel(64);
                self.guards.lock().push(guard);
                sender
            })
            .clone()
    }

    fn emit(&self, channel: &str, event: ChannelEvent) {
        let _ = self.sender_for(channel).send(event);
    }

    /// Simulate a peer joining the channel.
    pub fn announce_join(&self, channel: &str, uuid: impl Into<String>) {
        self.emit(
            channel,
            ChannelEvent::Presence(PresenceChange {
                action: PresenceAction::Join,
                uuid: uuid.into(),
            }),
        );
    }

    /// Simulate a peer leaving the channel.
    pub fn announce_leave(&self, channel: &str, uuid: impl Into<String>) {
        self.emit(
            channel,
            ChannelEvent::Presence(PresenceChange {
                action: PresenceAction::Leave,
                uuid: uuid.into(),
            }),
        );
    }

    /// Simulate a presence timeout for a peer.
    pub fn announce_timeout(&self, channel: &str, uuid: impl Into<String>) {
        self.emit(
            channel,
            ChannelEvent::Presence(PresenceChange {
                action: PresenceAction::Timeout,
                uuid: uuid.into(),
            }),
        );
    }

    /// Simulate a connectivity transition on the channel.
    pub fn announce_status(&self, channel: &str, status: ConnectionStatus) {
        self.emit(channel, ChannelEvent::Status(status));
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn subscribe(&self, channel: &str, _with_presence: bool) -> broadcast::Receiver<ChannelEvent> {
        self.sender_for(channel).subscribe()
    }

    fn unsubscribe(&self, _channel: &str) {
        // Subscriptions end when the receiver is dropped; the topic guard
        // keeps the channel publishable for late re-subscribers.
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        if let Some(limit) = self.payload_limit {
            if payload.len() > limit {
                return Err(BusError::PayloadTooLarge {
                    size: payload.len(),
                    limit,
                });
            }
        }
        self.sender_for(channel)
            .send(ChannelEvent::Message(payload))
            .map(|_| ())
            .map_err(|_| BusError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_message() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("session-abc123", false);
        bus.publish("session-abc123", Bytes::from_static(b"{\"type\":\"CODE\"}"))
            .await
            .expect("publish ok");
        let event = rx.recv().await.expect("event");
        assert_eq!(
            event,
            ChannelEvent::Message(Bytes::from_static(b"{\"type\":\"CODE\"}"))
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::new();
        bus.publish("lonely-channel", Bytes::from_static(b"x"))
            .await
            .expect("publish ok");
    }

    #[tokio::test]
    async fn presence_events_reach_subscribers() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("session-abc123", true);
        bus.announce_join("session-abc123", "device-1");
        let event = rx.recv().await.expect("event");
        assert_eq!(
            event,
            ChannelEvent::Presence(PresenceChange {
                action: PresenceAction::Join,
                uuid: "device-1".into(),
            })
        );
    }

    #[tokio::test]
    async fn oversize_payload_is_rejected() {
        let bus = LocalBus::with_payload_limit(8);
        let err = bus
            .publish("session-abc123", Bytes::from(vec![0u8; 9]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BusError::PayloadTooLarge { size: 9, limit: 8 }
        ));
    }
}
