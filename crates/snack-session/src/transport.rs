use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use snack_bus::{Bus, ChannelEvent};
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::{DeviceMessage, HostMessage};

/// Thin session-side wrapper over the pub/sub bus: idempotent
/// subscribe/unsubscribe, JSON envelopes on publish, and typed decode of
/// device traffic on receive.
pub struct SessionTransport {
    bus: Arc<dyn Bus>,
    subscribed: parking_lot::Mutex<HashSet<String>>,
}

impl SessionTransport {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            subscribed: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Subscribe to `channel`; returns `None` when already subscribed so
    /// repeated calls are no-ops.
    pub fn subscribe(
        &self,
        channel: &str,
        with_presence: bool,
    ) -> Option<broadcast::Receiver<ChannelEvent>> {
        let mut subscribed = self.subscribed.lock();
        if !subscribed.insert(channel.to_string()) {
            return None;
        }
        debug!(channel, with_presence, "subscribing");
        Some(self.bus.subscribe(channel, with_presence))
    }

    /// Drop the subscription bookkeeping and re-subscribe, handing back a
    /// fresh event stream. Used when the network reports reconnection.
    pub fn resubscribe(
        &self,
        channel: &str,
        with_presence: bool,
    ) -> broadcast::Receiver<ChannelEvent> {
        self.subscribed.lock().remove(channel);
        self.subscribe(channel, with_presence)
            .expect("subscription was just cleared")
    }

    pub fn unsubscribe(&self, channel: &str) {
        if self.subscribed.lock().remove(channel) {
            debug!(channel, "unsubscribing");
            self.bus.unsubscribe(channel);
        }
    }

    pub async fn publish(&self, channel: &str, message: &HostMessage) -> Result<()> {
        let payload = serde_json::to_vec(message).context("encoding host message")?;
        self.bus
            .publish(channel, Bytes::from(payload))
            .await
            .context("publishing host message")?;
        Ok(())
    }

    /// Decode an inbound frame as device traffic. Host-originated
    /// envelopes and unknown shapes yield `None`.
    pub fn decode_device_message(payload: &[u8]) -> Option<DeviceMessage> {
        serde_json::from_slice(payload).ok()
    }
}
