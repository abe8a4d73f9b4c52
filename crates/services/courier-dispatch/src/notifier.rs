use crate::metrics;
use async_trait::async_trait;
use courier_types::{ChannelId, DispatchEvent};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

// Maximum number of events buffered per channel
const MAX_CHANNEL_CAPACITY: usize = 100;

/// Pushes events to participants. Delivery is at-most-once and publishing
/// never fails from the caller's point of view.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn publish(&self, channel: &ChannelId, event: &DispatchEvent);
}

/// Broadcast channels keyed by participant channel id.
#[derive(Debug, Default, Clone)]
pub struct BroadcastNotifier {
    channels: Arc<RwLock<HashMap<ChannelId, broadcast::Sender<DispatchEvent>>>>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the broadcast channel for `channel`
    fn get_or_create_channel(&self, channel: &ChannelId) -> broadcast::Sender<DispatchEvent> {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        let tx = channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(MAX_CHANNEL_CAPACITY).0)
            .clone();
        metrics::update_notifier_channels(channels.len());
        tx
    }

    pub fn subscribe(&self, channel: &ChannelId) -> broadcast::Receiver<DispatchEvent> {
        self.get_or_create_channel(channel).subscribe()
    }

    /// Drops channels nobody listens to any more. Returns how many remain.
    pub fn prune_idle(&self) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels.retain(|_, tx| tx.receiver_count() > 0);
        metrics::update_notifier_channels(channels.len());
        channels.len()
    }
}

#[async_trait]
impl EventNotifier for BroadcastNotifier {
    async fn publish(&self, channel: &ChannelId, event: &DispatchEvent) {
        let tx = {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            channels.get(channel).cloned()
        };
        match tx.map(|tx| tx.send(event.clone())) {
            Some(Ok(receivers)) => {
                tracing::debug!("Published {} to {} ({} receiver(s))", event.name(), channel, receivers)
            }
            // No subscriber; the event is dropped
            _ => tracing::debug!("Dropped {} for {}: no live session", event.name(), channel),
        }
    }
}
