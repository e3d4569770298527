use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{BroadcastBackend, Listener};
use crate::Result;

/// In-memory hub routing messages to listeners in this process
#[derive(Clone, Default)]
pub struct LocalBus {
    /// Map of channel -> live listeners
    channels: Arc<DashMap<String, Vec<Listener>>>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listeners connected to a channel
    #[must_use]
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |listeners| listeners.len())
    }

    /// Number of channels with at least one listener
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn remove(&self, channel: &str, listener_id: &str) -> bool {
        let mut removed = false;
        if let Some(mut listeners) = self.channels.get_mut(channel) {
            let before = listeners.len();
            listeners.retain(|l| l.id() != listener_id);
            removed = listeners.len() != before;
        }
        // Remove channel entry if no more listeners
        if self.channels.remove_if(channel, |_, listeners| listeners.is_empty()).is_some() {
            debug!(channel = %channel, "Channel has no more listeners, removed");
        }
        removed
    }
}

#[async_trait]
impl BroadcastBackend for LocalBus {
    async fn connect(&self, channel: &str, listener: Listener) -> Result<()> {
        let mut listeners = self.channels.entry(channel.to_string()).or_default();
        listeners.retain(|l| l.id() != listener.id());
        info!(channel = %channel, listener_id = %listener.id(), "Listener connected");
        listeners.push(listener);
        Ok(())
    }

    async fn disconnect(&self, channel: &str, listener_id: &str) -> Result<()> {
        if self.remove(channel, listener_id) {
            info!(channel = %channel, listener_id = %listener_id, "Listener disconnected");
        } else {
            debug!(
                channel = %channel,
                listener_id = %listener_id,
                "Attempted to disconnect unknown listener"
            );
        }
        Ok(())
    }

    async fn broadcast(&self, channel: &str, message: &str) -> Result<usize> {
        // Deliver from a snapshot so concurrent connect/disconnect never
        // touches the list being iterated.
        let snapshot: Vec<Listener> = self
            .channels
            .get(channel)
            .map(|listeners| listeners.clone())
            .unwrap_or_default();

        let mut sent_count = 0;
        let mut failed = Vec::new();

        for listener in &snapshot {
            if listener.deliver(message.to_string()) {
                sent_count += 1;
            } else {
                warn!(
                    channel = %channel,
                    listener_id = %listener.id(),
                    "Failed to deliver message, removing listener"
                );
                failed.push(listener.id().to_string());
            }
        }

        for listener_id in failed {
            self.remove(channel, &listener_id);
        }

        debug!(channel = %channel, sent_count, "Broadcast complete");
        Ok(sent_count)
    }
}
