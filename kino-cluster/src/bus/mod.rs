//! Channel-addressed broadcast bus
//!
//! Two interchangeable backends sit behind [`BroadcastBackend`]:
//! - [`LocalBus`]: in-process fan-out, single node only
//! - [`RedisBus`]: one Redis Pub/Sub channel per bus channel, reaches every node
//!
//! [`BroadcastBus`] picks one of them at startup and keeps it for the lifetime
//! of the process.

mod local;
mod redis_pubsub;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use kino_core::config::{BusBackend, Config};

use crate::Result;

pub use local::LocalBus;
pub use redis_pubsub::RedisBus;

/// Handle identifying one listener (usually one client connection)
pub type ListenerId = String;

/// Receiving end of a bus subscription
#[derive(Debug, Clone)]
pub struct Listener {
    id: ListenerId,
    sender: mpsc::UnboundedSender<String>,
}

impl Listener {
    /// Create a listener and the receiver its messages arrive on
    #[must_use]
    pub fn new(id: impl Into<ListenerId>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                sender,
            },
            rx,
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Hand a message to the listener. Returns false once the receiving side is gone.
    pub fn deliver(&self, message: String) -> bool {
        self.sender.send(message).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Capability surface shared by both bus backends.
///
/// All operations may be called concurrently for the same channel.
#[async_trait]
pub trait BroadcastBackend: Send + Sync {
    /// Start delivering messages published on `channel` to `listener`.
    /// Connecting an id that is already connected replaces the old listener.
    async fn connect(&self, channel: &str, listener: Listener) -> Result<()>;

    /// Stop delivering to the listener. Unknown listeners are ignored.
    async fn disconnect(&self, channel: &str, listener_id: &str) -> Result<()>;

    /// Publish `message` to every listener currently connected to `channel`.
    /// Returns how many receivers the backend handed the message to.
    async fn broadcast(&self, channel: &str, message: &str) -> Result<usize>;
}

/// The process-wide bus, fixed at startup from configuration
#[derive(Clone)]
pub enum BroadcastBus {
    Local(LocalBus),
    Redis(RedisBus),
}

impl BroadcastBus {
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.bus.backend {
            BusBackend::Local => {
                info!("Broadcast bus: local (single process)");
                Ok(Self::Local(LocalBus::new()))
            }
            BusBackend::Redis => {
                if config.redis.url.is_empty() {
                    return Err(crate::Error::Configuration(
                        "redis bus backend selected without redis.url".to_string(),
                    ));
                }
                info!("Broadcast bus: redis pub/sub");
                let bus = RedisBus::connect(&config.redis.url, &config.redis.key_prefix).await?;
                Ok(Self::Redis(bus))
            }
        }
    }

    #[must_use]
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Redis(_) => "redis",
        }
    }

    /// Serialize `value` as JSON and broadcast it
    pub async fn publish_json<T: Serialize + Sync>(&self, channel: &str, value: &T) -> Result<usize> {
        let payload = serde_json::to_string(value)?;
        self.broadcast(channel, &payload).await
    }

    /// Stop every background subscription owned by this bus
    pub async fn shutdown(&self) {
        match self {
            Self::Local(_) => {}
            Self::Redis(bus) => bus.shutdown().await,
        }
    }
}

#[async_trait]
impl BroadcastBackend for BroadcastBus {
    async fn connect(&self, channel: &str, listener: Listener) -> Result<()> {
        match self {
            Self::Local(bus) => bus.connect(channel, listener).await,
            Self::Redis(bus) => bus.connect(channel, listener).await,
        }
    }

    async fn disconnect(&self, channel: &str, listener_id: &str) -> Result<()> {
        match self {
            Self::Local(bus) => bus.disconnect(channel, listener_id).await,
            Self::Redis(bus) => bus.disconnect(channel, listener_id).await,
        }
    }

    async fn broadcast(&self, channel: &str, message: &str) -> Result<usize> {
        match self {
            Self::Local(bus) => bus.broadcast(channel, message).await,
            Self::Redis(bus) => bus.broadcast(channel, message).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_backend_selected_by_default() {
        let bus = BroadcastBus::from_config(&Config::default()).await.unwrap();
        assert_eq!(bus.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_redis_backend_requires_url() {
        let mut config = Config::default();
        config.bus.backend = BusBackend::Redis;
        config.redis.url = String::new();

        assert!(BroadcastBus::from_config(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_json() {
        let bus = BroadcastBus::Local(LocalBus::new());
        let (listener, mut rx) = Listener::new("conn1");
        bus.connect("video_status", listener).await.unwrap();

        let sent = bus
            .publish_json("video_status", &serde_json::json!({"kind": "video_status", "id": 1}))
            .await
            .unwrap();
        assert_eq!(sent, 1);
        let received: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(received["kind"], "video_status");
        assert_eq!(received["id"], 1);
    }

    #[test]
    fn test_listener_reports_closed_receiver() {
        let (listener, rx) = Listener::new("conn1");
        assert!(listener.deliver("first".to_string()));
        drop(rx);
        assert!(listener.is_closed());
        assert!(!listener.deliver("second".to_string()));
    }
}
