use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BroadcastBackend, Listener, ListenerId};
use crate::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// One forwarding task per (channel, listener)
struct Subscription {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Forwarding task ended abnormally");
        }
    }
}

/// Bus backend mapping every channel onto a Redis Pub/Sub channel
/// `{key_prefix}{channel}`, so listeners in any process receive every publish.
#[derive(Clone)]
pub struct RedisBus {
    client: RedisClient,
    publisher: ConnectionManager,
    key_prefix: String,
    subscriptions: Arc<DashMap<(String, ListenerId), Subscription>>,
}

impl RedisBus {
    /// Open the publisher connection. Subscriber connections are opened per listener.
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        let publisher = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| Error::Timeout("connecting to Redis".to_string()))??;

        info!(key_prefix = %key_prefix, "Redis bus connected");

        Ok(Self {
            client,
            publisher,
            key_prefix: key_prefix.to_string(),
            subscriptions: Arc::new(DashMap::new()),
        })
    }

    fn redis_channel(&self, channel: &str) -> String {
        format!("{}{}", self.key_prefix, channel)
    }

    /// Number of active forwarding tasks
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Stop every forwarding task and wait for them to finish
    pub async fn shutdown(&self) {
        let keys: Vec<(String, ListenerId)> =
            self.subscriptions.iter().map(|entry| entry.key().clone()).collect();
        info!(count = keys.len(), "Shutting down Redis bus subscriptions");
        for key in keys {
            if let Some((_, subscription)) = self.subscriptions.remove(&key) {
                subscription.stop().await;
            }
        }
    }

    async fn forward(
        mut pubsub: redis::aio::PubSub,
        redis_channel: String,
        listener: Listener,
        cancel: CancellationToken,
    ) {
        {
            let mut stream = pubsub.on_message();
            loop {
                let msg = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    msg = stream.next() => msg,
                };
                let Some(msg) = msg else {
                    warn!(channel = %redis_channel, listener_id = %listener.id(), "Redis subscription stream ended");
                    break;
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, channel = %redis_channel, "Invalid payload");
                        continue;
                    }
                };

                if !listener.deliver(payload) {
                    debug!(
                        channel = %redis_channel,
                        listener_id = %listener.id(),
                        "Listener gone, stopping forwarding task"
                    );
                    break;
                }
            }
        }

        match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.unsubscribe(&redis_channel),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, channel = %redis_channel, "Unsubscribe failed"),
            Err(_) => debug!(channel = %redis_channel, "Timed out unsubscribing"),
        }
    }
}

#[async_trait]
impl BroadcastBackend for RedisBus {
    async fn connect(&self, channel: &str, listener: Listener) -> Result<()> {
        let redis_channel = self.redis_channel(channel);

        let mut pubsub = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_async_pubsub(),
        )
        .await
        .map_err(|_| Error::Timeout("getting Redis Pub/Sub connection".to_string()))??;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&redis_channel),
        )
        .await
        .map_err(|_| Error::Timeout(format!("subscribing to {redis_channel}")))??;

        let key = (channel.to_string(), listener.id().to_string());
        let listener_id = listener.id().to_string();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::forward(
            pubsub,
            redis_channel.clone(),
            listener,
            cancel.clone(),
        ));

        if let Some(previous) = self.subscriptions.insert(key, Subscription { cancel, handle }) {
            previous.stop().await;
        }

        info!(channel = %redis_channel, listener_id = %listener_id, "Listener subscribed");
        Ok(())
    }

    async fn disconnect(&self, channel: &str, listener_id: &str) -> Result<()> {
        let key = (channel.to_string(), listener_id.to_string());
        // Take the entry out before awaiting so no map guard is held
        let removed = self.subscriptions.remove(&key);
        match removed {
            Some((_, subscription)) => {
                subscription.stop().await;
                info!(channel = %channel, listener_id = %listener_id, "Listener unsubscribed");
            }
            None => {
                debug!(channel = %channel, listener_id = %listener_id, "Attempted to disconnect unknown listener");
            }
        }
        Ok(())
    }

    async fn broadcast(&self, channel: &str, message: &str) -> Result<usize> {
        let redis_channel = self.redis_channel(channel);
        let mut conn = self.publisher.clone();

        let receivers: usize = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish(&redis_channel, message),
        )
        .await
        .map_err(|_| Error::Timeout(format!("publishing to {redis_channel}")))??;

        debug!(channel = %redis_channel, receivers, "Published to Redis");
        Ok(receivers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://localhost:6379";

    fn test_prefix() -> String {
        format!("kino-test-{}:", nanoid::nanoid!(8))
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_broadcast_reaches_subscriber() {
        let bus = RedisBus::connect(REDIS_URL, &test_prefix()).await.unwrap();
        let (listener, mut rx) = Listener::new("conn1");
        bus.connect("room:R1", listener).await.unwrap();

        let receivers = bus.broadcast("room:R1", "hello").await.unwrap();
        assert_eq!(receivers, 1);

        let msg = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg, "hello");

        bus.shutdown().await;
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_no_delivery_after_disconnect() {
        let bus = RedisBus::connect(REDIS_URL, &test_prefix()).await.unwrap();
        let (listener, mut rx) = Listener::new("conn1");
        bus.connect("room:R1", listener).await.unwrap();

        bus.disconnect("room:R1", "conn1").await.unwrap();
        assert_eq!(bus.subscription_count(), 0);

        for n in 0..5 {
            let receivers = bus.broadcast("room:R1", &format!("late{n}")).await.unwrap();
            assert_eq!(receivers, 0);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The forwarding task owned the sender, so the channel is closed and empty
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_waits_for_forwarding_task() {
        let (listener, mut rx) = Listener::new("conn1");
        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                assert!(listener.deliver("before".to_string()));
                cancel.cancelled().await;
                // the listener is dropped only once the task ends
                tokio::task::yield_now().await;
            })
        };

        assert_eq!(rx.recv().await.unwrap(), "before");
        Subscription { cancel, handle }.stop().await;

        // stop returned, so the task and its sender are gone
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_channels_are_isolated() {
        let bus = RedisBus::connect(REDIS_URL, &test_prefix()).await.unwrap();
        let (l1, mut rx1) = Listener::new("a");
        let (l2, mut rx2) = Listener::new("b");
        bus.connect("room:R1", l1).await.unwrap();
        bus.connect("room:R2", l2).await.unwrap();

        bus.broadcast("room:R1", "only-r1").await.unwrap();

        let msg = timeout(Duration::from_secs(2), rx1.recv()).await.unwrap().unwrap();
        assert_eq!(msg, "only-r1");
        assert!(timeout(Duration::from_millis(200), rx2.recv()).await.is_err());

        bus.shutdown().await;
    }
}
