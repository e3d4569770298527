use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient, Direction};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Delivery, JobBroker};
use crate::models::TranscodeJob;
use crate::Result;

/// Redis list backed job queue.
///
/// Jobs are pushed on `{prefix}jobs:transcode`. Consumers atomically move each
/// job onto `{prefix}jobs:transcode:processing` and remove it from there on
/// ack, so a crashed worker leaves its in-flight jobs recoverable.
#[derive(Clone)]
pub struct RedisJobBroker {
    conn: ConnectionManager,
    queue_key: String,
    processing_key: String,
    poll_interval: Duration,
}

impl RedisJobBroker {
    pub async fn connect(redis_url: &str, key_prefix: &str, poll_interval: Duration) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let queue_key = format!("{key_prefix}jobs:transcode");
        info!(queue = %queue_key, "Redis job broker connected");

        Ok(Self {
            processing_key: format!("{queue_key}:processing"),
            queue_key,
            conn,
            poll_interval,
        })
    }

    /// Move every in-flight job back onto the queue. Call once at worker
    /// start-up, before consuming, to resume jobs of a crashed worker.
    pub async fn recover(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn
                .lmove(&self.processing_key, &self.queue_key, Direction::Left, Direction::Right)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            warn!(recovered, "Requeued in-flight jobs from a previous worker");
        }
        Ok(recovered)
    }

    /// Number of jobs waiting to be consumed
    pub async fn pending(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(&self.queue_key).await?)
    }

    async fn pop(&self) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .lmove(&self.queue_key, &self.processing_key, Direction::Right, Direction::Left)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match TranscodeJob::from_json(&payload) {
            Ok(job) => Ok(Some(Delivery { job, receipt: payload })),
            Err(e) => {
                // never redeliver a payload that cannot be parsed
                let _: i64 = conn.lrem(&self.processing_key, 1, &payload).await?;
                warn!(error = %e, payload = %payload, "Dropping malformed job");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl JobBroker for RedisJobBroker {
    async fn enqueue(&self, job: &TranscodeJob) -> Result<()> {
        let payload = job.to_json()?;
        let mut conn = self.conn.clone();
        let depth: i64 = conn.lpush(&self.queue_key, payload).await?;
        debug!(storage_key = %job.storage_key, depth, "Job enqueued in Redis");
        Ok(())
    }

    fn consume(&self, cancel: CancellationToken) -> BoxStream<'static, Result<Delivery>> {
        let broker = self.clone();
        stream::unfold((broker, cancel), |(broker, cancel)| async move {
            loop {
                if cancel.is_cancelled() {
                    return None;
                }
                match broker.pop().await {
                    Ok(Some(delivery)) => return Some((Ok(delivery), (broker, cancel))),
                    Ok(None) => {
                        tokio::select! {
                            () = cancel.cancelled() => return None,
                            () = tokio::time::sleep(broker.poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        tokio::select! {
                            () = cancel.cancelled() => return None,
                            () = tokio::time::sleep(broker.poll_interval) => {}
                        }
                        return Some((Err(e), (broker, cancel)));
                    }
                }
            }
        })
        .boxed()
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(&self.processing_key, 1, &delivery.receipt).await?;
        if removed == 0 {
            warn!(storage_key = %delivery.job.storage_key, "Acked job was not in the processing list");
        }
        Ok(())
    }
}
